//! Archive cache: weighted LRU index, background eviction and the on-disk
//! archive store built on them.

pub mod archive;
pub mod executor;
pub mod lru;

pub use archive::{ArchiveCacheEntry, ArchiveCacheStorage};
pub use executor::{EvictionExecutor, EvictionTask, ThreadExecutor};
pub use lru::{EvictionJudge, EvictionJudgeFactory, EvictionListener, LruCache, LruCacheEntry};
