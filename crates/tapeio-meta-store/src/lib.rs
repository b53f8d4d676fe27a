//! TapeIO Metadata Store - durable referentials
//!
//! Persists where every object and archive physically lives, the access
//! requests waiting for archives to come back from tape, and the queue of
//! read/write orders consumed by the tape engine. Everything is stored in a
//! single redb database with bincode-encoded values.

pub mod access_request;
pub mod archive;
pub mod object;
pub mod queue;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use access_request::AccessRequestReferentialRepository;
pub use archive::ArchiveReferentialRepository;
pub use object::ObjectReferentialRepository;
pub use queue::{QueueRepository, QueueStore};
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
pub use types::*;
