//! TapeIO Storage - tape library offer engine
//!
//! This crate provides:
//! - Staging of written objects and their packing into tar archives
//! - Hand-off of sealed tars to the tape write queue
//! - A bounded cache of archives read back from tape, with LRU eviction
//! - Access requests tracking which archives must be read before objects
//!   become available
//! - Startup recovery of every on-disk artifact against the referentials
//!
//! # Layout on disk
//!
//! ```text
//! {inputFiles}/{container}/{storageId}        staged objects
//! {inputTars}/{fileBucket}/{tarId}.tmp        tar being built
//! {inputTars}/{fileBucket}/{tarId}            sealed tar waiting for tape
//! {cache}/{fileBucket}/{tarId}                tar read back from tape
//! ```

pub mod access_request;
pub mod alert;
pub mod basic_file_storage;
pub mod cache;
pub mod eviction;
pub mod lock;
pub mod offer;
pub mod tar;
pub mod tar_creator;
pub mod topology;
pub mod write_order;

// Re-exports
pub use access_request::AccessRequestManager;
pub use alert::{AlertLevel, AlertService, TracingAlertService};
pub use basic_file_storage::BasicFileStorage;
pub use cache::{ArchiveCacheEntry, ArchiveCacheStorage, ThreadExecutor};
pub use eviction::ArchiveCacheEvictionController;
pub use lock::{LockHandle, LockManager};
pub use offer::{ObjectMetadata, TapeLibraryStorage};
pub use tar::{TarAppender, TarFileDigestVerifier, TarFileRepairer};
pub use tar_creator::{
    FileBucketTarCreator, FileBucketTarCreatorBootstrapRecovery, TarCreatorManager,
    TarCreatorResources,
};
pub use topology::BucketTopologyHelper;
pub use write_order::{WriteOrderCreator, WriteOrderCreatorBootstrapRecovery};
