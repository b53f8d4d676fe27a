//! Configuration types for TapeIO
//!
//! The offer configuration is loaded once at startup and handed to each
//! component explicitly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Hard upper bound for `max_access_request_size`
pub const MAX_ACCESS_REQUEST_SIZE: usize = 100_000;

/// Root configuration of a tape library offer
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferConfig {
    /// On-disk locations
    pub storage: StorageConfig,
    /// Tar packing configuration
    pub tar: TarConfig,
    /// Archive cache sizing
    pub cache: CacheConfig,
    /// Access request lifecycle
    pub access_request: AccessRequestConfig,
    /// Bucket and file bucket topology
    pub topology: TopologyConfig,
}

impl OfferConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.tar.validate()?;
        self.cache.validate()?;
        self.access_request.validate()
    }
}

/// Directories and database paths
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Staging directory for objects not yet packed into tars
    pub input_files_dir: PathBuf,
    /// Directory of tars being built or waiting to be written to tape
    pub input_tars_dir: PathBuf,
    /// Root of the archive cache
    pub cache_dir: PathBuf,
    /// Referential database file
    pub meta_db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            input_files_dir: PathBuf::from("/var/lib/tapeio/inputFiles"),
            input_tars_dir: PathBuf::from("/var/lib/tapeio/inputTars"),
            cache_dir: PathBuf::from("/var/lib/tapeio/cache"),
            meta_db_path: PathBuf::from("/var/lib/tapeio/meta.redb"),
        }
    }
}

/// Tar packing limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TarConfig {
    /// Maximum content size of a single tar entry
    pub max_tar_entry_size: u64,
    /// Maximum size of a tar file, headers and footer included
    pub max_tar_file_size: u64,
    /// Maximum number of ids per referential bulk lookup
    pub bulk_size: usize,
}

impl Default for TarConfig {
    fn default() -> Self {
        Self {
            max_tar_entry_size: 10 * 1024 * 1024,       // 10 MB
            max_tar_file_size: 10 * 1024 * 1024 * 1024, // 10 GB
            bulk_size: 1000,
        }
    }
}

impl TarConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tar_entry_size == 0 {
            return Err(Error::config("max_tar_entry_size must be positive"));
        }
        // One header, one full entry and the footer must fit in an empty tar
        if self.max_tar_file_size < self.max_tar_entry_size.div_ceil(512) * 512 + 512 * 3 {
            return Err(Error::config(
                "max_tar_file_size too small for max_tar_entry_size",
            ));
        }
        if self.bulk_size == 0 {
            return Err(Error::config("bulk_size must be positive"));
        }
        Ok(())
    }
}

/// Archive cache thresholds, in bytes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard limit of reserved plus cached bytes
    pub max_storage_space: u64,
    /// Usage above which a background eviction starts
    pub eviction_storage_space_threshold: u64,
    /// Usage an eviction pass tries to get down to
    pub safe_storage_space_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_storage_space: 100 * 1024 * 1024 * 1024,               // 100 GB
            eviction_storage_space_threshold: 80 * 1024 * 1024 * 1024, // 80 GB
            safe_storage_space_threshold: 60 * 1024 * 1024 * 1024,     // 60 GB
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.safe_storage_space_threshold == 0 {
            return Err(Error::config("safe_storage_space_threshold must be positive"));
        }
        if self.eviction_storage_space_threshold <= self.safe_storage_space_threshold {
            return Err(Error::config(
                "eviction threshold must be greater than safe threshold",
            ));
        }
        if self.max_storage_space <= self.eviction_storage_space_threshold {
            return Err(Error::config(
                "max storage space must be greater than eviction threshold",
            ));
        }
        Ok(())
    }
}

/// Access request lifecycle settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessRequestConfig {
    /// Maximum number of objects in a single access request
    pub max_access_request_size: usize,
    /// Time a ready access request stays readable
    pub expiration_delay_secs: u64,
    /// Time after readiness when the access request row is purged
    pub purge_delay_secs: u64,
    /// Period of the expiration handler
    pub cleanup_interval_secs: u64,
    /// Attempts of an optimistic update before giving up
    pub max_update_retries: u32,
    /// Tenant allowed to query other tenants' access requests
    pub admin_tenant: u32,
}

impl Default for AccessRequestConfig {
    fn default() -> Self {
        Self {
            max_access_request_size: 10_000,
            expiration_delay_secs: 30 * 24 * 3600, // 30 days
            purge_delay_secs: 60 * 24 * 3600,      // 60 days
            cleanup_interval_secs: 3600,
            max_update_retries: 3,
            admin_tenant: 1,
        }
    }
}

impl AccessRequestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_access_request_size == 0
            || self.max_access_request_size > MAX_ACCESS_REQUEST_SIZE
        {
            return Err(Error::config(format!(
                "max_access_request_size must be within 1..={MAX_ACCESS_REQUEST_SIZE}"
            )));
        }
        if self.expiration_delay_secs == 0 {
            return Err(Error::config("expiration_delay_secs must be positive"));
        }
        if self.purge_delay_secs < self.expiration_delay_secs {
            return Err(Error::config(
                "purge_delay_secs must not be lower than expiration_delay_secs",
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::config("cleanup_interval_secs must be positive"));
        }
        if self.max_update_retries == 0 {
            return Err(Error::config("max_update_retries must be positive"));
        }
        Ok(())
    }
}

/// Tenant group sharing a tar buffering policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BucketConfig {
    pub tenants: Vec<u32>,
    /// Maximum time a tar stays open after its first entry
    pub tar_buffering_timeout_minutes: i64,
}

/// Group of data category folders sharing a tar pipeline
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileBucketConfig {
    /// Data category folders routed to this file bucket. Ignored for the
    /// `default` file bucket, which takes every unlisted folder.
    #[serde(default)]
    pub folders: Vec<String>,
    /// Never evict archives of this file bucket from the cache
    #[serde(default)]
    pub keep_forever_in_cache: bool,
}

/// Buckets keyed by bucket name, file buckets keyed by file bucket name
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub buckets: BTreeMap<String, BucketConfig>,
    pub file_buckets: BTreeMap<String, FileBucketConfig>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(
            "default".to_string(),
            BucketConfig {
                tenants: vec![0, 1],
                tar_buffering_timeout_minutes: 60,
            },
        );
        let mut file_buckets = BTreeMap::new();
        file_buckets.insert("default".to_string(), FileBucketConfig::default());
        file_buckets.insert(
            "metadata".to_string(),
            FileBucketConfig {
                folders: vec!["unit".to_string(), "objectGroup".to_string()],
                keep_forever_in_cache: true,
            },
        );
        file_buckets.insert(
            "objects".to_string(),
            FileBucketConfig {
                folders: vec!["object".to_string()],
                keep_forever_in_cache: false,
            },
        );
        Self {
            buckets,
            file_buckets,
        }
    }
}
