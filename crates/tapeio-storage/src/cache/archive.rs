//! On-disk cache of archives read back from tape.
//!
//! Layout is `{cache_dir}/{fileBucketId}/{tarId}`. Space is reserved before
//! an archive is written, then the complete file is moved in and becomes
//! readable. Eviction deletes the least recently read archives.

use super::executor::EvictionExecutor;
use super::lru::{EvictionJudgeFactory, LruCache, LruCacheEntry};
use crate::alert::AlertService;
use crate::topology::BucketTopologyHelper;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tapeio_common::config::CacheConfig;
use tapeio_common::{Clock, Error, Result, is_safe_filename};
use tracing::{debug, info, warn};

/// Key of a cached archive
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveCacheEntry {
    pub file_bucket_id: String,
    pub tar_id: String,
}

impl ArchiveCacheEntry {
    pub fn new(file_bucket_id: impl Into<String>, tar_id: impl Into<String>) -> Self {
        Self {
            file_bucket_id: file_bucket_id.into(),
            tar_id: tar_id.into(),
        }
    }
}

impl fmt::Display for ArchiveCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_bucket_id, self.tar_id)
    }
}

/// Bounded archive cache
pub struct ArchiveCacheStorage {
    cache_dir: PathBuf,
    topology: Arc<BucketTopologyHelper>,
    lru: LruCache<ArchiveCacheEntry>,
    clock: Arc<dyn Clock>,
}

impl ArchiveCacheStorage {
    /// Scan the cache directory and index every archive found.
    ///
    /// Fails on files at the root of the cache directory, unknown file
    /// buckets and illegal archive names.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        topology: Arc<BucketTopologyHelper>,
        config: &CacheConfig,
        judge_factory: EvictionJudgeFactory<ArchiveCacheEntry>,
        executor: Arc<dyn EvictionExecutor>,
        alert_service: Arc<dyn AlertService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        let initial_entries = scan_cache_dir(&cache_dir, &topology)?;
        let usage: u64 = initial_entries.iter().map(|e| e.weight).sum();
        info!(
            "Archive cache {} holds {} archives ({} bytes)",
            cache_dir.display(),
            initial_entries.len(),
            usage
        );

        let listener_dir = cache_dir.clone();
        let lru = LruCache::new(
            config.max_storage_space,
            config.eviction_storage_space_threshold,
            config.safe_storage_space_threshold,
            judge_factory,
            Box::new(move |entry: &ArchiveCacheEntry| evict_file(&listener_dir, entry)),
            initial_entries,
            executor,
            alert_service,
        )?;
        Ok(Self {
            cache_dir,
            topology,
            lru,
            clock,
        })
    }

    /// Reserve space for an archive about to be written into the cache
    pub fn reserve_archive_storage_space(
        &self,
        file_bucket_id: &str,
        tar_id: &str,
        size: u64,
    ) -> Result<()> {
        let path = self.checked_path(file_bucket_id, tar_id)?;
        if size == 0 {
            return Err(Error::invalid_argument(format!(
                "empty archive {file_bucket_id}/{tar_id}"
            )));
        }
        let entry = ArchiveCacheEntry::new(file_bucket_id, tar_id);
        if self.lru.contains_entry(&entry) {
            return Err(Error::invalid_argument(format!(
                "archive {entry} already exists in cache"
            )));
        }
        if self.lru.is_reserved_entry(&entry) {
            return Err(Error::invalid_argument(format!(
                "reservation for archive {entry} already exists"
            )));
        }
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        self.lru
            .reserve_entry(LruCacheEntry::new(entry, size, self.clock.now()))
    }

    /// Move a completely written archive into the cache.
    ///
    /// The file length must match the reservation. On failure the
    /// reservation is left in place so that the move can be retried.
    pub fn move_archive_to_cache(
        &self,
        source: &Path,
        file_bucket_id: &str,
        tar_id: &str,
    ) -> Result<()> {
        let target = self.checked_path(file_bucket_id, tar_id)?;
        let metadata = fs::metadata(source)?;
        if !metadata.is_file() {
            return Err(Error::NotRegularFile(source.display().to_string()));
        }
        if target.exists() {
            return Err(Error::AlreadyExists(target.display().to_string()));
        }
        let entry = ArchiveCacheEntry::new(file_bucket_id, tar_id);
        let reserved = self.lru.reserved_entry(&entry).ok_or_else(|| {
            Error::invalid_argument(format!("archive {entry} is not reserved in cache"))
        })?;
        if metadata.len() != reserved.weight {
            return Err(Error::FileLengthMismatch {
                path: source.display().to_string(),
                expected: reserved.weight,
                actual: metadata.len(),
            });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(source, &target)?;
        let moved = fs::metadata(&target)?.len();
        if moved != reserved.weight {
            if let Err(e) = fs::rename(&target, source) {
                warn!("Could not move {} back to {}: {}", target.display(), source.display(), e);
            }
            return Err(Error::FileLengthMismatch {
                path: target.display().to_string(),
                expected: reserved.weight,
                actual: moved,
            });
        }

        self.lru
            .update_entry_access_timestamp(&entry, self.clock.now());
        self.lru.confirm_reservation(&entry)?;
        debug!("Archive {} moved to cache", entry);
        Ok(())
    }

    /// Release a reservation whose archive will never be written
    pub fn cancel_reserved_archive(&self, file_bucket_id: &str, tar_id: &str) -> Result<()> {
        let entry = ArchiveCacheEntry::new(file_bucket_id, tar_id);
        if !self.lru.is_reserved_entry(&entry) {
            return Err(Error::invalid_argument(format!(
                "archive {entry} is not reserved in cache"
            )));
        }
        self.lru.cancel_reservation(&entry)
    }

    /// Open a cached archive and refresh its last access time. Reserved
    /// archives are never returned.
    pub fn try_read_archive(&self, file_bucket_id: &str, tar_id: &str) -> Result<Option<File>> {
        let path = self.checked_path(file_bucket_id, tar_id)?;
        if !self.contains_archive(file_bucket_id, tar_id) {
            return Ok(None);
        }
        match File::open(&path) {
            Ok(file) => {
                let entry = ArchiveCacheEntry::new(file_bucket_id, tar_id);
                self.lru
                    .update_entry_access_timestamp(&entry, self.clock.now());
                Ok(Some(file))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Could not open {} for read. Concurrent eviction?", path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn contains_archive(&self, file_bucket_id: &str, tar_id: &str) -> bool {
        self.lru
            .contains_entry(&ArchiveCacheEntry::new(file_bucket_id, tar_id))
    }

    #[must_use]
    pub fn is_archive_reserved(&self, file_bucket_id: &str, tar_id: &str) -> bool {
        self.lru
            .is_reserved_entry(&ArchiveCacheEntry::new(file_bucket_id, tar_id))
    }

    #[must_use]
    pub fn get_max_storage_space(&self) -> u64 {
        self.lru.max_capacity()
    }

    #[must_use]
    pub fn get_eviction_storage_space_threshold(&self) -> u64 {
        self.lru.eviction_capacity()
    }

    #[must_use]
    pub fn get_safe_storage_space_threshold(&self) -> u64 {
        self.lru.safe_capacity()
    }

    #[must_use]
    pub fn get_current_storage_space_usage(&self) -> u64 {
        self.lru.current_capacity()
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn checked_path(&self, file_bucket_id: &str, tar_id: &str) -> Result<PathBuf> {
        if !self.topology.is_valid_file_bucket_id(file_bucket_id) {
            return Err(Error::invalid_argument(format!(
                "invalid file bucket id {file_bucket_id}"
            )));
        }
        if !is_safe_filename(tar_id) {
            return Err(Error::IllegalName(tar_id.to_string()));
        }
        Ok(self.cache_dir.join(file_bucket_id).join(tar_id))
    }
}

fn scan_cache_dir(
    cache_dir: &Path,
    topology: &BucketTopologyHelper,
) -> Result<Vec<LruCacheEntry<ArchiveCacheEntry>>> {
    let mut entries = Vec::new();
    for bucket_dir in fs::read_dir(cache_dir)? {
        let bucket_dir = bucket_dir?;
        let path = bucket_dir.path();
        if !bucket_dir.file_type()?.is_dir() {
            return Err(Error::storage(format!(
                "unexpected file {} at root of cache directory {}, expected {{fileBucketId}}/{{tarId}}",
                path.display(),
                cache_dir.display()
            )));
        }
        let file_bucket_id = file_name(&path)?;
        if !topology.is_valid_file_bucket_id(&file_bucket_id) {
            return Err(Error::storage(format!(
                "unknown file bucket {file_bucket_id} in cache directory"
            )));
        }

        for file in fs::read_dir(&path)? {
            let file = file?;
            let file_path = file.path();
            let metadata = fs::metadata(&file_path)?;
            if !metadata.is_file() {
                debug!("Ignoring non regular file {}", file_path.display());
                continue;
            }
            let tar_id = file_name(&file_path)?;
            if !is_safe_filename(&tar_id) {
                return Err(Error::IllegalName(file_path.display().to_string()));
            }
            let last_access: DateTime<Utc> = metadata
                .accessed()
                .or_else(|_| metadata.modified())
                .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
            entries.push(LruCacheEntry::new(
                ArchiveCacheEntry::new(file_bucket_id.clone(), tar_id),
                metadata.len(),
                last_access,
            ));
        }
    }
    Ok(entries)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::IllegalName(path.display().to_string()))
}

fn evict_file(cache_dir: &Path, entry: &ArchiveCacheEntry) {
    let path = cache_dir.join(&entry.file_bucket_id).join(&entry.tar_id);
    info!("Deleting unused archive {}", entry);
    if let Err(e) = fs::remove_file(&path) {
        warn!("Could not delete {} from cache: {}", path.display(), e);
    }
}
