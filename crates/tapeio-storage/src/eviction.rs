//! Eviction policy of the archive cache.

use crate::cache::{ArchiveCacheEntry, EvictionJudge, EvictionJudgeFactory};
use crate::lock::LockManager;
use crate::topology::BucketTopologyHelper;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tapeio_common::{Clock, Result};
use tapeio_meta_store::{AccessRequestReferentialRepository, ObjectReferentialRepository};
use tracing::{debug, warn};

/// Builds the judge used by each eviction pass of the archive cache.
///
/// Protected from eviction:
/// - archives of file buckets kept forever in cache,
/// - every archive holding an entry of an object listed by a non-expired
///   access request (all segments of an object stay together),
/// - archives locked through the lock manager.
pub struct ArchiveCacheEvictionController {
    access_request_repository: Arc<AccessRequestReferentialRepository>,
    object_repository: Arc<ObjectReferentialRepository>,
    topology: Arc<BucketTopologyHelper>,
    lock_manager: LockManager<ArchiveCacheEntry>,
    clock: Arc<dyn Clock>,
}

impl ArchiveCacheEvictionController {
    pub fn new(
        access_request_repository: Arc<AccessRequestReferentialRepository>,
        object_repository: Arc<ObjectReferentialRepository>,
        topology: Arc<BucketTopologyHelper>,
        lock_manager: LockManager<ArchiveCacheEntry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            access_request_repository,
            object_repository,
            topology,
            lock_manager,
            clock,
        }
    }

    /// Snapshot the archives required by live access requests
    pub fn create_eviction_judge(&self) -> Result<Box<dyn EvictionJudge<ArchiveCacheEntry>>> {
        let requests = self
            .access_request_repository
            .find_non_expired_access_requests(self.clock.now())?;

        let mut objects_by_container: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for request in requests {
            objects_by_container
                .entry(request.container_name)
                .or_default()
                .extend(request.object_names);
        }

        let mut protected = HashSet::new();
        for (container, object_names) in objects_by_container {
            let file_bucket_id = match self.topology.get_file_bucket_from_container_name(&container)
            {
                Ok(file_bucket_id) => file_bucket_id,
                Err(e) => {
                    warn!("Ignoring access requests of container {}: {}", container, e);
                    continue;
                }
            };
            let object_names: Vec<String> = object_names.into_iter().collect();
            for object in self
                .object_repository
                .bulk_find(&container, &object_names)?
            {
                for entry in object.location.tar_entries() {
                    protected.insert(ArchiveCacheEntry::new(
                        file_bucket_id.clone(),
                        entry.tar_file_id.clone(),
                    ));
                }
            }
        }
        debug!(
            "Eviction judge protects {} archives required by access requests",
            protected.len()
        );

        Ok(Box::new(ArchiveCacheEvictionJudge {
            protected,
            topology: Arc::clone(&self.topology),
            lock_manager: self.lock_manager.clone(),
        }))
    }

    /// Factory handed to the archive cache
    pub fn judge_factory(self: &Arc<Self>) -> EvictionJudgeFactory<ArchiveCacheEntry> {
        let controller = Arc::clone(self);
        Arc::new(move || controller.create_eviction_judge())
    }

    #[must_use]
    pub const fn lock_manager(&self) -> &LockManager<ArchiveCacheEntry> {
        &self.lock_manager
    }
}

struct ArchiveCacheEvictionJudge {
    protected: HashSet<ArchiveCacheEntry>,
    topology: Arc<BucketTopologyHelper>,
    lock_manager: LockManager<ArchiveCacheEntry>,
}

impl EvictionJudge<ArchiveCacheEntry> for ArchiveCacheEvictionJudge {
    fn can_evict_entry(&self, key: &ArchiveCacheEntry) -> bool {
        !self
            .topology
            .keep_file_bucket_id_forever_in_cache(&key.file_bucket_id)
            && !self.protected.contains(key)
            && !self.lock_manager.is_locked(key)
    }
}
