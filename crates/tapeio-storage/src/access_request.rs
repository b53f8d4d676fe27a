//! Access requests: staging objects back from tape before they can be read.
//!
//! An access request lists objects of one container. Archives holding those
//! objects that are on tape and absent from the cache are "unavailable": a
//! read order is queued for each of them, and the request stays NOT_READY
//! until every one of them has been copied into the archive cache. It then
//! becomes READY until its expiration date, and is purged at its purge
//! date.

use crate::cache::ArchiveCacheStorage;
use crate::topology::BucketTopologyHelper;
use chrono::Duration;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tapeio_common::config::{AccessRequestConfig, MAX_ACCESS_REQUEST_SIZE};
use tapeio_common::{
    AccessRequestStatus, Clock, Error, QueueMessage, QueueMessageType, ReadOrder, Result,
};
use tapeio_meta_store::{
    AccessRequestEntity, AccessRequestReferentialRepository, ArchiveLocation,
    ArchiveReferentialEntity, ArchiveReferentialRepository, ObjectReferentialRepository,
    QueueRepository,
};
use tracing::{debug, error, info, warn};

/// Bounds of the random pause before retrying a conflicting update
const RETRY_BACKOFF_MILLIS: std::ops::Range<u64> = 10..1000;

struct ExpirationHandler {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Access request state machine
pub struct AccessRequestManager {
    object_repository: Arc<ObjectReferentialRepository>,
    archive_repository: Arc<ArchiveReferentialRepository>,
    access_request_repository: Arc<AccessRequestReferentialRepository>,
    archive_cache: Arc<ArchiveCacheStorage>,
    topology: Arc<BucketTopologyHelper>,
    queue: Arc<dyn QueueRepository>,
    clock: Arc<dyn Clock>,
    max_access_request_size: usize,
    expiration_delay: Duration,
    purge_delay: Duration,
    cleanup_interval: std::time::Duration,
    max_update_retries: u32,
    admin_tenant: u32,
    expiration_handler: Mutex<Option<ExpirationHandler>>,
}

impl AccessRequestManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        object_repository: Arc<ObjectReferentialRepository>,
        archive_repository: Arc<ArchiveReferentialRepository>,
        access_request_repository: Arc<AccessRequestReferentialRepository>,
        archive_cache: Arc<ArchiveCacheStorage>,
        topology: Arc<BucketTopologyHelper>,
        queue: Arc<dyn QueueRepository>,
        clock: Arc<dyn Clock>,
        config: &AccessRequestConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            object_repository,
            archive_repository,
            access_request_repository,
            archive_cache,
            topology,
            queue,
            clock,
            max_access_request_size: config.max_access_request_size.min(MAX_ACCESS_REQUEST_SIZE),
            expiration_delay: delay(config.expiration_delay_secs)?,
            purge_delay: delay(config.purge_delay_secs)?,
            cleanup_interval: std::time::Duration::from_secs(config.cleanup_interval_secs),
            max_update_retries: config.max_update_retries,
            admin_tenant: config.admin_tenant,
            expiration_handler: Mutex::new(None),
        })
    }

    /// New opaque access request id
    #[must_use]
    pub fn generate_access_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Register an access request for `object_names` of a container and
    /// queue a read order for every archive it is waiting for. Returns the
    /// access request id.
    pub fn create_access_request(
        &self,
        container_name: &str,
        object_names: &[String],
        tenant: u32,
    ) -> Result<String> {
        self.check_object_names(object_names)?;
        let file_bucket_id = self
            .topology
            .get_file_bucket_from_container_name(container_name)?;

        let unavailable = self.unavailable_archives(container_name, &file_bucket_id, object_names)?;
        let now = self.clock.now();
        let request_id = Self::generate_access_request_id();
        let ready = unavailable.is_empty();
        let entity = AccessRequestEntity {
            request_id: request_id.clone(),
            container_name: container_name.to_string(),
            object_names: object_names.to_vec(),
            creation_date: now,
            ready_date: ready.then_some(now),
            expiration_date: ready.then(|| now + self.expiration_delay),
            purge_date: ready.then(|| now + self.purge_delay),
            unavailable_archive_ids: unavailable.iter().map(|a| a.archive_id.clone()).collect(),
            tenant,
            version: 0,
        };
        self.access_request_repository.insert(&entity)?;

        for archive in &unavailable {
            let read_order = self.read_order(archive, &file_bucket_id)?;
            self.queue.add_if_absent(QueueMessage::ReadOrder(read_order))?;
        }
        info!(
            "Access request {} created for {} objects of {} ({} archives to read from tape)",
            request_id,
            object_names.len(),
            container_name,
            unavailable.len()
        );
        Ok(request_id)
    }

    /// Status of each access request id. Unknown ids, and ids of other
    /// tenants outside of admin cross-tenant mode, are NOT_FOUND.
    pub fn check_access_request_statuses(
        &self,
        request_ids: &[String],
        tenant: u32,
        admin_cross_tenant: bool,
    ) -> Result<HashMap<String, AccessRequestStatus>> {
        let mut unique = HashSet::with_capacity(request_ids.len());
        for request_id in request_ids {
            check_access_request_id(request_id)?;
            if !unique.insert(request_id.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "duplicate access request id {request_id}"
                )));
            }
        }

        let skip_tenant_check = self.skip_tenant_check(tenant, admin_cross_tenant);
        let now = self.clock.now();
        let mut statuses = HashMap::with_capacity(request_ids.len());
        for entity in self
            .access_request_repository
            .find_by_request_ids(request_ids)?
        {
            let status = if entity.tenant != tenant && !skip_tenant_check {
                warn!(
                    "Illegal access to access request {} of tenant {} from tenant {}",
                    entity.request_id, entity.tenant, tenant
                );
                AccessRequestStatus::NotFound
            } else {
                entity.status(now)
            };
            statuses.insert(entity.request_id, status);
        }
        for request_id in request_ids {
            statuses
                .entry(request_id.clone())
                .or_insert(AccessRequestStatus::NotFound);
        }
        Ok(statuses)
    }

    /// Delete an access request and cancel the read orders nobody else
    /// needs. Removing an unknown request is a no-op.
    pub fn remove_access_request(
        &self,
        request_id: &str,
        tenant: u32,
        admin_cross_tenant: bool,
    ) -> Result<()> {
        check_access_request_id(request_id)?;
        let Some(entity) = self
            .access_request_repository
            .find_by_request_id(request_id)?
        else {
            warn!("No such access request {}. Already deleted?", request_id);
            return Ok(());
        };
        if entity.tenant != tenant && !self.skip_tenant_check(tenant, admin_cross_tenant) {
            warn!(
                "Illegal access to access request {} of tenant {} from tenant {}",
                request_id, entity.tenant, tenant
            );
            return Ok(());
        }

        if self
            .access_request_repository
            .delete_access_request_by_id(request_id)?
        {
            info!("Access request {} removed", request_id);
            self.cancel_read_orders(&entity)?;
        }
        Ok(())
    }

    /// Whether every object can be read right now, without tape access
    pub fn check_object_availability(
        &self,
        container_name: &str,
        object_names: &[String],
    ) -> Result<bool> {
        self.check_object_names(object_names)?;
        let file_bucket_id = self
            .topology
            .get_file_bucket_from_container_name(container_name)?;
        let unavailable = self.unavailable_archives(container_name, &file_bucket_id, object_names)?;
        if unavailable.is_empty() {
            debug!("Objects of {} are available for immediate access", container_name);
            Ok(true)
        } else {
            warn!(
                "{} archives of {} must be read from tape before objects are available",
                unavailable.len(),
                container_name
            );
            Ok(false)
        }
    }

    /// Drop `archive_id` from the requests waiting for it, promoting to
    /// READY those with nothing left to wait for
    pub fn update_access_request_when_archive_ready(&self, archive_id: &str) -> Result<()> {
        for entity in self
            .access_request_repository
            .find_by_unavailable_archive_id(archive_id)?
        {
            self.update_with_ready_archive(archive_id, entity)?;
        }
        Ok(())
    }

    fn update_with_ready_archive(
        &self,
        archive_id: &str,
        mut entity: AccessRequestEntity,
    ) -> Result<()> {
        for _ in 0..self.max_update_retries {
            let updated = self.with_ready_archive(archive_id, &entity);
            if self.access_request_repository.update_access_request(&updated)? {
                if updated.is_ready() && !entity.is_ready() {
                    info!("Access request {} is ready", updated.request_id);
                }
                return Ok(());
            }

            warn!(
                "Concurrent update of access request {}. Retrying",
                entity.request_id
            );
            let pause = rand::thread_rng().gen_range(RETRY_BACKOFF_MILLIS);
            thread::sleep(std::time::Duration::from_millis(pause));

            match self
                .access_request_repository
                .find_by_request_id(&entity.request_id)?
            {
                Some(refreshed) => entity = refreshed,
                None => {
                    info!("Access request {} deleted meanwhile", entity.request_id);
                    return Ok(());
                }
            }
        }
        Err(Error::ConcurrentUpdate {
            id: entity.request_id,
            attempts: self.max_update_retries,
        })
    }

    fn with_ready_archive(
        &self,
        archive_id: &str,
        entity: &AccessRequestEntity,
    ) -> AccessRequestEntity {
        let mut updated = entity.clone();
        updated.unavailable_archive_ids.retain(|id| id != archive_id);
        if updated.ready_date.is_none() && updated.unavailable_archive_ids.is_empty() {
            let now = self.clock.now();
            updated.ready_date = Some(now);
            updated.expiration_date = Some(now + self.expiration_delay);
            updated.purge_date = Some(now + self.purge_delay);
        }
        updated
    }

    /// One pass of the expiration handler: purge requests past their purge
    /// date, then promote requests whose archives reached the cache without
    /// the request being updated.
    pub fn run_cleanup(&self) -> Result<()> {
        let purged = self
            .access_request_repository
            .cleanup_and_get_expired_access_requests(self.clock.now())?;
        for entity in &purged {
            info!("Expired access request {} purged", entity.request_id);
        }
        self.fix_access_request_ready_status()
    }

    fn fix_access_request_ready_status(&self) -> Result<()> {
        let mut candidates = BTreeSet::new();
        for entity in self.access_request_repository.find_non_ready_access_requests()? {
            let file_bucket_id = match self
                .topology
                .get_file_bucket_from_container_name(&entity.container_name)
            {
                Ok(file_bucket_id) => file_bucket_id,
                Err(e) => {
                    warn!("Skipping access request {}: {}", entity.request_id, e);
                    continue;
                }
            };
            for archive_id in entity.unavailable_archive_ids {
                candidates.insert((file_bucket_id.clone(), archive_id));
            }
        }

        let ready_archive_ids: BTreeSet<String> = candidates
            .into_iter()
            .filter(|(file_bucket_id, archive_id)| {
                self.archive_cache.contains_archive(file_bucket_id, archive_id)
            })
            .map(|(_, archive_id)| archive_id)
            .collect();
        for archive_id in ready_archive_ids {
            warn!(
                "Archive {} is in cache but access requests still wait for it. Fixing",
                archive_id
            );
            self.update_access_request_when_archive_ready(&archive_id)?;
        }
        Ok(())
    }

    /// Run `run_cleanup` every cleanup interval on a background thread
    pub fn start_expiration_handler(self: &Arc<Self>) -> Result<()> {
        let mut handler = self.expiration_handler.lock();
        if handler.is_some() {
            return Err(Error::internal("expiration handler already started"));
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = self.cleanup_interval;
        let handle = thread::Builder::new()
            .name("access-request-cleanup".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    if let Err(e) = manager.run_cleanup() {
                        error!("Access request cleanup failed: {}", e);
                    }
                }
                debug!("Access request cleanup thread stopped");
            })?;
        *handler = Some(ExpirationHandler {
            shutdown_tx,
            handle,
        });
        info!(
            "Access request expiration handler started (every {:?})",
            self.cleanup_interval
        );
        Ok(())
    }

    /// Stop the expiration handler and wait for its thread
    pub fn shutdown(&self) {
        let Some(handler) = self.expiration_handler.lock().take() else {
            return;
        };
        let _ = handler.shutdown_tx.send(());
        // The last reference may be dropped by the cleanup thread itself
        if handler.handle.thread().id() == thread::current().id() {
            return;
        }
        if handler.handle.join().is_err() {
            error!("Access request cleanup thread panicked");
        }
    }

    fn check_object_names(&self, object_names: &[String]) -> Result<()> {
        if object_names.is_empty() {
            return Err(Error::invalid_request("empty object name list"));
        }
        if object_names.len() > self.max_access_request_size {
            return Err(Error::invalid_request(format!(
                "too many objects: {}, max: {}",
                object_names.len(),
                self.max_access_request_size
            )));
        }
        let mut unique = HashSet::with_capacity(object_names.len());
        let duplicates: BTreeSet<&str> = object_names
            .iter()
            .filter(|name| !unique.insert(name.as_str()))
            .map(String::as_str)
            .take(10)
            .collect();
        if !duplicates.is_empty() {
            return Err(Error::invalid_request(format!(
                "duplicate object names {duplicates:?}"
            )));
        }
        if object_names.iter().any(String::is_empty) {
            return Err(Error::invalid_request("empty object name"));
        }
        Ok(())
    }

    /// Archives on tape and not cached that hold entries of the objects.
    ///
    /// Objects unknown or still staged as input files are readable from
    /// disk. So are tars still being built or waiting to be written.
    fn unavailable_archives(
        &self,
        container_name: &str,
        file_bucket_id: &str,
        object_names: &[String],
    ) -> Result<Vec<ArchiveReferentialEntity>> {
        let tar_ids: BTreeSet<String> = self
            .object_repository
            .bulk_find(container_name, object_names)?
            .iter()
            .flat_map(|object| object.location.tar_entries())
            .map(|entry| entry.tar_file_id.clone())
            .collect();
        if tar_ids.is_empty() {
            return Ok(Vec::new());
        }

        let tar_ids: Vec<String> = tar_ids.into_iter().collect();
        let archives = self.archive_repository.bulk_find(&tar_ids)?;
        if archives.len() != tar_ids.len() {
            let found: HashSet<&str> = archives.iter().map(|a| a.archive_id.as_str()).collect();
            let missing: Vec<&str> = tar_ids
                .iter()
                .map(String::as_str)
                .filter(|id| !found.contains(id))
                .collect();
            return Err(Error::referential(format!("unknown archive ids {missing:?}")));
        }

        Ok(archives
            .into_iter()
            .filter(|archive| matches!(archive.location, ArchiveLocation::OnTape { .. }))
            .filter(|archive| {
                !self
                    .archive_cache
                    .contains_archive(file_bucket_id, &archive.archive_id)
            })
            .collect())
    }

    fn read_order(
        &self,
        archive: &ArchiveReferentialEntity,
        file_bucket_id: &str,
    ) -> Result<ReadOrder> {
        let ArchiveLocation::OnTape {
            tape_code,
            file_position,
        } = &archive.location
        else {
            return Err(Error::referential(format!(
                "archive {} expected on tape, found {}",
                archive.archive_id, archive.location
            )));
        };
        let size = archive.size.ok_or_else(|| {
            Error::referential(format!("archive {} has no size", archive.archive_id))
        })?;
        Ok(ReadOrder {
            tape_code: tape_code.clone(),
            file_position: *file_position,
            file_name: archive.archive_id.clone(),
            bucket: self
                .topology
                .get_bucket_from_file_bucket(file_bucket_id)?
                .to_string(),
            file_bucket_id: file_bucket_id.to_string(),
            size,
        })
    }

    fn cancel_read_orders(&self, deleted: &AccessRequestEntity) -> Result<()> {
        let to_check: BTreeSet<String> = deleted.unavailable_archive_ids.iter().cloned().collect();
        if to_check.is_empty() {
            return Ok(());
        }
        let to_cancel = self
            .access_request_repository
            .exclude_archive_ids_still_required_by_access_requests(&to_check)?;
        for archive_id in &to_cancel {
            if self
                .queue
                .try_cancel_if_not_started(QueueMessageType::ReadOrder, archive_id)?
            {
                debug!("Read order of archive {} cancelled", archive_id);
            }
        }

        // An access request may have been created for the same archives
        // between the check and the cancellation
        for archive_id in &to_cancel {
            self.requeue_if_required(archive_id)?;
        }
        Ok(())
    }

    fn requeue_if_required(&self, archive_id: &str) -> Result<()> {
        let requests = self
            .access_request_repository
            .find_by_unavailable_archive_id(archive_id)?;
        let Some(request) = requests.first() else {
            return Ok(());
        };
        warn!(
            "Concurrent access request created for archive {}. Queueing its read order again",
            archive_id
        );
        let file_bucket_id = self
            .topology
            .get_file_bucket_from_container_name(&request.container_name)?;
        let archive = self
            .archive_repository
            .find(archive_id)?
            .ok_or_else(|| Error::referential(format!("unknown archive {archive_id}")))?;
        let read_order = self.read_order(&archive, &file_bucket_id)?;
        self.queue.add_if_absent(QueueMessage::ReadOrder(read_order))?;
        Ok(())
    }

    const fn skip_tenant_check(&self, tenant: u32, admin_cross_tenant: bool) -> bool {
        admin_cross_tenant && tenant == self.admin_tenant
    }
}

impl Drop for AccessRequestManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn delay(secs: u64) -> Result<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| Error::config(format!("delay out of range: {secs}s")))
}

fn check_access_request_id(request_id: &str) -> Result<()> {
    if request_id.is_empty() {
        return Err(Error::invalid_argument("empty access request id"));
    }
    uuid::Uuid::parse_str(request_id)
        .map(|_| ())
        .map_err(|_| Error::invalid_argument(format!("invalid access request id '{request_id}'")))
}
