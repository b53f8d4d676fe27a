//! Hand-off of sealed tars to the tape write queue.

use crate::cache::ArchiveCacheStorage;
use crate::tar::TarFileRepairer;
use crate::topology::BucketTopologyHelper;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tapeio_common::{
    Clock, DigestWithSize, Error, QueueMessage, Result, TMP_EXTENSION, WriteOrder,
    is_safe_filename,
};
use tapeio_meta_store::{ArchiveLocation, ArchiveReferentialRepository, QueueRepository};
use tracing::{debug, error, info, warn};

enum WriteOrderCommand {
    Process(WriteOrder),
    Shutdown,
}

struct WriteOrderProcessor {
    archive_repository: Arc<ArchiveReferentialRepository>,
    queue: Arc<dyn QueueRepository>,
    clock: Arc<dyn Clock>,
}

impl WriteOrderProcessor {
    fn process(&self, order: &WriteOrder) -> Result<()> {
        self.archive_repository.update_location_to_ready_on_disk(
            &order.archive_id,
            order.size,
            &order.digest,
            self.clock.now(),
        )?;
        if self
            .queue
            .add_if_absent(QueueMessage::WriteOrder(order.clone()))?
        {
            info!(
                "Write order queued for archive {} ({} bytes)",
                order.archive_id, order.size
            );
        }
        Ok(())
    }
}

/// Marks sealed tars ready on disk and queues their write order.
///
/// `add_to_queue` hands the order to a background thread; `process_message`
/// does the same work on the calling thread.
pub struct WriteOrderCreator {
    processor: Arc<WriteOrderProcessor>,
    command_tx: Sender<WriteOrderCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteOrderCreator {
    pub fn new(
        archive_repository: Arc<ArchiveReferentialRepository>,
        queue: Arc<dyn QueueRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let processor = Arc::new(WriteOrderProcessor {
            archive_repository,
            queue,
            clock,
        });
        let (tx, rx) = unbounded();
        let worker = Arc::clone(&processor);
        let handle = thread::Builder::new()
            .name("write-order-creator".to_string())
            .spawn(move || Self::worker_loop(&worker, &rx))?;
        Ok(Self {
            processor,
            command_tx: tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn worker_loop(processor: &WriteOrderProcessor, rx: &Receiver<WriteOrderCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                WriteOrderCommand::Process(order) => {
                    if let Err(e) = processor.process(&order) {
                        // Recovery reschedules ready tars on next start
                        error!(
                            "Could not create write order for archive {}: {}",
                            order.archive_id, e
                        );
                    }
                }
                WriteOrderCommand::Shutdown => break,
            }
        }
        debug!("Write order creator stopped");
    }

    /// Queue a sealed tar for background processing
    pub fn add_to_queue(&self, order: WriteOrder) -> Result<()> {
        self.command_tx
            .send(WriteOrderCommand::Process(order))
            .map_err(|_| Error::internal("write order creator is stopped"))
    }

    /// Process a sealed tar synchronously
    pub fn process_message(&self, order: &WriteOrder) -> Result<()> {
        self.processor.process(order)
    }

    /// Process orders already queued, then stop
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.command_tx.send(WriteOrderCommand::Shutdown);
        if handle.join().is_err() {
            error!("Write order creator thread panicked");
        }
    }
}

impl Drop for WriteOrderCreator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reconciles the input tars directory with the archive referential at
/// startup, before the tar creators run.
///
/// - `{tarId}.tmp`: tar interrupted while building. Repaired into
///   `{tarId}`, then scheduled.
/// - `{tarId}` building on disk: sealed but not marked. Verified, then
///   scheduled.
/// - `{tarId}` ready on disk: write order possibly lost. Scheduled again.
/// - `{tarId}` on tape: moved to the archive cache unless already cached,
///   in which case it is deleted.
/// - `{tarId}` without referential row: fatal.
pub struct WriteOrderCreatorBootstrapRecovery {
    input_tars_dir: PathBuf,
    topology: Arc<BucketTopologyHelper>,
    archive_repository: Arc<ArchiveReferentialRepository>,
    tar_repairer: TarFileRepairer,
    archive_cache: Arc<ArchiveCacheStorage>,
}

impl WriteOrderCreatorBootstrapRecovery {
    pub fn new(
        input_tars_dir: impl Into<PathBuf>,
        topology: Arc<BucketTopologyHelper>,
        archive_repository: Arc<ArchiveReferentialRepository>,
        tar_repairer: TarFileRepairer,
        archive_cache: Arc<ArchiveCacheStorage>,
    ) -> Self {
        Self {
            input_tars_dir: input_tars_dir.into(),
            topology,
            archive_repository,
            tar_repairer,
            archive_cache,
        }
    }

    pub fn initialize_on_bootstrap(&self, write_order_creator: &WriteOrderCreator) -> Result<()> {
        for file_bucket_id in self.topology.list_file_buckets() {
            let dir = self.input_tars_dir.join(&file_bucket_id);
            if !dir.is_dir() {
                debug!("No input tars for file bucket {}", file_bucket_id);
                continue;
            }
            let mut names = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry
                    .file_name()
                    .into_string()
                    .map_err(|name| Error::IllegalName(name.to_string_lossy().into_owned()))?;
                names.push(name);
            }
            names.sort();

            for name in names {
                if let Some(tar_id) = name.strip_suffix(TMP_EXTENSION) {
                    self.recover_building_tar(&dir, &file_bucket_id, tar_id, write_order_creator)?;
                } else {
                    self.recover_sealed_tar(&dir, &file_bucket_id, &name, write_order_creator)?;
                }
            }
        }
        Ok(())
    }

    fn recover_building_tar(
        &self,
        dir: &Path,
        file_bucket_id: &str,
        tar_id: &str,
        write_order_creator: &WriteOrderCreator,
    ) -> Result<()> {
        check_tar_id(tar_id)?;
        let tmp_path = dir.join(format!("{tar_id}{TMP_EXTENSION}"));
        let final_path = dir.join(tar_id);
        warn!("Repairing interrupted tar {}", tmp_path.display());

        let digest = {
            let mut input = File::open(&tmp_path)?;
            self.tar_repairer
                .repair_and_verify_tar_archive(&mut input, &final_path, tar_id)?
        };
        fs::remove_file(&tmp_path)?;
        self.schedule(file_bucket_id, tar_id, &digest, write_order_creator)
    }

    fn recover_sealed_tar(
        &self,
        dir: &Path,
        file_bucket_id: &str,
        tar_id: &str,
        write_order_creator: &WriteOrderCreator,
    ) -> Result<()> {
        check_tar_id(tar_id)?;
        let path = dir.join(tar_id);
        let archive = self.archive_repository.find(tar_id)?.ok_or_else(|| {
            Error::referential(format!(
                "no archive referential entry for tar {}",
                path.display()
            ))
        })?;

        match archive.location {
            ArchiveLocation::OnTape { .. } => self.move_to_cache_or_delete(&path, file_bucket_id, tar_id),
            ArchiveLocation::BuildingOnDisk => {
                info!("Verifying sealed tar {}", path.display());
                let digest = self.tar_repairer.verify_tar_archive(&path, tar_id)?;
                self.schedule(file_bucket_id, tar_id, &digest, write_order_creator)
            }
            ArchiveLocation::ReadyOnDisk => {
                let digest = match (archive.size, archive.digest) {
                    (Some(size), Some(digest)) => DigestWithSize { size, digest },
                    _ => self.tar_repairer.verify_tar_archive(&path, tar_id)?,
                };
                info!("Rescheduling ready tar {}", path.display());
                self.schedule(file_bucket_id, tar_id, &digest, write_order_creator)
            }
        }
    }

    fn move_to_cache_or_delete(&self, path: &Path, file_bucket_id: &str, tar_id: &str) -> Result<()> {
        if self.archive_cache.contains_archive(file_bucket_id, tar_id) {
            info!("Deleting tar {} already on tape and in cache", path.display());
            fs::remove_file(path)?;
            return Ok(());
        }
        let size = fs::metadata(path)?.len();
        if let Err(e) = self
            .archive_cache
            .reserve_archive_storage_space(file_bucket_id, tar_id, size)
        {
            warn!(
                "Could not keep tar {} in cache, deleting it: {}",
                path.display(),
                e
            );
            fs::remove_file(path)?;
            return Ok(());
        }
        if let Err(e) = self
            .archive_cache
            .move_archive_to_cache(path, file_bucket_id, tar_id)
        {
            self.archive_cache
                .cancel_reserved_archive(file_bucket_id, tar_id)?;
            return Err(e);
        }
        info!("Tar {} already on tape moved to cache", tar_id);
        Ok(())
    }

    fn schedule(
        &self,
        file_bucket_id: &str,
        tar_id: &str,
        digest: &DigestWithSize,
        write_order_creator: &WriteOrderCreator,
    ) -> Result<()> {
        let order = WriteOrder {
            bucket: self
                .topology
                .get_bucket_from_file_bucket(file_bucket_id)?
                .to_string(),
            file_bucket_id: file_bucket_id.to_string(),
            file_path: format!("{file_bucket_id}/{tar_id}"),
            size: digest.size,
            digest: digest.digest.clone(),
            archive_id: tar_id.to_string(),
        };
        write_order_creator.process_message(&order)
    }
}

fn check_tar_id(tar_id: &str) -> Result<()> {
    if is_safe_filename(tar_id) {
        Ok(())
    } else {
        Err(Error::IllegalName(format!("illegal tar id {tar_id}")))
    }
}
