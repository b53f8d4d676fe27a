//! Packing of staged input files into tars, one writer per file bucket.
//!
//! Each file bucket owns a single worker thread appending the objects it
//! receives to the current tar `{inputTars}/{fileBucket}/{tarId}.tmp`. A tar
//! is sealed, renamed to `{tarId}` and handed to the write order creator
//! when the next entry does not fit, or when the bucket's buffering timeout
//! elapses after its first entry.

pub mod manager;
pub mod recovery;

pub use manager::TarCreatorManager;
pub use recovery::FileBucketTarCreatorBootstrapRecovery;

use crate::basic_file_storage::BasicFileStorage;
use crate::tar::{FOOTER_SIZE, TarAppender, entry_footprint, entry_name};
use crate::write_order::WriteOrderCreator;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tapeio_common::{
    Clock, DigestReader, Error, InputFileToProcessMessage, Result, TMP_EXTENSION, TarConfig,
    WriteOrder, create_tar_id,
};
use tapeio_meta_store::{
    ArchiveReferentialEntity, ArchiveReferentialRepository, ObjectReferentialRepository,
    ObjectStorageLocation,
};
use tracing::{debug, error, info, warn};

/// Services shared by the tar creators of every file bucket
#[derive(Clone)]
pub struct TarCreatorResources {
    pub input_tars_dir: PathBuf,
    pub file_storage: Arc<BasicFileStorage>,
    pub object_repository: Arc<ObjectReferentialRepository>,
    pub archive_repository: Arc<ArchiveReferentialRepository>,
    pub write_order_creator: Arc<WriteOrderCreator>,
    pub clock: Arc<dyn Clock>,
    pub tar_config: TarConfig,
}

enum TarCreatorCommand {
    Process(InputFileToProcessMessage),
    Shutdown,
}

struct CurrentTar {
    appender: TarAppender,
    seal_deadline: Instant,
}

/// Segment sizes of an object: full entries then the remainder. Empty
/// objects still get one empty entry.
fn segment_sizes(size: u64, max_entry_size: u64) -> Vec<u64> {
    if size == 0 {
        return vec![0];
    }
    let mut segments = Vec::new();
    let mut remaining = size;
    while remaining > 0 {
        let segment = remaining.min(max_entry_size);
        segments.push(segment);
        remaining -= segment;
    }
    segments
}

struct TarCreatorWorker {
    file_bucket_id: String,
    bucket: String,
    tars_dir: PathBuf,
    resources: TarCreatorResources,
    buffering_timeout: Duration,
    current: Option<CurrentTar>,
}

impl TarCreatorWorker {
    fn run(mut self, rx: &Receiver<TarCreatorCommand>) {
        loop {
            let command = match &self.current {
                Some(current) => {
                    let wait = current.seal_deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => {
                            debug!("Buffering timeout of file bucket {}", self.file_bucket_id);
                            if let Err(e) = self.seal_current() {
                                error!(
                                    "Could not seal tar of file bucket {}: {}",
                                    self.file_bucket_id, e
                                );
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => TarCreatorCommand::Shutdown,
                    }
                }
                None => rx.recv().unwrap_or(TarCreatorCommand::Shutdown),
            };
            match command {
                TarCreatorCommand::Process(message) => {
                    if let Err(e) = self.process_message(&message) {
                        // The staged file stays in place and is requeued on restart
                        error!(
                            "Could not pack {}/{} into file bucket {}: {}",
                            message.container_name, message.object_name, self.file_bucket_id, e
                        );
                    }
                }
                TarCreatorCommand::Shutdown => break,
            }
        }
        self.flush_current();
        debug!("Tar creator of file bucket {} stopped", self.file_bucket_id);
    }

    fn process_message(&mut self, message: &InputFileToProcessMessage) -> Result<()> {
        let file = match self
            .resources
            .file_storage
            .read_file(&message.container_name, &message.storage_id)
        {
            Ok(file) => file,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Input file {}/{} disappeared, object was deleted or rewritten",
                    message.container_name, message.storage_id
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let segments = segment_sizes(message.size, self.resources.tar_config.max_tar_entry_size);
        let footprint: u64 = segments.iter().map(|size| entry_footprint(*size)).sum();
        let max_tar_size = self.resources.tar_config.max_tar_file_size;
        if let Some(current) = &self.current {
            // Keep small objects in a single tar when a fresh one can hold them
            let fits_empty = footprint + FOOTER_SIZE <= max_tar_size;
            let fits_current =
                current.appender.bytes_written() + footprint + FOOTER_SIZE <= max_tar_size;
            if fits_empty && !fits_current {
                self.seal_current()?;
            }
        }

        let mut reader = DigestReader::new(BufReader::new(file), message.digest_algorithm);
        let mut entries = Vec::with_capacity(segments.len());
        for (index, size) in segments.into_iter().enumerate() {
            let name = entry_name(&message.container_name, &message.storage_id, index);
            let appender = self.writable_tar(size)?;
            match appender.append(&name, &mut reader.by_ref().take(size), size) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    self.abandon_current();
                    return Err(e);
                }
            }
        }
        if let Some(current) = &mut self.current {
            if let Err(e) = current.appender.flush() {
                self.abandon_current();
                return Err(e);
            }
        }

        let digest = reader.finalize_hex();
        if digest != message.digest_value {
            return Err(Error::DigestMismatch {
                entry: format!("{}/{}", message.container_name, message.storage_id),
                expected: message.digest_value.clone(),
                actual: digest,
            });
        }

        debug!(
            "Packed {}/{} into {} entries",
            message.container_name,
            message.object_name,
            entries.len()
        );
        self.resources.object_repository.update_storage_location(
            &message.container_name,
            &message.object_name,
            &message.storage_id,
            ObjectStorageLocation::Tar(entries),
            self.resources.clock.now(),
        )?;
        self.resources
            .file_storage
            .delete_file(&message.container_name, &message.storage_id)?;

        if self
            .current
            .as_ref()
            .is_some_and(|current| !current.appender.can_append(0))
        {
            self.seal_current()?;
        }
        Ok(())
    }

    /// Current tar, opening or rotating it so that an entry of `size` fits
    fn writable_tar(&mut self, size: u64) -> Result<&mut TarAppender> {
        if self
            .current
            .as_ref()
            .is_some_and(|current| !current.appender.can_append(size))
        {
            self.seal_current()?;
        }
        if self.current.is_none() {
            self.current = Some(self.open_tar()?);
        }
        self.current
            .as_mut()
            .map(|current| &mut current.appender)
            .ok_or_else(|| Error::internal("no current tar"))
    }

    fn open_tar(&self) -> Result<CurrentTar> {
        let tar_id = create_tar_id(self.resources.clock.now());
        // Referential first: recovery needs the row of any tar on disk
        self.resources
            .archive_repository
            .insert(&ArchiveReferentialEntity::building(
                tar_id.clone(),
                self.resources.clock.now(),
            ))?;
        let path = self.tars_dir.join(format!("{tar_id}{TMP_EXTENSION}"));
        let appender =
            TarAppender::create(&path, &tar_id, self.resources.tar_config.max_tar_file_size)?;
        info!("Opened tar {} for file bucket {}", tar_id, self.file_bucket_id);
        Ok(CurrentTar {
            appender,
            seal_deadline: Instant::now() + self.buffering_timeout,
        })
    }

    fn seal_current(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let tar_id = current.appender.tar_id().to_string();
        let tmp_path = current.appender.path().to_path_buf();
        let entry_count = current.appender.entry_count();
        let digest = current.appender.close()?;
        fs::rename(&tmp_path, self.tars_dir.join(&tar_id))?;
        info!(
            "Sealed tar {} of file bucket {} ({} entries, {} bytes)",
            tar_id, self.file_bucket_id, entry_count, digest.size
        );

        self.resources.write_order_creator.add_to_queue(WriteOrder {
            bucket: self.bucket.clone(),
            file_bucket_id: self.file_bucket_id.clone(),
            file_path: format!("{}/{tar_id}", self.file_bucket_id),
            size: digest.size,
            digest: digest.digest,
            archive_id: tar_id,
        })
    }

    /// Drop a tar left in an unknown state after a write failure
    fn abandon_current(&mut self) {
        if let Some(current) = self.current.take() {
            match current.appender.failed_at() {
                Some(offset) => warn!(
                    "Abandoning tar {} of file bucket {} with a partial entry at offset {}, \
                     it will be repaired on restart",
                    current.appender.tar_id(),
                    self.file_bucket_id,
                    offset
                ),
                None => warn!(
                    "Abandoning tar {} of file bucket {}, it will be repaired on restart",
                    current.appender.tar_id(),
                    self.file_bucket_id
                ),
            }
        }
    }

    fn flush_current(&mut self) {
        if let Some(current) = &mut self.current {
            if let Err(e) = current.appender.flush() {
                error!(
                    "Could not flush tar {} on shutdown: {}",
                    current.appender.tar_id(),
                    e
                );
            }
        }
    }
}

/// Tar writer of a single file bucket.
///
/// Messages sent before [`start`](Self::start) are buffered.
pub struct FileBucketTarCreator {
    file_bucket_id: String,
    command_tx: Sender<TarCreatorCommand>,
    pending: Mutex<Option<(TarCreatorWorker, Receiver<TarCreatorCommand>)>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileBucketTarCreator {
    pub fn new(
        resources: TarCreatorResources,
        file_bucket_id: &str,
        bucket: &str,
        buffering_timeout: Duration,
    ) -> Self {
        let (tx, rx) = unbounded();
        let worker = TarCreatorWorker {
            file_bucket_id: file_bucket_id.to_string(),
            bucket: bucket.to_string(),
            tars_dir: resources.input_tars_dir.join(file_bucket_id),
            resources,
            buffering_timeout,
            current: None,
        };
        Self {
            file_bucket_id: file_bucket_id.to_string(),
            command_tx: tx,
            pending: Mutex::new(Some((worker, rx))),
            handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn file_bucket_id(&self) -> &str {
        &self.file_bucket_id
    }

    pub fn start(&self) -> Result<()> {
        let Some((worker, rx)) = self.pending.lock().take() else {
            return Err(Error::internal(format!(
                "tar creator of file bucket {} already started",
                self.file_bucket_id
            )));
        };
        let handle = thread::Builder::new()
            .name(format!("tar-creator-{}", self.file_bucket_id))
            .spawn(move || worker.run(&rx))?;
        *self.handle.lock() = Some(handle);
        info!("Tar creator of file bucket {} started", self.file_bucket_id);
        Ok(())
    }

    pub fn add_to_queue(&self, message: InputFileToProcessMessage) -> Result<()> {
        self.command_tx
            .send(TarCreatorCommand::Process(message))
            .map_err(|_| {
                Error::internal(format!(
                    "tar creator of file bucket {} is stopped",
                    self.file_bucket_id
                ))
            })
    }

    /// Pack the messages already queued, flush the current tar without
    /// sealing it, then stop
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.command_tx.send(TarCreatorCommand::Shutdown);
        if handle.join().is_err() {
            error!("Tar creator of file bucket {} panicked", self.file_bucket_id);
        }
    }
}

impl Drop for FileBucketTarCreator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tar::{TarFileRepairer, read_entry};
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use tapeio_common::{
        DigestType, ManualClock, QueueMessage, QueueMessageType, TarEntryDescription,
        checksum::digest_hex,
    };
    use tapeio_meta_store::{
        ArchiveLocation, MetaStore, ObjectReferentialEntity, ObjectReferentialId, QueueRepository,
        QueueStore,
    };
    use tempfile::{TempDir, tempdir};

    pub(crate) const FILE_BUCKET: &str = "test-objects";
    pub(crate) const CONTAINER: &str = "0_object";

    pub(crate) struct Fixture {
        pub(crate) dir: TempDir,
        pub(crate) store: Arc<MetaStore>,
        pub(crate) resources: TarCreatorResources,
        pub(crate) queue: Arc<QueueStore>,
    }

    pub(crate) fn fixture(max_tar_entry_size: u64, max_tar_file_size: u64) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let object_repository = Arc::new(ObjectReferentialRepository::new(Arc::clone(&store), 10));
        let archive_repository =
            Arc::new(ArchiveReferentialRepository::new(Arc::clone(&store), 10));
        let queue = Arc::new(QueueStore::new(Arc::clone(&store)));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let write_order_creator = Arc::new(
            WriteOrderCreator::new(
                Arc::clone(&archive_repository),
                Arc::clone(&queue) as Arc<dyn QueueRepository>,
                Arc::clone(&clock),
            )
            .unwrap(),
        );
        let resources = TarCreatorResources {
            input_tars_dir: dir.path().join("inputTars"),
            file_storage: Arc::new(BasicFileStorage::new(dir.path().join("inputFiles")).unwrap()),
            object_repository,
            archive_repository,
            write_order_creator,
            clock,
            tar_config: TarConfig {
                max_tar_entry_size,
                max_tar_file_size,
                bulk_size: 10,
            },
        };
        Fixture {
            dir,
            store,
            resources,
            queue,
        }
    }

    impl Fixture {
        /// Stage an object the way a put does and return its message
        pub(crate) fn stage(&self, object: &str, content: &[u8]) -> InputFileToProcessMessage {
            let size = content.len() as u64;
            let storage_id = self
                .resources
                .file_storage
                .write_file(CONTAINER, object, &mut &content[..], size)
                .unwrap();
            let digest = digest_hex(DigestType::Sha512, content);
            let now = self.resources.clock.now();
            self.resources
                .object_repository
                .insert_or_update(&ObjectReferentialEntity {
                    id: ObjectReferentialId::new(CONTAINER, object),
                    size,
                    digest_type: DigestType::Sha512,
                    digest: digest.clone(),
                    storage_id: storage_id.clone(),
                    location: ObjectStorageLocation::InputFile,
                    last_object_modified_date: now,
                    last_update_date: now,
                })
                .unwrap();
            InputFileToProcessMessage {
                container_name: CONTAINER.into(),
                object_name: object.into(),
                storage_id,
                size,
                digest_value: digest,
                digest_algorithm: DigestType::Sha512,
            }
        }

        pub(crate) fn object(&self, object: &str) -> ObjectReferentialEntity {
            self.resources
                .object_repository
                .find(CONTAINER, object)
                .unwrap()
                .unwrap()
        }

        fn entries(&self, object: &str) -> Vec<TarEntryDescription> {
            self.object(object).location.tar_entries().to_vec()
        }

        fn tars_dir(&self) -> PathBuf {
            self.resources.input_tars_dir.join(FILE_BUCKET)
        }

        fn input_file_exists(&self, message: &InputFileToProcessMessage) -> bool {
            self.resources
                .file_storage
                .read_file(&message.container_name, &message.storage_id)
                .is_ok()
        }

        fn worker(&self, buffering_timeout: Duration) -> TarCreatorWorker {
            TarCreatorWorker {
                file_bucket_id: FILE_BUCKET.into(),
                bucket: "test".into(),
                tars_dir: self.tars_dir(),
                resources: self.resources.clone(),
                buffering_timeout,
                current: None,
            }
        }

        /// Content of an object read back from its tar entries
        fn read_back(&self, object: &str) -> Vec<u8> {
            let mut content = Vec::new();
            for entry in self.entries(object) {
                let path = tar_path(&self.tars_dir(), &entry.tar_file_id);
                read_entry(&path, &entry)
                    .unwrap()
                    .read_to_end(&mut content)
                    .unwrap();
            }
            content
        }

        fn write_order(&self, tar_id: &str) -> Option<WriteOrder> {
            self.queue
                .find(QueueMessageType::WriteOrder, tar_id)
                .unwrap()
                .map(|entry| match entry.message {
                    QueueMessage::WriteOrder(order) => order,
                    QueueMessage::ReadOrder(_) => panic!("unexpected read order"),
                })
        }
    }

    /// Sealed tar if present, else the one still being built
    fn tar_path(dir: &Path, tar_id: &str) -> PathBuf {
        let sealed = dir.join(tar_id);
        if sealed.exists() {
            sealed
        } else {
            dir.join(format!("{tar_id}{TMP_EXTENSION}"))
        }
    }

    fn content(size: usize, seed: u8) -> Vec<u8> {
        (0..size).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_segment_sizes() {
        assert_eq!(segment_sizes(0, 100), vec![0]);
        assert_eq!(segment_sizes(100, 100), vec![100]);
        assert_eq!(segment_sizes(250, 100), vec![100, 100, 50]);
    }

    #[test]
    fn test_pack_and_seal_single_object() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        let data = content(700, 1);
        let message = f.stage("obj1", &data);

        worker.process_message(&message).unwrap();
        assert!(!f.input_file_exists(&message));
        let entries = f.entries("obj1");
        assert_eq!(entries.len(), 1);
        let tar_id = entries[0].tar_file_id.clone();
        assert_eq!(entries[0].entry_name, format!("{CONTAINER}/{}-0", message.storage_id));
        assert!(f.tars_dir().join(format!("{tar_id}{TMP_EXTENSION}")).exists());
        assert_eq!(f.read_back("obj1"), data);

        worker.seal_current().unwrap();
        f.resources.write_order_creator.shutdown();

        let path = f.tars_dir().join(&tar_id);
        assert!(path.exists());
        let archive = f
            .resources
            .archive_repository
            .find(&tar_id)
            .unwrap()
            .unwrap();
        assert_eq!(archive.location, ArchiveLocation::ReadyOnDisk);
        let order = f.write_order(&tar_id).unwrap();
        assert_eq!(order.size, 512 + 1024 + 1024);
        assert_eq!(order.file_path, format!("{FILE_BUCKET}/{tar_id}"));
        assert_eq!(order.bucket, "test");

        let repairer = TarFileRepairer::with_object_repository(
            Arc::clone(&f.resources.object_repository),
            10,
        );
        let verified = repairer.verify_tar_archive(&path, &tar_id).unwrap();
        assert_eq!(verified.size, order.size);
        assert_eq!(verified.digest, order.digest);
    }

    #[test]
    fn test_rotation_when_tar_is_full() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        for (i, name) in ["obj1", "obj2", "obj3"].into_iter().enumerate() {
            let message = f.stage(name, &content(1000, i as u8));
            worker.process_message(&message).unwrap();
        }

        let first = f.entries("obj1")[0].tar_file_id.clone();
        assert_eq!(f.entries("obj2")[0].tar_file_id, first);
        let second = f.entries("obj3")[0].tar_file_id.clone();
        assert_ne!(second, first);
        assert!(f.tars_dir().join(&first).exists());
        assert!(f.tars_dir().join(format!("{second}{TMP_EXTENSION}")).exists());
        assert_eq!(f.read_back("obj3"), content(1000, 2));
    }

    #[test]
    fn test_object_moved_to_fresh_tar_when_it_fits_one() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        worker.process_message(&f.stage("obj1", &content(1000, 1))).unwrap();
        // Two segments, fit an empty tar but not the remaining space
        worker.process_message(&f.stage("obj2", &content(2000, 2))).unwrap();

        let first = f.entries("obj1")[0].tar_file_id.clone();
        let entries = f.entries("obj2");
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].tar_file_id, first);
        assert_eq!(entries[0].tar_file_id, entries[1].tar_file_id);
        assert_eq!(f.read_back("obj2"), content(2000, 2));
    }

    #[test]
    fn test_large_object_spans_tars() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        worker.process_message(&f.stage("obj1", &content(100, 1))).unwrap();
        let data = content(2500, 2);
        worker.process_message(&f.stage("obj2", &data)).unwrap();

        let first = f.entries("obj1")[0].tar_file_id.clone();
        let entries = f.entries("obj2");
        assert_eq!(
            entries.iter().map(|entry| entry.size).collect::<Vec<_>>(),
            vec![1024, 1024, 452]
        );
        // The current tar is filled before rotating
        assert_eq!(entries[0].tar_file_id, first);
        assert_ne!(entries[1].tar_file_id, first);
        assert_eq!(entries[2].tar_file_id, entries[1].tar_file_id);
        assert_eq!(f.read_back("obj2"), data);
    }

    #[test]
    fn test_empty_object() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        worker.process_message(&f.stage("empty", &[])).unwrap();
        let entries = f.entries("empty");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 0);
        assert!(f.read_back("empty").is_empty());
    }

    #[test]
    fn test_missing_input_file_is_skipped() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        let message = f.stage("obj1", b"data");
        f.resources
            .file_storage
            .delete_file(CONTAINER, &message.storage_id)
            .unwrap();

        worker.process_message(&message).unwrap();
        assert!(worker.current.is_none());
        assert!(f.object("obj1").location.is_input_file());
    }

    #[test]
    fn test_digest_mismatch_keeps_input_file() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        let mut message = f.stage("obj1", b"data");
        message.digest_value = "bad".into();

        let err = worker.process_message(&message).unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(f.object("obj1").location.is_input_file());
        assert!(f.input_file_exists(&message));
    }

    #[test]
    fn test_rewritten_object_keeps_new_version() {
        let f = fixture(1024, 4096);
        let mut worker = f.worker(Duration::from_secs(3600));
        let old = f.stage("obj1", b"old");
        let new = f.stage("obj1", b"new version");

        worker.process_message(&old).unwrap();
        let row = f.object("obj1");
        assert_eq!(row.storage_id, new.storage_id);
        assert!(row.location.is_input_file());
    }

    #[test]
    fn test_buffering_timeout_seals_tar() {
        let f = fixture(1024, 4096);
        let creator = FileBucketTarCreator::new(
            f.resources.clone(),
            FILE_BUCKET,
            "test",
            Duration::from_millis(50),
        );
        creator.add_to_queue(f.stage("obj1", b"data")).unwrap();
        creator.start().unwrap();
        assert!(creator.start().is_err());

        let deadline = Instant::now() + Duration::from_secs(10);
        let tar_id = loop {
            let entries = f.entries("obj1");
            if let Some(entry) = entries.first() {
                if f.tars_dir().join(&entry.tar_file_id).exists() {
                    break entry.tar_file_id.clone();
                }
            }
            assert!(Instant::now() < deadline, "tar was not sealed");
            thread::sleep(Duration::from_millis(10));
        };
        creator.shutdown();
        f.resources.write_order_creator.shutdown();
        assert!(f.write_order(&tar_id).is_some());
    }

    #[test]
    fn test_shutdown_leaves_current_tar_unsealed() {
        let f = fixture(1024, 4096);
        let creator = FileBucketTarCreator::new(
            f.resources.clone(),
            FILE_BUCKET,
            "test",
            Duration::from_secs(3600),
        );
        creator.start().unwrap();
        creator.add_to_queue(f.stage("obj1", b"data")).unwrap();
        creator.shutdown();
        assert!(creator.add_to_queue(f.stage("obj2", b"data")).is_err());

        let tar_id = f.entries("obj1")[0].tar_file_id.clone();
        assert!(f.tars_dir().join(format!("{tar_id}{TMP_EXTENSION}")).exists());
        assert!(!f.tars_dir().join(&tar_id).exists());
        f.resources.write_order_creator.shutdown();
        assert!(f.write_order(&tar_id).is_none());
    }
}
