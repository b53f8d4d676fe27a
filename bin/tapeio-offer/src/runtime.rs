//! Component wiring of the offer.

use std::sync::Arc;
use tapeio_common::{Clock, OfferConfig, Result, SystemClock};
use tapeio_meta_store::{
    AccessRequestReferentialRepository, ArchiveReferentialRepository, MetaStore,
    ObjectReferentialRepository, QueueRepository, QueueStore,
};
use tapeio_storage::cache::EvictionExecutor;
use tapeio_storage::{
    AccessRequestManager, ArchiveCacheEvictionController, ArchiveCacheStorage, BasicFileStorage,
    BucketTopologyHelper, LockManager, TapeLibraryStorage, TarCreatorManager,
    TarCreatorResources, TarFileRepairer, ThreadExecutor, TracingAlertService, WriteOrderCreator,
    WriteOrderCreatorBootstrapRecovery,
};
use tracing::info;

pub struct OfferRuntime {
    storage: Arc<TapeLibraryStorage>,
    tar_creators: Arc<TarCreatorManager>,
    write_order_creator: Arc<WriteOrderCreator>,
    write_order_recovery: WriteOrderCreatorBootstrapRecovery,
    access_requests: Arc<AccessRequestManager>,
    eviction_executor: Arc<ThreadExecutor>,
}

impl OfferRuntime {
    /// Open the referentials and build every component. No background
    /// work starts before [`start`](Self::start).
    pub fn build(config: &OfferConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bulk_size = config.tar.bulk_size;
        let topology = Arc::new(BucketTopologyHelper::new(&config.topology)?);

        let store = Arc::new(MetaStore::open(&config.storage.meta_db_path)?);
        let objects = Arc::new(ObjectReferentialRepository::new(Arc::clone(&store), bulk_size));
        let archives = Arc::new(ArchiveReferentialRepository::new(Arc::clone(&store), bulk_size));
        let access_request_repository = Arc::new(AccessRequestReferentialRepository::new(
            Arc::clone(&store),
            bulk_size,
        ));
        let queue: Arc<dyn QueueRepository> = Arc::new(QueueStore::new(store));

        let eviction_controller = Arc::new(ArchiveCacheEvictionController::new(
            Arc::clone(&access_request_repository),
            Arc::clone(&objects),
            Arc::clone(&topology),
            LockManager::new(),
            Arc::clone(&clock),
        ));
        let eviction_executor = Arc::new(ThreadExecutor::new("archive-cache-eviction")?);
        let archive_cache = Arc::new(ArchiveCacheStorage::new(
            &config.storage.cache_dir,
            Arc::clone(&topology),
            &config.cache,
            eviction_controller.judge_factory(),
            Arc::clone(&eviction_executor) as Arc<dyn EvictionExecutor>,
            Arc::new(TracingAlertService),
            Arc::clone(&clock),
        )?);

        let access_requests = Arc::new(AccessRequestManager::new(
            Arc::clone(&objects),
            Arc::clone(&archives),
            access_request_repository,
            Arc::clone(&archive_cache),
            Arc::clone(&topology),
            Arc::clone(&queue),
            Arc::clone(&clock),
            &config.access_request,
        )?);

        let write_order_creator = Arc::new(WriteOrderCreator::new(
            Arc::clone(&archives),
            queue,
            Arc::clone(&clock),
        )?);
        let write_order_recovery = WriteOrderCreatorBootstrapRecovery::new(
            &config.storage.input_tars_dir,
            Arc::clone(&topology),
            Arc::clone(&archives),
            TarFileRepairer::with_object_repository(Arc::clone(&objects), bulk_size),
            archive_cache,
        );

        let file_storage = Arc::new(BasicFileStorage::new(&config.storage.input_files_dir)?);
        let tar_creators = Arc::new(TarCreatorManager::new(
            Arc::clone(&topology),
            TarCreatorResources {
                input_tars_dir: config.storage.input_tars_dir.clone(),
                file_storage: Arc::clone(&file_storage),
                object_repository: Arc::clone(&objects),
                archive_repository: archives,
                write_order_creator: Arc::clone(&write_order_creator),
                clock: Arc::clone(&clock),
                tar_config: config.tar.clone(),
            },
        )?);

        let storage = Arc::new(TapeLibraryStorage::new(
            topology,
            file_storage,
            objects,
            Arc::clone(&tar_creators),
            Arc::clone(&access_requests),
            clock,
        ));

        Ok(Self {
            storage,
            tar_creators,
            write_order_creator,
            write_order_recovery,
            access_requests,
            eviction_executor,
        })
    }

    /// Reconcile on-disk state, then start the background workers.
    ///
    /// Sealed and interrupted tars are recovered before staged input files
    /// so that new tars never race with the repair of old ones.
    pub fn start(&self) -> Result<()> {
        self.write_order_recovery
            .initialize_on_bootstrap(&self.write_order_creator)?;
        self.tar_creators.initialize_on_bootstrap()?;
        self.tar_creators.start_tar_creators()?;
        self.access_requests.start_expiration_handler()?;
        info!("Tape library offer started");
        Ok(())
    }

    #[must_use]
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn storage(&self) -> &Arc<TapeLibraryStorage> {
        &self.storage
    }

    pub fn shutdown(&self) {
        self.tar_creators.shutdown();
        self.write_order_creator.shutdown();
        self.access_requests.shutdown();
        self.eviction_executor.shutdown();
        info!("Tape library offer stopped");
    }
}
