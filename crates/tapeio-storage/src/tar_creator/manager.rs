//! Routing of input files to the tar creator of their file bucket.

use super::{FileBucketTarCreator, FileBucketTarCreatorBootstrapRecovery, TarCreatorResources};
use crate::topology::BucketTopologyHelper;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tapeio_common::{Error, InputFileToProcessMessage, Result};
use tracing::info;

pub struct TarCreatorManager {
    topology: Arc<BucketTopologyHelper>,
    resources: TarCreatorResources,
    creators: BTreeMap<String, FileBucketTarCreator>,
}

impl TarCreatorManager {
    /// One stopped tar creator per configured file bucket
    pub fn new(topology: Arc<BucketTopologyHelper>, resources: TarCreatorResources) -> Result<Self> {
        let mut creators = BTreeMap::new();
        for file_bucket_id in topology.list_file_buckets() {
            let bucket = topology.get_bucket_from_file_bucket(&file_bucket_id)?;
            let minutes = topology.get_tar_buffering_timeout_in_minutes(bucket)?;
            let minutes = u64::try_from(minutes).map_err(|_| {
                Error::config(format!("negative tar buffering timeout for bucket {bucket}"))
            })?;
            let creator = FileBucketTarCreator::new(
                resources.clone(),
                &file_bucket_id,
                bucket,
                Duration::from_secs(minutes * 60),
            );
            creators.insert(file_bucket_id, creator);
        }
        Ok(Self {
            topology,
            resources,
            creators,
        })
    }

    /// Requeue the staged files of every file bucket. Runs before
    /// [`start_tar_creators`](Self::start_tar_creators).
    pub fn initialize_on_bootstrap(&self) -> Result<()> {
        let recovery = FileBucketTarCreatorBootstrapRecovery::new(
            Arc::clone(&self.topology),
            Arc::clone(&self.resources.file_storage),
            Arc::clone(&self.resources.object_repository),
            self.resources.tar_config.bulk_size,
        );
        for (file_bucket_id, creator) in &self.creators {
            recovery.initialize_on_bootstrap(file_bucket_id, |message| {
                creator.add_to_queue(message)
            })?;
        }
        info!("Tar creators recovered {} file buckets", self.creators.len());
        Ok(())
    }

    pub fn start_tar_creators(&self) -> Result<()> {
        for creator in self.creators.values() {
            creator.start()?;
        }
        Ok(())
    }

    /// Send a staged object to the tar creator of its container
    pub fn add_to_queue(&self, message: InputFileToProcessMessage) -> Result<()> {
        let file_bucket_id = self
            .topology
            .get_file_bucket_from_container_name(&message.container_name)?;
        self.creators
            .get(&file_bucket_id)
            .ok_or_else(|| Error::internal(format!("no tar creator for {file_bucket_id}")))?
            .add_to_queue(message)
    }

    pub fn shutdown(&self) {
        for creator in self.creators.values() {
            creator.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_creator::tests::fixture;
    use crate::topology::tests::helper;
    use std::thread;
    use std::time::Instant;
    use tapeio_common::TMP_EXTENSION;

    #[test]
    fn test_manager_routes_and_recovers() {
        let f = fixture(1024, 4096);
        let staged = f.stage("obj1", b"recovered");

        let manager = TarCreatorManager::new(Arc::new(helper()), f.resources.clone()).unwrap();
        manager.initialize_on_bootstrap().unwrap();
        manager.start_tar_creators().unwrap();
        manager.add_to_queue(f.stage("obj2", b"routed")).unwrap();

        let mut bad = f.stage("obj3", b"x");
        bad.container_name = "9_object".into();
        assert!(manager.add_to_queue(bad).is_err());

        let deadline = Instant::now() + Duration::from_secs(10);
        while ["obj1", "obj2"]
            .iter()
            .any(|name| f.object(name).location.is_input_file())
        {
            assert!(Instant::now() < deadline, "objects were not packed");
            thread::sleep(Duration::from_millis(10));
        }
        manager.shutdown();

        let obj1 = f.object("obj1");
        let entry = &obj1.location.tar_entries()[0];
        assert!(entry.entry_name.contains(&staged.storage_id));
        let tmp = f
            .resources
            .input_tars_dir
            .join("test-objects")
            .join(format!("{}{TMP_EXTENSION}", entry.tar_file_id));
        assert!(tmp.exists());
    }
}
