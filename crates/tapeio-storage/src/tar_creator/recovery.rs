//! Startup reconciliation of staged input files with the object referential.

use crate::basic_file_storage::{BasicFileStorage, storage_id_to_object_name};
use crate::topology::BucketTopologyHelper;
use std::collections::HashMap;
use std::sync::Arc;
use tapeio_common::{InputFileToProcessMessage, Result};
use tapeio_meta_store::ObjectReferentialRepository;
use tracing::{info, warn};

/// Requeues staged files still waiting to be packed and deletes the ones
/// the referential no longer points at.
///
/// A staged file is kept only if its object row exists, still names this
/// storage id and is still located in the input files. Anything else is a
/// leftover of an overwrite, a delete or a pack whose cleanup was
/// interrupted.
pub struct FileBucketTarCreatorBootstrapRecovery {
    topology: Arc<BucketTopologyHelper>,
    file_storage: Arc<BasicFileStorage>,
    object_repository: Arc<ObjectReferentialRepository>,
    bulk_size: usize,
}

impl FileBucketTarCreatorBootstrapRecovery {
    pub fn new(
        topology: Arc<BucketTopologyHelper>,
        file_storage: Arc<BasicFileStorage>,
        object_repository: Arc<ObjectReferentialRepository>,
        bulk_size: usize,
    ) -> Self {
        Self {
            topology,
            file_storage,
            object_repository,
            bulk_size: bulk_size.max(1),
        }
    }

    /// Scan every container of `file_bucket_id`, handing pending files to
    /// `enqueue` in storage id order
    pub fn initialize_on_bootstrap(
        &self,
        file_bucket_id: &str,
        mut enqueue: impl FnMut(InputFileToProcessMessage) -> Result<()>,
    ) -> Result<()> {
        for container_name in self.topology.list_container_names(file_bucket_id)? {
            let mut storage_ids = self
                .file_storage
                .list_storage_ids_by_container_name(&container_name)?
                .collect::<Result<Vec<_>>>()?;
            storage_ids.sort();

            let mut pending = Vec::with_capacity(storage_ids.len());
            for storage_id in storage_ids {
                match storage_id_to_object_name(&storage_id) {
                    Ok(object_name) => pending.push((object_name.to_string(), storage_id)),
                    Err(e) => warn!(
                        "Ignoring unexpected input file {}/{}: {}",
                        container_name, storage_id, e
                    ),
                }
            }

            let mut requeued = 0usize;
            for chunk in pending.chunks(self.bulk_size) {
                let names: Vec<String> = chunk.iter().map(|(name, _)| name.clone()).collect();
                let rows: HashMap<String, _> = self
                    .object_repository
                    .bulk_find(&container_name, &names)?
                    .into_iter()
                    .map(|row| (row.id.object_name.clone(), row))
                    .collect();

                for (object_name, storage_id) in chunk {
                    match rows.get(object_name) {
                        Some(row)
                            if row.storage_id == *storage_id && row.location.is_input_file() =>
                        {
                            enqueue(InputFileToProcessMessage {
                                container_name: container_name.clone(),
                                object_name: object_name.clone(),
                                storage_id: storage_id.clone(),
                                size: row.size,
                                digest_value: row.digest.clone(),
                                digest_algorithm: row.digest_type,
                            })?;
                            requeued += 1;
                        }
                        _ => {
                            info!(
                                "Deleting orphan input file {}/{}",
                                container_name, storage_id
                            );
                            self.file_storage.delete_file(&container_name, storage_id)?;
                        }
                    }
                }
            }
            if requeued > 0 {
                info!(
                    "Requeued {} input files of container {}",
                    requeued, container_name
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_creator::tests::{CONTAINER, FILE_BUCKET, fixture};
    use crate::topology::tests::helper;
    use std::fs;
    use tapeio_common::TarEntryDescription;
    use tapeio_meta_store::ObjectStorageLocation;

    #[test]
    fn test_recovery_requeues_pending_and_deletes_orphans() {
        let f = fixture(1024, 4096);
        let storage = &f.resources.file_storage;
        let objects = &f.resources.object_repository;

        let pending = f.stage("pending", b"pending");
        // Overwritten: the old staged file is stale
        let stale = f.stage("rewritten", b"old");
        let current = f.stage("rewritten", b"new");
        // Deleted object
        let deleted = f.stage("deleted", b"deleted");
        objects.delete(CONTAINER, "deleted").unwrap();
        // Packed, but the staged file survived a crash
        let packed = f.stage("packed", b"packed");
        objects
            .update_storage_location(
                CONTAINER,
                "packed",
                &packed.storage_id,
                ObjectStorageLocation::Tar(vec![TarEntryDescription {
                    tar_file_id: "tar1.tar".into(),
                    entry_name: format!("{CONTAINER}/{}-0", packed.storage_id),
                    start_pos: 0,
                    size: 6,
                    digest_value: packed.digest_value.clone(),
                }]),
                chrono::Utc::now(),
            )
            .unwrap();
        // Not a storage id
        let stray = f.dir.path().join("inputFiles").join(CONTAINER).join("stray");
        fs::write(&stray, b"x").unwrap();

        let recovery = FileBucketTarCreatorBootstrapRecovery::new(
            Arc::new(helper()),
            Arc::clone(storage),
            Arc::clone(objects),
            2,
        );
        let mut queued = Vec::new();
        recovery
            .initialize_on_bootstrap(FILE_BUCKET, |message| {
                queued.push(message);
                Ok(())
            })
            .unwrap();

        let mut expected = vec![pending.clone(), current.clone()];
        expected.sort_by(|a, b| a.storage_id.cmp(&b.storage_id));
        assert_eq!(queued, expected);

        let exists = |message: &InputFileToProcessMessage| {
            storage
                .read_file(&message.container_name, &message.storage_id)
                .is_ok()
        };
        assert!(exists(&pending));
        assert!(exists(&current));
        assert!(!exists(&stale));
        assert!(!exists(&deleted));
        assert!(!exists(&packed));
        assert!(stray.exists());
    }

    #[test]
    fn test_recovery_of_empty_file_bucket() {
        let f = fixture(1024, 4096);
        let recovery = FileBucketTarCreatorBootstrapRecovery::new(
            Arc::new(helper()),
            Arc::clone(&f.resources.file_storage),
            Arc::clone(&f.resources.object_repository),
            10,
        );
        recovery
            .initialize_on_bootstrap("test-metadata", |_| panic!("nothing to requeue"))
            .unwrap();
        assert!(recovery.initialize_on_bootstrap("unknown", |_| Ok(())).is_err());
    }
}
