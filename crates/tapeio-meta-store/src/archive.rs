//! Archive referential: archive id to physical location.

use crate::store::{MetaStore, Mutation};
use crate::tables;
use crate::types::{ArchiveLocation, ArchiveReferentialEntity};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tapeio_common::{Error, Result};
use tracing::{debug, info};

/// Archive referential repository
pub struct ArchiveReferentialRepository {
    store: Arc<MetaStore>,
    bulk_size: usize,
}

impl ArchiveReferentialRepository {
    #[must_use]
    pub fn new(store: Arc<MetaStore>, bulk_size: usize) -> Self {
        Self {
            store,
            bulk_size: bulk_size.max(1),
        }
    }

    /// Insert a new archive. Fails if the id is already known.
    pub fn insert(&self, entity: &ArchiveReferentialEntity) -> Result<()> {
        if self
            .store
            .insert_new_bincode(tables::ARCHIVES, &entity.archive_id, entity)?
        {
            Ok(())
        } else {
            Err(Error::AlreadyExists(format!("archive {}", entity.archive_id)))
        }
    }

    pub fn find(&self, archive_id: &str) -> Result<Option<ArchiveReferentialEntity>> {
        Ok(self.store.get_bincode(tables::ARCHIVES, archive_id)?)
    }

    /// Bulk lookup; unknown ids are omitted from the result
    pub fn bulk_find(&self, archive_ids: &[String]) -> Result<Vec<ArchiveReferentialEntity>> {
        let mut result = Vec::with_capacity(archive_ids.len());
        for chunk in archive_ids.chunks(self.bulk_size) {
            result.extend(self.store.get_many_bincode(tables::ARCHIVES, chunk)?);
        }
        Ok(result)
    }

    /// Seal an archive: building-on-disk becomes ready-on-disk with its
    /// final size and digest. Repeating the same call is a no-op.
    pub fn update_location_to_ready_on_disk(
        &self,
        archive_id: &str,
        size: u64,
        digest: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let changed = self.store.mutate_bincode(
            tables::ARCHIVES,
            archive_id,
            |current: Option<ArchiveReferentialEntity>| {
                let Some(mut entity) = current else {
                    return Err(Error::referential(format!("unknown archive {archive_id}")).into());
                };
                match entity.location {
                    ArchiveLocation::BuildingOnDisk => {
                        entity.location = ArchiveLocation::ReadyOnDisk;
                        entity.size = Some(size);
                        entity.digest = Some(digest.to_string());
                        entity.last_update_date = now;
                        Ok((Mutation::Put(entity), true))
                    }
                    ArchiveLocation::ReadyOnDisk
                        if entity.size == Some(size)
                            && entity.digest.as_deref() == Some(digest) =>
                    {
                        Ok((Mutation::Keep, false))
                    }
                    ArchiveLocation::ReadyOnDisk => Err(Error::referential(format!(
                        "archive {archive_id} already sealed with a different size or digest"
                    ))
                    .into()),
                    ref other => Err(Error::IllegalStateTransition {
                        id: archive_id.to_string(),
                        from: other.to_string(),
                        to: ArchiveLocation::ReadyOnDisk.to_string(),
                    }
                    .into()),
                }
            },
        )?;
        if changed {
            info!("Archive {} is ready on disk ({} bytes)", archive_id, size);
        } else {
            debug!("Archive {} already ready on disk", archive_id);
        }
        Ok(())
    }

    /// Record that an archive was written to tape. Repeating the same call
    /// is a no-op.
    pub fn update_location_to_on_tape(
        &self,
        archive_id: &str,
        tape_code: &str,
        file_position: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let target = ArchiveLocation::OnTape {
            tape_code: tape_code.to_string(),
            file_position,
        };
        let changed = self.store.mutate_bincode(
            tables::ARCHIVES,
            archive_id,
            |current: Option<ArchiveReferentialEntity>| {
                let Some(mut entity) = current else {
                    return Err(Error::referential(format!("unknown archive {archive_id}")).into());
                };
                match entity.location {
                    ArchiveLocation::ReadyOnDisk => {
                        entity.location = target.clone();
                        entity.last_update_date = now;
                        Ok((Mutation::Put(entity), true))
                    }
                    ref same if *same == target => Ok((Mutation::Keep, false)),
                    ref other => Err(Error::IllegalStateTransition {
                        id: archive_id.to_string(),
                        from: other.to_string(),
                        to: target.to_string(),
                    }
                    .into()),
                }
            },
        )?;
        if changed {
            info!(
                "Archive {} is on tape {} at position {}",
                archive_id, tape_code, file_position
            );
        }
        Ok(())
    }
}
