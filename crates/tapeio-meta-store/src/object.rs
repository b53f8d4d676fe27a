//! Object referential: object id to physical location.

use crate::store::{MetaStore, Mutation};
use crate::tables;
use crate::types::{
    ObjectReferentialEntity, ObjectReferentialId, ObjectStorageLocation, object_key,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tapeio_common::Result;
use tracing::debug;

/// Object referential repository
pub struct ObjectReferentialRepository {
    store: Arc<MetaStore>,
    bulk_size: usize,
}

impl ObjectReferentialRepository {
    /// `bulk_size` caps the number of ids looked up per read transaction
    #[must_use]
    pub fn new(store: Arc<MetaStore>, bulk_size: usize) -> Self {
        Self {
            store,
            bulk_size: bulk_size.max(1),
        }
    }

    /// Insert the row, replacing every field of an existing one
    pub fn insert_or_update(&self, entity: &ObjectReferentialEntity) -> Result<()> {
        self.store
            .put_bincode(tables::OBJECTS, &entity.id.storage_key(), entity)?;
        Ok(())
    }

    pub fn find(
        &self,
        container_name: &str,
        object_name: &str,
    ) -> Result<Option<ObjectReferentialEntity>> {
        Ok(self
            .store
            .get_bincode(tables::OBJECTS, &object_key(container_name, object_name))?)
    }

    /// Bulk lookup within one container. Unknown names are omitted from the
    /// result.
    pub fn bulk_find(
        &self,
        container_name: &str,
        object_names: &[String],
    ) -> Result<Vec<ObjectReferentialEntity>> {
        let mut result = Vec::with_capacity(object_names.len());
        for chunk in object_names.chunks(self.bulk_size) {
            let keys: Vec<String> = chunk
                .iter()
                .map(|name| object_key(container_name, name))
                .collect();
            result.extend(self.store.get_many_bincode(tables::OBJECTS, &keys)?);
        }
        Ok(result)
    }

    /// Bulk lookup across containers, grouped by container
    pub fn bulk_find_ids(
        &self,
        ids: &[ObjectReferentialId],
    ) -> Result<Vec<ObjectReferentialEntity>> {
        let mut by_container: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for id in ids {
            by_container
                .entry(id.container_name.as_str())
                .or_default()
                .push(id.object_name.clone());
        }
        let mut result = Vec::with_capacity(ids.len());
        for (container, names) in by_container {
            result.extend(self.bulk_find(container, &names)?);
        }
        Ok(result)
    }

    /// Move an object to a new location, provided its row still points at
    /// `expected_storage_id`. A missing row or a superseded storage id is a
    /// silent no-op.
    pub fn update_storage_location(
        &self,
        container_name: &str,
        object_name: &str,
        expected_storage_id: &str,
        location: ObjectStorageLocation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = object_key(container_name, object_name);
        let updated = self.store.mutate_bincode(
            tables::OBJECTS,
            &key,
            |current: Option<ObjectReferentialEntity>| match current {
                Some(mut entity) if entity.storage_id == expected_storage_id => {
                    entity.location = location;
                    entity.last_update_date = now;
                    Ok((Mutation::Put(entity), true))
                }
                _ => Ok((Mutation::Keep, false)),
            },
        )?;
        if !updated {
            debug!(
                "Skipped location update of {}/{}: storage id {} no longer current",
                container_name, object_name, expected_storage_id
            );
        }
        Ok(())
    }

    /// Delete the row. Returns whether it existed.
    pub fn delete(&self, container_name: &str, object_name: &str) -> Result<bool> {
        Ok(self
            .store
            .delete_key(tables::OBJECTS, &object_key(container_name, object_name))?)
    }

    /// All rows of a container, ordered by object name
    pub fn list_container(&self, container_name: &str) -> Result<Vec<ObjectReferentialEntity>> {
        let start = format!("{container_name}\x00");
        let end = format!("{container_name}\x01");
        Ok(self
            .store
            .scan_bincode(tables::OBJECTS, Some((start.as_str(), end.as_str())))?
            .into_iter()
            .map(|(_, entity)| entity)
            .collect())
    }
}
