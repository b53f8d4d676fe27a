//! Access request referential.
//!
//! Rows are updated with optimistic concurrency: `update_access_request`
//! only writes if the stored version still equals the version the caller
//! read, and bumps it.
//!
//! Every write keeps the `archiveId -> requestId` index of unavailable
//! archives in the same transaction as the row itself.

use crate::store::{MetaStore, Mutation, SecondaryIndex};
use crate::tables;
use crate::types::AccessRequestEntity;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tapeio_common::{Error, Result};
use tracing::info;

const BY_ARCHIVE: SecondaryIndex<AccessRequestEntity> = SecondaryIndex {
    table: tables::ACCESS_REQUESTS_BY_ARCHIVE,
    keys: unavailable_archive_keys,
};

fn archive_key(archive_id: &str, request_id: &str) -> String {
    format!("{archive_id}\x00{request_id}")
}

fn unavailable_archive_keys(entity: &AccessRequestEntity) -> Vec<String> {
    let mut keys: Vec<String> = entity
        .unavailable_archive_ids
        .iter()
        .map(|archive_id| archive_key(archive_id, &entity.request_id))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Index key range of one archive
fn archive_range(archive_id: &str) -> (String, String) {
    (format!("{archive_id}\x00"), format!("{archive_id}\x01"))
}

pub struct AccessRequestReferentialRepository {
    store: Arc<MetaStore>,
    bulk_size: usize,
}

impl AccessRequestReferentialRepository {
    #[must_use]
    pub fn new(store: Arc<MetaStore>, bulk_size: usize) -> Self {
        Self {
            store,
            bulk_size: bulk_size.max(1),
        }
    }

    pub fn insert(&self, entity: &AccessRequestEntity) -> Result<()> {
        if self
            .store
            .insert_new_indexed(
                tables::ACCESS_REQUESTS,
                Some(&BY_ARCHIVE),
                &entity.request_id,
                entity,
            )?
        {
            Ok(())
        } else {
            Err(Error::AlreadyExists(format!(
                "access request {}",
                entity.request_id
            )))
        }
    }

    pub fn find_by_request_id(&self, request_id: &str) -> Result<Option<AccessRequestEntity>> {
        Ok(self.store.get_bincode(tables::ACCESS_REQUESTS, request_id)?)
    }

    pub fn find_by_request_ids(&self, request_ids: &[String]) -> Result<Vec<AccessRequestEntity>> {
        let mut result = Vec::with_capacity(request_ids.len());
        for chunk in request_ids.chunks(self.bulk_size) {
            result.extend(self.store.get_many_bincode(tables::ACCESS_REQUESTS, chunk)?);
        }
        Ok(result)
    }

    /// Requests still waiting for the given archive
    pub fn find_by_unavailable_archive_id(
        &self,
        archive_id: &str,
    ) -> Result<Vec<AccessRequestEntity>> {
        let (start, end) = archive_range(archive_id);
        let request_ids = self
            .store
            .index_range(tables::ACCESS_REQUESTS_BY_ARCHIVE, &start, &end)?;
        // A row may change between the index read and the row read
        Ok(self
            .find_by_request_ids(&request_ids)?
            .into_iter()
            .filter(|entity| {
                entity
                    .unavailable_archive_ids
                    .iter()
                    .any(|id| id == archive_id)
            })
            .collect())
    }

    /// Requests without a ready date
    pub fn find_non_ready_access_requests(&self) -> Result<Vec<AccessRequestEntity>> {
        self.find_where(|entity| !entity.is_ready())
    }

    /// Requests not expired at `now`, ready or not
    pub fn find_non_expired_access_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccessRequestEntity>> {
        self.find_where(|entity| entity.is_live(now))
    }

    /// Write `entity` if the stored row is still at `entity.version`.
    /// Returns false if the row changed or vanished meanwhile.
    pub fn update_access_request(&self, entity: &AccessRequestEntity) -> Result<bool> {
        Ok(self.store.mutate_indexed(
            tables::ACCESS_REQUESTS,
            Some(&BY_ARCHIVE),
            &entity.request_id,
            |current: Option<AccessRequestEntity>| match current {
                Some(stored) if stored.version == entity.version => {
                    let mut updated = entity.clone();
                    updated.version += 1;
                    Ok((Mutation::Put(updated), true))
                }
                _ => Ok((Mutation::Keep, false)),
            },
        )?)
    }

    /// Delete a request. Returns whether it existed.
    pub fn delete_access_request_by_id(&self, request_id: &str) -> Result<bool> {
        Ok(self
            .store
            .delete_indexed(tables::ACCESS_REQUESTS, &BY_ARCHIVE, request_id)?)
    }

    /// Remove every request whose purge date has passed and return them
    pub fn cleanup_and_get_expired_access_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccessRequestEntity>> {
        let purged: Vec<AccessRequestEntity> = self
            .store
            .remove_where_indexed(
                tables::ACCESS_REQUESTS,
                Some(&BY_ARCHIVE),
                |entity: &AccessRequestEntity| entity.purge_date.is_some_and(|purge| purge <= now),
            )?;
        if !purged.is_empty() {
            info!("Purged {} expired access requests", purged.len());
        }
        Ok(purged)
    }

    /// Out of `archive_ids`, keep those no remaining request still waits for
    pub fn exclude_archive_ids_still_required_by_access_requests(
        &self,
        archive_ids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let mut remaining = BTreeSet::new();
        for archive_id in archive_ids {
            let (start, end) = archive_range(archive_id);
            if !self.store.index_contains_range(
                tables::ACCESS_REQUESTS_BY_ARCHIVE,
                &start,
                &end,
            )? {
                remaining.insert(archive_id.clone());
            }
        }
        Ok(remaining)
    }

    fn find_where<P>(&self, predicate: P) -> Result<Vec<AccessRequestEntity>>
    where
        P: Fn(&AccessRequestEntity) -> bool,
    {
        Ok(self
            .store
            .scan_bincode::<AccessRequestEntity>(tables::ACCESS_REQUESTS, None)?
            .into_iter()
            .map(|(_, entity)| entity)
            .filter(|entity| predicate(entity))
            .collect())
    }
}
