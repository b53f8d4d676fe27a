//! Persistent referential store backed by redb.
//!
//! Repositories share one `MetaStore` and go through the generic helpers
//! below. Conditional updates read, decide and write inside a single write
//! transaction, so a concurrent writer can never interleave between the
//! check and the write.

use crate::tables;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::error;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Domain rule rejected the mutation
    #[error(transparent)]
    Rejected(#[from] tapeio_common::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for tapeio_common::Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Rejected(inner) => inner,
            other => Self::storage(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Outcome of a read-modify-write on a single key
pub(crate) enum Mutation<T> {
    Keep,
    Put(T),
    Delete,
}

/// Secondary index kept in step with a primary table.
///
/// Index keys must end with the primary key so that rows sharing an
/// indexed value stay distinct; the index value is the primary key.
pub(crate) struct SecondaryIndex<T> {
    pub(crate) table: TableDefinition<'static, &'static str, &'static str>,
    pub(crate) keys: fn(&T) -> Vec<String>,
}

fn update_index<T>(
    txn: &WriteTransaction,
    index: Option<&SecondaryIndex<T>>,
    primary_key: &str,
    old_keys: &[String],
    new_value: Option<&T>,
) -> MetaStoreResult<()> {
    let Some(index) = index else {
        return Ok(());
    };
    let new_keys = new_value.map(index.keys).unwrap_or_default();
    if old_keys == new_keys.as_slice() {
        return Ok(());
    }
    let mut table = txn.open_table(index.table)?;
    for key in old_keys.iter().filter(|key| !new_keys.contains(key)) {
        table.remove(key.as_str())?;
    }
    for key in &new_keys {
        table.insert(key.as_str(), primary_key)?;
    }
    Ok(())
}

/// Persistent referential store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::OBJECTS)?;
            let _t = write_txn.open_table(tables::ARCHIVES)?;
            let _t = write_txn.open_table(tables::ACCESS_REQUESTS)?;
            let _t = write_txn.open_table(tables::ACCESS_REQUESTS_BY_ARCHIVE)?;
            let _t = write_txn.open_table(tables::QUEUE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // ---- Generic helpers ----

    pub(crate) fn get_bincode<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaStoreResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        match table.get(key)? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    /// Look up many keys in one read transaction; missing keys are skipped.
    pub(crate) fn get_many_bincode<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        keys: &[String],
    ) -> MetaStoreResult<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(val) = table.get(key.as_str())? {
                result.push(bincode::deserialize(val.value())?);
            }
        }
        Ok(result)
    }

    pub(crate) fn put_bincode<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Insert only if the key is absent. Returns false when it already existed.
    pub(crate) fn insert_new_bincode<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<bool> {
        self.insert_new_indexed(table_def, None, key, value)
    }

    pub(crate) fn insert_new_indexed<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        index: Option<&SecondaryIndex<T>>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<bool> {
        let bytes = bincode::serialize(value)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(table_def)?;
            let exists = table.get(key)?.is_some();
            if exists {
                false
            } else {
                table.insert(key, bytes.as_slice())?;
                true
            }
        };
        if inserted {
            update_index(&write_txn, index, key, &[], Some(value))?;
            write_txn.commit()?;
        }
        Ok(inserted)
    }

    /// Delete a key. Returns whether it existed.
    pub(crate) fn delete_key(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(table_def)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Delete a row and its index entries. Returns whether it existed.
    pub(crate) fn delete_indexed<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        index: &SecondaryIndex<T>,
        key: &str,
    ) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed: Option<T> = {
            let mut table = write_txn.open_table(table_def)?;
            match table.remove(key)? {
                Some(val) => Some(bincode::deserialize(val.value())?),
                None => None,
            }
        };
        if let Some(old) = &removed {
            update_index(&write_txn, Some(index), key, &(index.keys)(old), None::<&T>)?;
        }
        write_txn.commit()?;
        Ok(removed.is_some())
    }

    /// Read, decide and write a single key inside one write transaction.
    /// Nothing is committed when the closure returns `Mutation::Keep`.
    pub(crate) fn mutate_bincode<T, R, F>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        f: F,
    ) -> MetaStoreResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> MetaStoreResult<(Mutation<T>, R)>,
    {
        self.mutate_indexed(table_def, None, key, f)
    }

    pub(crate) fn mutate_indexed<T, R, F>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        index: Option<&SecondaryIndex<T>>,
        key: &str,
        f: F,
    ) -> MetaStoreResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> MetaStoreResult<(Mutation<T>, R)>,
    {
        let write_txn = self.db.begin_write()?;
        let (changed, result) = {
            let mut table = write_txn.open_table(table_def)?;
            // Decode, then drop the guard before mutating
            let current: Option<T> = match table.get(key)? {
                Some(val) => Some(bincode::deserialize(val.value())?),
                None => None,
            };
            let old_keys = match (index, &current) {
                (Some(index), Some(current)) => (index.keys)(current),
                _ => Vec::new(),
            };
            let (mutation, result) = f(current)?;
            match mutation {
                Mutation::Keep => (false, result),
                Mutation::Put(value) => {
                    let bytes = bincode::serialize(&value)?;
                    table.insert(key, bytes.as_slice())?;
                    update_index(&write_txn, index, key, &old_keys, Some(&value))?;
                    (true, result)
                }
                Mutation::Delete => {
                    table.remove(key)?;
                    update_index(&write_txn, index, key, &old_keys, None)?;
                    (true, result)
                }
            }
        };
        if changed {
            write_txn.commit()?;
        }
        Ok(result)
    }

    /// Decode every value of a table, optionally restricted to a key range
    /// `[start, end)`. Undecodable rows are logged and skipped.
    pub(crate) fn scan_bincode<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        range: Option<(&str, &str)>,
    ) -> MetaStoreResult<Vec<(String, T)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let iter = match range {
            Some((start, end)) => table.range::<&str>(start..end)?,
            None => table.iter()?,
        };
        let mut result = Vec::new();
        for entry in iter {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<T>(entry.1.value()) {
                Ok(val) => result.push((key, val)),
                Err(e) => error!("Failed to decode entry '{}': {}", key, e),
            }
        }
        Ok(result)
    }

    /// Remove every row matching a predicate in one write transaction and
    /// return the removed values.
    pub(crate) fn remove_where<T, P>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        predicate: P,
    ) -> MetaStoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        P: Fn(&T) -> bool,
    {
        self.remove_where_indexed(table_def, None, predicate)
    }

    pub(crate) fn remove_where_indexed<T, P>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        index: Option<&SecondaryIndex<T>>,
        predicate: P,
    ) -> MetaStoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        P: Fn(&T) -> bool,
    {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(table_def)?;
            let mut matching = Vec::new();
            for entry in table.iter()? {
                let entry = entry?;
                let key = entry.0.value().to_string();
                match bincode::deserialize::<T>(entry.1.value()) {
                    Ok(val) if predicate(&val) => matching.push((key, val)),
                    Ok(_) => {}
                    Err(e) => error!("Failed to decode entry '{}': {}", key, e),
                }
            }
            for (key, val) in &matching {
                table.remove(key.as_str())?;
                if let Some(index) = index {
                    update_index(&write_txn, Some(index), key, &(index.keys)(val), None)?;
                }
            }
            matching.into_iter().map(|(_, val)| val).collect::<Vec<_>>()
        };
        if !removed.is_empty() {
            write_txn.commit()?;
        }
        Ok(removed)
    }

    /// Primary keys stored in an index table under `[start, end)`
    pub(crate) fn index_range(
        &self,
        index_def: TableDefinition<&str, &str>,
        start: &str,
        end: &str,
    ) -> MetaStoreResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(index_def)?;
        let mut result = Vec::new();
        for entry in table.range::<&str>(start..end)? {
            result.push(entry?.1.value().to_string());
        }
        Ok(result)
    }

    /// Whether an index table holds any key in `[start, end)`
    pub(crate) fn index_contains_range(
        &self,
        index_def: TableDefinition<&str, &str>,
        start: &str,
        end: &str,
    ) -> MetaStoreResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(index_def)?;
        let mut range = table.range::<&str>(start..end)?;
        Ok(range.next().transpose()?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_parent_and_tables() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("nested/meta.redb")).unwrap();
        let rows: Vec<(String, u64)> = store.scan_bincode(tables::ARCHIVES, None).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_insert_new_is_exclusive() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        assert!(store.insert_new_bincode(tables::ARCHIVES, "a", &1u64).unwrap());
        assert!(!store.insert_new_bincode(tables::ARCHIVES, "a", &2u64).unwrap());
        assert_eq!(store.get_bincode::<u64>(tables::ARCHIVES, "a").unwrap(), Some(1));
    }

    #[test]
    fn test_mutate_keep_does_not_write() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        store.put_bincode(tables::ARCHIVES, "a", &1u64).unwrap();

        let seen = store
            .mutate_bincode::<u64, _, _>(tables::ARCHIVES, "a", |cur| Ok((Mutation::Keep, cur)))
            .unwrap();
        assert_eq!(seen, Some(1));

        store
            .mutate_bincode::<u64, _, _>(tables::ARCHIVES, "a", |cur| {
                Ok((Mutation::Put(cur.unwrap_or(0) + 1), ()))
            })
            .unwrap();
        assert_eq!(store.get_bincode::<u64>(tables::ARCHIVES, "a").unwrap(), Some(2));
    }

    #[test]
    fn test_mutate_rejection_propagates() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        let err = store
            .mutate_bincode::<u64, (), _>(tables::ARCHIVES, "missing", |_| {
                Err(tapeio_common::Error::referential("missing").into())
            })
            .unwrap_err();
        let err: tapeio_common::Error = err.into();
        assert!(err.is_referential());
    }

    #[test]
    fn test_range_scan_and_remove_where() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        store.put_bincode(tables::OBJECTS, "c1\x00a", &1u64).unwrap();
        store.put_bincode(tables::OBJECTS, "c1\x00b", &2u64).unwrap();
        store.put_bincode(tables::OBJECTS, "c2\x00a", &3u64).unwrap();

        let c1: Vec<(String, u64)> = store
            .scan_bincode(tables::OBJECTS, Some(("c1\x00", "c1\x01")))
            .unwrap();
        assert_eq!(c1.len(), 2);

        let removed: Vec<u64> = store.remove_where(tables::OBJECTS, |v: &u64| *v >= 2).unwrap();
        assert_eq!(removed.len(), 2);
        let left: Vec<(String, u64)> = store.scan_bincode(tables::OBJECTS, None).unwrap();
        assert_eq!(left, vec![("c1\x00a".to_string(), 1)]);
    }
}
