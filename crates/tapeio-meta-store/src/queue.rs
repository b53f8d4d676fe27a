//! Durable read/write order queue shared with the tape engine.
//!
//! Messages are grouped by (message type, archive id): at most one message
//! per group is ever queued, which makes enqueueing idempotent.

use crate::store::{MetaStore, Mutation};
use crate::tables;
use crate::types::{QueueEntry, QueueMessageState};
use chrono::Utc;
use std::sync::Arc;
use tapeio_common::{QueueMessage, QueueMessageType, Result};
use tracing::debug;

/// Queue contract consumed by the storage engine
pub trait QueueRepository: Send + Sync {
    /// Enqueue unless a message with the same grouping key is already
    /// queued. Returns whether the message was added.
    fn add_if_absent(&self, message: QueueMessage) -> Result<bool>;

    /// Remove a queued message the tape engine has not picked up yet.
    /// Returns whether it was removed.
    fn try_cancel_if_not_started(
        &self,
        message_type: QueueMessageType,
        file_name: &str,
    ) -> Result<bool>;
}

fn queue_key(message_type: QueueMessageType, file_name: &str) -> String {
    format!("{}\x00{file_name}", message_type.as_str())
}

/// redb-backed queue
pub struct QueueStore {
    store: Arc<MetaStore>,
}

impl QueueStore {
    #[must_use]
    pub const fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    /// Oldest ready message of a type, marked as started
    pub fn take_next(&self, message_type: QueueMessageType) -> Result<Option<QueueMessage>> {
        let start = format!("{}\x00", message_type.as_str());
        let end = format!("{}\x01", message_type.as_str());
        let candidate = self
            .store
            .scan_bincode::<QueueEntry>(tables::QUEUE, Some((start.as_str(), end.as_str())))?
            .into_iter()
            .filter(|(_, entry)| entry.state == QueueMessageState::Ready)
            .min_by_key(|(_, entry)| entry.created);
        let Some((key, _)) = candidate else {
            return Ok(None);
        };
        Ok(self.store.mutate_bincode(
            tables::QUEUE,
            &key,
            |current: Option<QueueEntry>| match current {
                Some(mut entry) if entry.state == QueueMessageState::Ready => {
                    entry.state = QueueMessageState::Running;
                    let message = entry.message.clone();
                    Ok((Mutation::Put(entry), Some(message)))
                }
                _ => Ok((Mutation::Keep, None)),
            },
        )?)
    }

    /// Drop a message once the tape engine is done with it
    pub fn complete(&self, message_type: QueueMessageType, file_name: &str) -> Result<bool> {
        Ok(self
            .store
            .delete_key(tables::QUEUE, &queue_key(message_type, file_name))?)
    }

    /// Number of queued messages, started ones included
    pub fn size(&self) -> Result<usize> {
        Ok(self
            .store
            .scan_bincode::<QueueEntry>(tables::QUEUE, None)?
            .len())
    }

    pub fn find(
        &self,
        message_type: QueueMessageType,
        file_name: &str,
    ) -> Result<Option<QueueEntry>> {
        Ok(self
            .store
            .get_bincode(tables::QUEUE, &queue_key(message_type, file_name))?)
    }
}

impl QueueRepository for QueueStore {
    fn add_if_absent(&self, message: QueueMessage) -> Result<bool> {
        let key = queue_key(message.message_type(), message.file_name());
        let entry = QueueEntry {
            message,
            state: QueueMessageState::Ready,
            created: Utc::now(),
        };
        let added = self.store.insert_new_bincode(tables::QUEUE, &key, &entry)?;
        if !added {
            debug!(
                "{:?} for {} already queued",
                entry.message.message_type(),
                entry.message.file_name()
            );
        }
        Ok(added)
    }

    fn try_cancel_if_not_started(
        &self,
        message_type: QueueMessageType,
        file_name: &str,
    ) -> Result<bool> {
        Ok(self.store.mutate_bincode(
            tables::QUEUE,
            &queue_key(message_type, file_name),
            |current: Option<QueueEntry>| match current {
                Some(entry) if entry.state == QueueMessageState::Ready => {
                    Ok((Mutation::Delete, true))
                }
                _ => Ok((Mutation::Keep, false)),
            },
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeio_common::{ReadOrder, WriteOrder};
    use tempfile::tempdir;

    fn queue() -> (tempfile::TempDir, QueueStore) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        (dir, QueueStore::new(store))
    }

    fn read_order(archive_id: &str) -> QueueMessage {
        QueueMessage::ReadOrder(ReadOrder {
            tape_code: "VIT0001".into(),
            file_position: 2,
            file_name: archive_id.into(),
            bucket: "test".into(),
            file_bucket_id: "test-objects".into(),
            size: 1024,
        })
    }

    #[test]
    fn test_add_if_absent_dedups_per_type() {
        let (_dir, queue) = queue();
        assert!(queue.add_if_absent(read_order("tarId2")).unwrap());
        assert!(!queue.add_if_absent(read_order("tarId2")).unwrap());

        let write = QueueMessage::WriteOrder(WriteOrder {
            bucket: "test".into(),
            file_bucket_id: "test-objects".into(),
            file_path: "test-objects/tarId2".into(),
            size: 1024,
            digest: "d".into(),
            archive_id: "tarId2".into(),
        });
        assert!(queue.add_if_absent(write).unwrap());
        assert_eq!(queue.size().unwrap(), 2);
    }

    #[test]
    fn test_cancel_only_if_not_started() {
        let (_dir, queue) = queue();
        queue.add_if_absent(read_order("t1")).unwrap();
        queue.add_if_absent(read_order("t2")).unwrap();

        assert!(
            queue
                .try_cancel_if_not_started(QueueMessageType::ReadOrder, "t1")
                .unwrap()
        );
        assert!(
            !queue
                .try_cancel_if_not_started(QueueMessageType::ReadOrder, "t1")
                .unwrap()
        );

        let started = queue.take_next(QueueMessageType::ReadOrder).unwrap().unwrap();
        assert_eq!(started.file_name(), "t2");
        assert!(
            !queue
                .try_cancel_if_not_started(QueueMessageType::ReadOrder, "t2")
                .unwrap()
        );
        assert!(queue.take_next(QueueMessageType::ReadOrder).unwrap().is_none());

        assert!(queue.complete(QueueMessageType::ReadOrder, "t2").unwrap());
        assert_eq!(queue.size().unwrap(), 0);
    }
}
