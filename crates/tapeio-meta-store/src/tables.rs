//! Redb table definitions for the referentials.

use redb::TableDefinition;

// Key: "container\x00objectName", Value: bincode-encoded ObjectReferentialEntity
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

// Key: archive id, Value: bincode-encoded ArchiveReferentialEntity
pub const ARCHIVES: TableDefinition<&str, &[u8]> = TableDefinition::new("archives");

// Key: request id, Value: bincode-encoded AccessRequestEntity
pub const ACCESS_REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("access_requests");

// Key: "archiveId\x00requestId", Value: request id
pub const ACCESS_REQUESTS_BY_ARCHIVE: TableDefinition<&str, &str> =
    TableDefinition::new("access_requests_by_archive");

// Key: "messageType\x00fileName", Value: bincode-encoded QueueEntry
pub const QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");
