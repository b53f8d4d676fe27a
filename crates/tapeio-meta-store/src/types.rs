//! Stored types for the referentials.
//!
//! These types are serialized to redb via bincode. Locations are sum types:
//! every update matches on the current variant and rejects transitions that
//! do not follow the archive lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tapeio_common::{AccessRequestStatus, DigestType, QueueMessage, TarEntryDescription};

/// Composite key of an object referential row
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectReferentialId {
    pub container_name: String,
    pub object_name: String,
}

impl ObjectReferentialId {
    pub fn new(container_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            object_name: object_name.into(),
        }
    }

    pub(crate) fn storage_key(&self) -> String {
        object_key(&self.container_name, &self.object_name)
    }
}

pub(crate) fn object_key(container: &str, object: &str) -> String {
    format!("{container}\x00{object}")
}

/// Where the authoritative copy of an object lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStorageLocation {
    /// Staged file in the input files directory, not yet packed
    InputFile,
    /// Packed into one or more tar entries, in segment order
    Tar(Vec<TarEntryDescription>),
}

impl ObjectStorageLocation {
    #[must_use]
    pub const fn is_input_file(&self) -> bool {
        matches!(self, Self::InputFile)
    }

    /// Tar entries of the object, empty while it is still an input file
    #[must_use]
    pub fn tar_entries(&self) -> &[TarEntryDescription] {
        match self {
            Self::InputFile => &[],
            Self::Tar(entries) => entries,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReferentialEntity {
    pub id: ObjectReferentialId,
    pub size: u64,
    pub digest_type: DigestType,
    pub digest: String,
    /// Name of the staged file holding this version of the object
    pub storage_id: String,
    pub location: ObjectStorageLocation,
    pub last_object_modified_date: DateTime<Utc>,
    pub last_update_date: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveEntryType {
    #[default]
    Data,
    Backup,
}

/// Where an archive lives. Transitions only move forward:
/// building-on-disk, then ready-on-disk, then on-tape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveLocation {
    BuildingOnDisk,
    ReadyOnDisk,
    OnTape { tape_code: String, file_position: u32 },
}

impl fmt::Display for ArchiveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildingOnDisk => f.write_str("building-on-disk"),
            Self::ReadyOnDisk => f.write_str("ready-on-disk"),
            Self::OnTape {
                tape_code,
                file_position,
            } => write!(f, "on-tape({tape_code}:{file_position})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReferentialEntity {
    pub archive_id: String,
    pub entry_type: ArchiveEntryType,
    pub location: ArchiveLocation,
    /// Final size, known once sealed
    pub size: Option<u64>,
    /// Final digest, known once sealed
    pub digest: Option<String>,
    pub last_update_date: DateTime<Utc>,
}

impl ArchiveReferentialEntity {
    /// A freshly opened tar
    #[must_use]
    pub fn building(archive_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            archive_id: archive_id.into(),
            entry_type: ArchiveEntryType::Data,
            location: ArchiveLocation::BuildingOnDisk,
            size: None,
            digest: None,
            last_update_date: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequestEntity {
    pub request_id: String,
    pub container_name: String,
    pub object_names: Vec<String>,
    pub creation_date: DateTime<Utc>,
    pub ready_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub purge_date: Option<DateTime<Utc>>,
    /// Archives that still have to be read back from tape
    pub unavailable_archive_ids: Vec<String>,
    pub tenant: u32,
    /// Optimistic concurrency counter, bumped on every update
    pub version: u64,
}

impl AccessRequestEntity {
    /// Status at the given instant
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> AccessRequestStatus {
        match self.expiration_date {
            Some(expiration) if expiration <= now => AccessRequestStatus::Expired,
            _ if self.unavailable_archive_ids.is_empty() => AccessRequestStatus::Ready,
            _ => AccessRequestStatus::NotReady,
        }
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready_date.is_some()
    }

    /// Not expired at the given instant (not-ready requests never expire)
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_none_or(|expiration| expiration > now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueMessageState {
    /// Waiting for the tape engine
    Ready,
    /// Picked up by the tape engine, can no longer be cancelled
    Running,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message: QueueMessage,
    pub state: QueueMessageState,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(now: DateTime<Utc>) -> AccessRequestEntity {
        AccessRequestEntity {
            request_id: "r".into(),
            container_name: "0_object".into(),
            object_names: vec!["obj1".into()],
            creation_date: now,
            ready_date: None,
            expiration_date: None,
            purge_date: None,
            unavailable_archive_ids: vec!["tarId4".into()],
            tenant: 0,
            version: 0,
        }
    }

    #[test]
    fn test_access_request_status() {
        let now = Utc::now();
        let mut req = request(now);
        assert_eq!(req.status(now), AccessRequestStatus::NotReady);
        assert!(req.is_live(now));

        req.unavailable_archive_ids.clear();
        req.ready_date = Some(now);
        req.expiration_date = Some(now + Duration::hours(1));
        req.purge_date = Some(now + Duration::hours(2));
        assert_eq!(req.status(now), AccessRequestStatus::Ready);
        assert_eq!(
            req.status(now + Duration::hours(1)),
            AccessRequestStatus::Expired
        );
        assert!(!req.is_live(now + Duration::hours(1)));
    }

    #[test]
    fn test_object_location_entries() {
        assert!(ObjectStorageLocation::InputFile.tar_entries().is_empty());
        let loc = ObjectStorageLocation::Tar(vec![TarEntryDescription {
            tar_file_id: "t.tar".into(),
            entry_name: "0_object/x-0".into(),
            start_pos: 0,
            size: 3,
            digest_value: "d".into(),
        }]);
        assert_eq!(loc.tar_entries().len(), 1);
        assert!(!loc.is_input_file());
    }
}
