//! Core types for TapeIO
//!
//! Value types shared between the metadata store and the storage engine:
//! data categories, tar entry descriptions, queue messages and naming
//! rules for archives and objects.

use crate::checksum::DigestType;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// File extension of a tar archive still being written
pub const TMP_EXTENSION: &str = ".tmp";

/// Extension of every tar archive id
pub const TAR_EXTENSION: &str = ".tar";

/// Maximum length of an object name. Keeps tar entry names
/// (`{container}/{storageId}-{segment}`) within a ustar header.
pub const MAX_OBJECT_NAME_LENGTH: usize = 60;

/// Maximum length of a file bucket id or archive id used as a filename
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Data category of a container
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataCategory {
    Unit,
    ObjectGroup,
    Object,
    Logbook,
    Report,
    Manifest,
    Profile,
    StorageLog,
    Rules,
    Dip,
    Agencies,
    Backup,
    BackupOperation,
    AccessionRegisterDetail,
}

impl DataCategory {
    pub const ALL: [Self; 14] = [
        Self::Unit,
        Self::ObjectGroup,
        Self::Object,
        Self::Logbook,
        Self::Report,
        Self::Manifest,
        Self::Profile,
        Self::StorageLog,
        Self::Rules,
        Self::Dip,
        Self::Agencies,
        Self::Backup,
        Self::BackupOperation,
        Self::AccessionRegisterDetail,
    ];

    /// Folder name used in container names
    #[must_use]
    pub const fn folder(self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::ObjectGroup => "objectGroup",
            Self::Object => "object",
            Self::Logbook => "logbook",
            Self::Report => "report",
            Self::Manifest => "manifest",
            Self::Profile => "profile",
            Self::StorageLog => "storagelog",
            Self::Rules => "rules",
            Self::Dip => "dip",
            Self::Agencies => "agencies",
            Self::Backup => "backup",
            Self::BackupOperation => "backupoperations",
            Self::AccessionRegisterDetail => "accessionregisterdetail",
        }
    }

    #[must_use]
    pub fn from_folder(folder: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.folder() == folder)
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

/// Container name for a tenant and data category
#[must_use]
pub fn container_name(tenant: u32, category: DataCategory) -> String {
    format!("{tenant}_{}", category.folder())
}

/// Split a container name into its tenant and data category
pub fn parse_container_name(container: &str) -> Result<(u32, DataCategory)> {
    let (tenant, folder) = container
        .split_once('_')
        .ok_or_else(|| Error::invalid_argument(format!("malformed container name: {container}")))?;
    let tenant = tenant.parse::<u32>().map_err(|_| {
        Error::invalid_argument(format!("invalid tenant in container name: {container}"))
    })?;
    let category = DataCategory::from_folder(folder).ok_or_else(|| {
        Error::invalid_argument(format!("unknown data category in container name: {container}"))
    })?;
    Ok((tenant, category))
}

/// Position of one tar entry holding (a segment of) an object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarEntryDescription {
    /// Archive id of the tar holding the entry
    pub tar_file_id: String,
    /// Entry name inside the tar
    pub entry_name: String,
    /// Byte offset of the entry header in the tar file
    pub start_pos: u64,
    /// Entry content size in bytes
    pub size: u64,
    /// Hex digest of the entry content
    pub digest_value: String,
}

/// Final size and digest of a sealed or repaired file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestWithSize {
    pub size: u64,
    pub digest: String,
}

/// A freshly staged object waiting to be packed into a tar
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFileToProcessMessage {
    pub container_name: String,
    pub object_name: String,
    pub storage_id: String,
    pub size: u64,
    pub digest_value: String,
    pub digest_algorithm: DigestType,
}

/// Intent to copy an archive from tape back into the cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOrder {
    pub tape_code: String,
    pub file_position: u32,
    pub file_name: String,
    pub bucket: String,
    pub file_bucket_id: String,
    pub size: u64,
}

/// Intent to copy a sealed archive to tape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOrder {
    pub bucket: String,
    pub file_bucket_id: String,
    /// Path relative to the input tars directory
    pub file_path: String,
    pub size: u64,
    pub digest: String,
    pub archive_id: String,
}

/// Messages carried by the read/write queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueMessage {
    ReadOrder(ReadOrder),
    WriteOrder(WriteOrder),
}

/// Discriminant of a queue message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueMessageType {
    ReadOrder,
    WriteOrder,
}

impl QueueMessageType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadOrder => "read",
            Self::WriteOrder => "write",
        }
    }
}

impl QueueMessage {
    #[must_use]
    pub const fn message_type(&self) -> QueueMessageType {
        match self {
            Self::ReadOrder(_) => QueueMessageType::ReadOrder,
            Self::WriteOrder(_) => QueueMessageType::WriteOrder,
        }
    }

    /// Archive id the message is about; together with the message type it
    /// forms the queue grouping key
    #[must_use]
    pub fn file_name(&self) -> &str {
        match self {
            Self::ReadOrder(order) => &order.file_name,
            Self::WriteOrder(order) => &order.archive_id,
        }
    }
}

/// Externally visible status of an access request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessRequestStatus {
    NotFound,
    NotReady,
    Ready,
    Expired,
}

impl fmt::Display for AccessRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "NOT_FOUND",
            Self::NotReady => "NOT_READY",
            Self::Ready => "READY",
            Self::Expired => "EXPIRED",
        })
    }
}

/// Generate a new archive id: `{yyyyMMddHHmmssSSS}-{uuid}.tar`
#[must_use]
pub fn create_tar_id(now: DateTime<Utc>) -> String {
    format!(
        "{}-{}{TAR_EXTENSION}",
        now.format("%Y%m%d%H%M%S%3f"),
        uuid::Uuid::new_v4().simple()
    )
}

/// Whether a name can be used as a single path component without escaping
/// its parent directory
#[must_use]
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LENGTH
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Validate a name used as a single path component
pub fn check_safe_filename(name: &str) -> Result<()> {
    if is_safe_filename(name) {
        Ok(())
    } else {
        Err(Error::IllegalName(name.to_string()))
    }
}

/// Validate an object name: safe filename, short enough to fit tar headers
pub fn check_object_name(name: &str) -> Result<()> {
    check_safe_filename(name)?;
    if name.len() > MAX_OBJECT_NAME_LENGTH {
        return Err(Error::IllegalName(format!(
            "object name exceeds {MAX_OBJECT_NAME_LENGTH} characters: {name}"
        )));
    }
    Ok(())
}
