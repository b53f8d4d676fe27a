//! Cross-check of tar entry digests against the object referential.

use super::parse_entry_name;
use crate::basic_file_storage::storage_id_to_object_name;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tapeio_common::{Error, Result};
use tapeio_meta_store::ObjectReferentialRepository;
use tracing::{debug, warn};

/// Receives the digest of every entry read from a tar
pub trait TarEntryDigestCheck {
    fn add_digest_to_check(&mut self, entry_name: &str, digest: &str) -> Result<()>;

    /// Run the checks still buffered
    fn finalize_checks(&mut self) -> Result<()>;
}

struct PendingEntry {
    object_name: String,
    storage_id: String,
    entry_name: String,
    digest: String,
}

/// Buffers entry digests per container and checks them in bulk against the
/// tar entry descriptions recorded in the object referential.
///
/// Entries whose object was deleted, rewritten, or never got its location
/// updated to this tar are orphans and are skipped. A recorded entry with a
/// different digest is an error.
pub struct TarFileDigestVerifier {
    object_repository: Arc<ObjectReferentialRepository>,
    tar_id: String,
    bulk_size: usize,
    pending: BTreeMap<String, Vec<PendingEntry>>,
}

impl TarFileDigestVerifier {
    pub fn new(
        object_repository: Arc<ObjectReferentialRepository>,
        tar_id: impl Into<String>,
        bulk_size: usize,
    ) -> Self {
        Self {
            object_repository,
            tar_id: tar_id.into(),
            bulk_size: bulk_size.max(1),
            pending: BTreeMap::new(),
        }
    }

    fn check_container(&self, container: &str, entries: Vec<PendingEntry>) -> Result<()> {
        let mut names: Vec<String> = entries.iter().map(|e| e.object_name.clone()).collect();
        names.sort();
        names.dedup();
        let objects: HashMap<String, _> = self
            .object_repository
            .bulk_find(container, &names)?
            .into_iter()
            .map(|object| (object.id.object_name.clone(), object))
            .collect();

        for entry in entries {
            let Some(object) = objects.get(&entry.object_name) else {
                debug!(
                    "Orphan entry {} in tar {}: object deleted",
                    entry.entry_name, self.tar_id
                );
                continue;
            };
            if object.storage_id != entry.storage_id {
                debug!(
                    "Orphan entry {} in tar {}: object rewritten",
                    entry.entry_name, self.tar_id
                );
                continue;
            }
            let recorded = object.location.tar_entries().iter().find(|description| {
                description.tar_file_id == self.tar_id && description.entry_name == entry.entry_name
            });
            match recorded {
                Some(description) if description.digest_value != entry.digest => {
                    return Err(Error::DigestMismatch {
                        entry: format!("{}:{}", self.tar_id, entry.entry_name),
                        expected: description.digest_value.clone(),
                        actual: entry.digest,
                    });
                }
                Some(_) => {}
                None => debug!(
                    "Entry {} of tar {} not referenced by object {}/{}",
                    entry.entry_name, self.tar_id, container, entry.object_name
                ),
            }
        }
        Ok(())
    }
}

impl TarEntryDigestCheck for TarFileDigestVerifier {
    fn add_digest_to_check(&mut self, entry_name: &str, digest: &str) -> Result<()> {
        let (container, storage_id, _) = match parse_entry_name(entry_name) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Skipping unexpected entry in tar {}: {}", self.tar_id, e);
                return Ok(());
            }
        };
        let object_name = storage_id_to_object_name(storage_id)?.to_string();
        let batch = self.pending.entry(container.to_string()).or_default();
        batch.push(PendingEntry {
            object_name,
            storage_id: storage_id.to_string(),
            entry_name: entry_name.to_string(),
            digest: digest.to_string(),
        });
        if batch.len() >= self.bulk_size {
            let entries = std::mem::take(batch);
            self.check_container(container, entries)?;
        }
        Ok(())
    }

    fn finalize_checks(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for (container, entries) in pending {
            if !entries.is_empty() {
                self.check_container(&container, entries)?;
            }
        }
        Ok(())
    }
}
