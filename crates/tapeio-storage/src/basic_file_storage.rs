//! Staging area for objects waiting to be packed into tars.
//!
//! Files live under `{root}/{container}/{storageId}`. A storage id is a
//! fresh uuid followed by the object name, so rewriting an object never
//! overwrites the file of a previous version still waiting to be packed.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tapeio_common::{Error, Result, check_object_name, check_safe_filename};
use tracing::{debug, warn};

const UUID_PREFIX_LENGTH: usize = 32;

/// Local staging storage for input files
pub struct BasicFileStorage {
    root: PathBuf,
}

impl BasicFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Stage exactly `size` bytes from `input` and return the new storage id
    pub fn write_file(
        &self,
        container_name: &str,
        object_name: &str,
        input: &mut impl Read,
        size: u64,
    ) -> Result<String> {
        check_safe_filename(container_name)?;
        check_object_name(object_name)?;

        let storage_id = create_storage_id(object_name);
        let dir = self.root.join(container_name);
        fs::create_dir_all(&dir)?;
        let path = dir.join(&storage_id);

        let result = Self::copy_exact(input, &path, size);
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&path) {
                warn!("Could not remove partial file {}: {}", path.display(), cleanup);
            }
            return Err(e);
        }
        debug!("Staged {}/{} as {}", container_name, object_name, storage_id);
        Ok(storage_id)
    }

    fn copy_exact(input: &mut impl Read, path: &Path, size: u64) -> Result<()> {
        let file = File::create_new(path)?;
        let mut writer = BufWriter::new(file);
        let copied = io::copy(&mut input.by_ref().take(size), &mut writer)?;
        if copied != size {
            return Err(Error::FileLengthMismatch {
                path: path.display().to_string(),
                expected: size,
                actual: copied,
            });
        }
        // Anything left in the stream means the declared size was wrong
        let mut probe = [0u8; 1];
        if input.read(&mut probe)? != 0 {
            return Err(Error::FileLengthMismatch {
                path: path.display().to_string(),
                expected: size,
                actual: size + 1,
            });
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn read_file(&self, container_name: &str, storage_id: &str) -> Result<File> {
        Ok(File::open(self.path_of(container_name, storage_id)?)?)
    }

    /// Delete a staged file. Deleting a missing file is not an error.
    pub fn delete_file(&self, container_name: &str, storage_id: &str) -> Result<()> {
        let path = self.path_of(container_name, storage_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Staged file {} already deleted", path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lazily list the storage ids staged for a container
    pub fn list_storage_ids_by_container_name(
        &self,
        container_name: &str,
    ) -> Result<impl Iterator<Item = Result<String>> + use<>> {
        check_safe_filename(container_name)?;
        let dir = self.root.join(container_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(entries.into_iter().flatten().filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            match entry.file_type() {
                Ok(file_type) if file_type.is_file() => {}
                Ok(_) => return None,
                Err(e) => return Some(Err(e.into())),
            }
            Some(
                entry
                    .file_name()
                    .into_string()
                    .map_err(|name| Error::IllegalName(name.to_string_lossy().into_owned())),
            )
        }))
    }

    fn path_of(&self, container_name: &str, storage_id: &str) -> Result<PathBuf> {
        check_safe_filename(container_name)?;
        check_safe_filename(storage_id)?;
        Ok(self.root.join(container_name).join(storage_id))
    }
}

fn create_storage_id(object_name: &str) -> String {
    format!("{}-{object_name}", uuid::Uuid::new_v4().simple())
}

/// Recover the object name embedded in a storage id
pub fn storage_id_to_object_name(storage_id: &str) -> Result<&str> {
    storage_id
        .get(UUID_PREFIX_LENGTH..)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::IllegalName(format!("not a storage id: {storage_id}")))
}
