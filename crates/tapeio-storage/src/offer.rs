//! Object storage facade of the tape library offer.

use crate::access_request::AccessRequestManager;
use crate::basic_file_storage::BasicFileStorage;
use crate::tar_creator::TarCreatorManager;
use crate::topology::BucketTopologyHelper;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use tapeio_common::{
    AccessRequestStatus, Clock, DigestReader, DigestType, Error, InputFileToProcessMessage,
    Result,
};
use tapeio_meta_store::{
    ObjectReferentialEntity, ObjectReferentialId, ObjectReferentialRepository,
    ObjectStorageLocation,
};
use tracing::{debug, error, info};

/// Stored metadata of an object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub container_name: String,
    pub object_name: String,
    pub digest: String,
    pub digest_type: DigestType,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl From<ObjectReferentialEntity> for ObjectMetadata {
    fn from(entity: ObjectReferentialEntity) -> Self {
        Self {
            container_name: entity.id.container_name,
            object_name: entity.id.object_name,
            digest: entity.digest,
            digest_type: entity.digest_type,
            size: entity.size,
            last_modified: entity.last_object_modified_date,
        }
    }
}

/// Entry point used by the offer's object API.
///
/// Writes are staged on disk and packed into tars asynchronously. Reads go
/// through access requests: objects become readable once every archive
/// holding them is on disk or in the archive cache.
pub struct TapeLibraryStorage {
    topology: Arc<BucketTopologyHelper>,
    file_storage: Arc<BasicFileStorage>,
    object_repository: Arc<ObjectReferentialRepository>,
    tar_creator_manager: Arc<TarCreatorManager>,
    access_request_manager: Arc<AccessRequestManager>,
    clock: Arc<dyn Clock>,
}

impl TapeLibraryStorage {
    pub fn new(
        topology: Arc<BucketTopologyHelper>,
        file_storage: Arc<BasicFileStorage>,
        object_repository: Arc<ObjectReferentialRepository>,
        tar_creator_manager: Arc<TarCreatorManager>,
        access_request_manager: Arc<AccessRequestManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topology,
            file_storage,
            object_repository,
            tar_creator_manager,
            access_request_manager,
            clock,
        }
    }

    /// Stage `size` bytes of `input` as the new version of an object and
    /// return their digest
    pub fn put_object(
        &self,
        container_name: &str,
        object_name: &str,
        input: &mut impl Read,
        digest_type: DigestType,
        size: u64,
    ) -> Result<String> {
        debug!("Upload object {} in container {}", object_name, container_name);
        self.topology
            .get_file_bucket_from_container_name(container_name)?;

        let mut reader = DigestReader::new(input, digest_type);
        let storage_id = self
            .file_storage
            .write_file(container_name, object_name, &mut reader, size)?;
        let digest = reader.finalize_hex();

        let now = self.clock.now();
        let indexed = self
            .object_repository
            .insert_or_update(&ObjectReferentialEntity {
                id: ObjectReferentialId::new(container_name, object_name),
                size,
                digest_type,
                digest: digest.clone(),
                storage_id: storage_id.clone(),
                location: ObjectStorageLocation::InputFile,
                last_object_modified_date: now,
                last_update_date: now,
            });
        if let Err(e) = &indexed {
            // Packed anyway: an orphan entry is harmless, a lost object is not
            error!(
                "Could not index object {}/{}: {}",
                container_name, object_name, e
            );
        }
        self.tar_creator_manager
            .add_to_queue(InputFileToProcessMessage {
                container_name: container_name.to_string(),
                object_name: object_name.to_string(),
                storage_id,
                size,
                digest_value: digest.clone(),
                digest_algorithm: digest_type,
            })?;
        indexed?;
        Ok(digest)
    }

    /// Objects are only readable through access requests
    pub fn get_object(&self, container_name: &str, object_name: &str) -> Result<File> {
        Err(Error::not_implemented(format!(
            "synchronous read of {container_name}/{object_name}, use an access request"
        )))
    }

    /// Forget an object. Its staged file or tar entries become orphans.
    pub fn delete_object(&self, container_name: &str, object_name: &str) -> Result<()> {
        if self.object_repository.delete(container_name, object_name)? {
            info!("Deleted object {}/{}", container_name, object_name);
            Ok(())
        } else {
            Err(object_not_found(container_name, object_name))
        }
    }

    pub fn is_existing_object(&self, container_name: &str, object_name: &str) -> Result<bool> {
        Ok(self
            .object_repository
            .find(container_name, object_name)?
            .is_some())
    }

    /// Digest recorded at write time. Asking for another algorithm fails.
    pub fn get_object_digest(
        &self,
        container_name: &str,
        object_name: &str,
        digest_type: DigestType,
    ) -> Result<String> {
        let entity = self.find_object(container_name, object_name)?;
        if entity.digest_type != digest_type {
            return Err(Error::invalid_request(format!(
                "object {container_name}/{object_name} has a {} digest, {} requested",
                entity.digest_type.name(),
                digest_type.name()
            )));
        }
        Ok(entity.digest)
    }

    pub fn get_object_metadata(
        &self,
        container_name: &str,
        object_name: &str,
    ) -> Result<ObjectMetadata> {
        Ok(self.find_object(container_name, object_name)?.into())
    }

    /// Object names of a container, in name order
    pub fn list_container(&self, container_name: &str) -> Result<Vec<String>> {
        Ok(self
            .object_repository
            .list_container(container_name)?
            .into_iter()
            .map(|entity| entity.id.object_name)
            .collect())
    }

    pub fn create_access_request(
        &self,
        container_name: &str,
        object_names: &[String],
        tenant: u32,
    ) -> Result<String> {
        self.access_request_manager
            .create_access_request(container_name, object_names, tenant)
    }

    pub fn check_access_request_statuses(
        &self,
        request_ids: &[String],
        tenant: u32,
        admin_cross_tenant: bool,
    ) -> Result<HashMap<String, AccessRequestStatus>> {
        self.access_request_manager
            .check_access_request_statuses(request_ids, tenant, admin_cross_tenant)
    }

    pub fn remove_access_request(
        &self,
        request_id: &str,
        tenant: u32,
        admin_cross_tenant: bool,
    ) -> Result<()> {
        self.access_request_manager
            .remove_access_request(request_id, tenant, admin_cross_tenant)
    }

    pub fn check_object_availability(
        &self,
        container_name: &str,
        object_names: &[String],
    ) -> Result<bool> {
        self.access_request_manager
            .check_object_availability(container_name, object_names)
    }

    fn find_object(&self, container_name: &str, object_name: &str) -> Result<ObjectReferentialEntity> {
        self.object_repository
            .find(container_name, object_name)?
            .ok_or_else(|| object_not_found(container_name, object_name))
    }
}

fn object_not_found(container_name: &str, object_name: &str) -> Error {
    Error::ObjectNotFound {
        container: container_name.to_string(),
        object: object_name.to_string(),
    }
}
