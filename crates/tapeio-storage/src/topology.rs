//! Bucket topology: which tar pipeline a container belongs to.
//!
//! A bucket groups tenants and carries the tar buffering timeout. A file
//! bucket groups data category folders. Every (bucket, file bucket) pair is
//! an independent tar pipeline identified by `{bucket}-{fileBucket}`.

use std::collections::{BTreeMap, HashMap};
use tapeio_common::config::TopologyConfig;
use tapeio_common::{DataCategory, Error, Result, container_name, parse_container_name};

/// File bucket receiving every folder not explicitly routed elsewhere
pub const DEFAULT_FILE_BUCKET: &str = "default";

#[derive(Clone, Debug)]
struct FileBucketInfo {
    bucket: String,
    name: String,
    keep_forever_in_cache: bool,
}

/// Immutable container to file bucket mapping
#[derive(Clone, Debug)]
pub struct BucketTopologyHelper {
    tenant_to_bucket: HashMap<u32, String>,
    bucket_tenants: BTreeMap<String, Vec<u32>>,
    bucket_timeouts: HashMap<String, i64>,
    folder_to_file_bucket: HashMap<DataCategory, String>,
    file_buckets: BTreeMap<String, FileBucketInfo>,
}

impl BucketTopologyHelper {
    /// Build and validate the mapping
    pub fn new(config: &TopologyConfig) -> Result<Self> {
        if config.buckets.is_empty() {
            return Err(Error::config("no bucket configured"));
        }

        let mut tenant_to_bucket = HashMap::new();
        let mut bucket_tenants = BTreeMap::new();
        let mut bucket_timeouts = HashMap::new();
        for (bucket, bucket_config) in &config.buckets {
            tapeio_common::check_safe_filename(bucket)
                .map_err(|_| Error::config(format!("illegal bucket name: {bucket}")))?;
            if bucket_config.tar_buffering_timeout_minutes < 0 {
                return Err(Error::config(format!(
                    "negative tar buffering timeout for bucket {bucket}"
                )));
            }
            for tenant in &bucket_config.tenants {
                if let Some(other) = tenant_to_bucket.insert(*tenant, bucket.clone()) {
                    return Err(Error::config(format!(
                        "tenant {tenant} assigned to both {other} and {bucket}"
                    )));
                }
            }
            bucket_tenants.insert(bucket.clone(), bucket_config.tenants.clone());
            bucket_timeouts.insert(bucket.clone(), bucket_config.tar_buffering_timeout_minutes);
        }

        if !config.file_buckets.contains_key(DEFAULT_FILE_BUCKET) {
            return Err(Error::config(format!(
                "missing '{DEFAULT_FILE_BUCKET}' file bucket"
            )));
        }

        let mut folder_to_file_bucket = HashMap::new();
        for (name, file_bucket_config) in &config.file_buckets {
            tapeio_common::check_safe_filename(name)
                .map_err(|_| Error::config(format!("illegal file bucket name: {name}")))?;
            if name == DEFAULT_FILE_BUCKET && !file_bucket_config.folders.is_empty() {
                return Err(Error::config(format!(
                    "'{DEFAULT_FILE_BUCKET}' file bucket cannot list folders"
                )));
            }
            for folder in &file_bucket_config.folders {
                let category = DataCategory::from_folder(folder)
                    .ok_or_else(|| Error::config(format!("unknown folder: {folder}")))?;
                if let Some(other) = folder_to_file_bucket.insert(category, name.clone()) {
                    return Err(Error::config(format!(
                        "folder {folder} listed in both {other} and {name}"
                    )));
                }
            }
        }

        let mut file_buckets = BTreeMap::new();
        for bucket in config.buckets.keys() {
            for (name, file_bucket_config) in &config.file_buckets {
                file_buckets.insert(
                    format!("{bucket}-{name}"),
                    FileBucketInfo {
                        bucket: bucket.clone(),
                        name: name.clone(),
                        keep_forever_in_cache: file_bucket_config.keep_forever_in_cache,
                    },
                );
            }
        }

        Ok(Self {
            tenant_to_bucket,
            bucket_tenants,
            bucket_timeouts,
            folder_to_file_bucket,
            file_buckets,
        })
    }

    pub fn get_file_bucket_from_container_name(&self, container: &str) -> Result<String> {
        let (tenant, category) = parse_container_name(container)?;
        let bucket = self.tenant_to_bucket.get(&tenant).ok_or_else(|| {
            Error::invalid_argument(format!("tenant {tenant} is not assigned to any bucket"))
        })?;
        let file_bucket = self
            .folder_to_file_bucket
            .get(&category)
            .map_or(DEFAULT_FILE_BUCKET, String::as_str);
        Ok(format!("{bucket}-{file_bucket}"))
    }

    pub fn get_bucket_from_file_bucket(&self, file_bucket_id: &str) -> Result<&str> {
        self.file_buckets
            .get(file_bucket_id)
            .map(|info| info.bucket.as_str())
            .ok_or_else(|| Error::invalid_argument(format!("unknown file bucket {file_bucket_id}")))
    }

    #[must_use]
    pub fn is_valid_file_bucket_id(&self, file_bucket_id: &str) -> bool {
        self.file_buckets.contains_key(file_bucket_id)
    }

    /// Every file bucket id, sorted
    #[must_use]
    pub fn list_file_buckets(&self) -> Vec<String> {
        self.file_buckets.keys().cloned().collect()
    }

    /// Every container routed to a file bucket
    pub fn list_container_names(&self, file_bucket_id: &str) -> Result<Vec<String>> {
        let info = self.file_buckets.get(file_bucket_id).ok_or_else(|| {
            Error::invalid_argument(format!("unknown file bucket {file_bucket_id}"))
        })?;
        let tenants = self
            .bucket_tenants
            .get(&info.bucket)
            .map_or(&[][..], Vec::as_slice);
        let categories: Vec<DataCategory> = DataCategory::ALL
            .into_iter()
            .filter(|category| {
                self.folder_to_file_bucket
                    .get(category)
                    .map_or(DEFAULT_FILE_BUCKET, String::as_str)
                    == info.name
            })
            .collect();

        let mut containers = Vec::with_capacity(tenants.len() * categories.len());
        for tenant in tenants {
            for category in &categories {
                containers.push(container_name(*tenant, *category));
            }
        }
        Ok(containers)
    }

    pub fn get_tar_buffering_timeout_in_minutes(&self, bucket: &str) -> Result<i64> {
        self.bucket_timeouts
            .get(bucket)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("unknown bucket {bucket}")))
    }

    #[must_use]
    pub fn keep_file_bucket_id_forever_in_cache(&self, file_bucket_id: &str) -> bool {
        self.file_buckets
            .get(file_bucket_id)
            .is_some_and(|info| info.keep_forever_in_cache)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tapeio_common::config::{BucketConfig, FileBucketConfig};

    /// Buckets `test` (tenants 0, 1) and `admin` (tenant 2); file buckets
    /// `default`, `metadata` (unit, objectGroup, kept forever) and
    /// `objects` (object).
    pub(crate) fn topology_config() -> TopologyConfig {
        let mut config = TopologyConfig::default();
        config.buckets.clear();
        config.buckets.insert(
            "test".into(),
            BucketConfig {
                tenants: vec![0, 1],
                tar_buffering_timeout_minutes: 60,
            },
        );
        config.buckets.insert(
            "admin".into(),
            BucketConfig {
                tenants: vec![2],
                tar_buffering_timeout_minutes: 5,
            },
        );
        config
    }

    pub(crate) fn helper() -> BucketTopologyHelper {
        BucketTopologyHelper::new(&topology_config()).unwrap()
    }

    #[test]
    fn test_container_routing() {
        let helper = helper();
        assert_eq!(
            helper.get_file_bucket_from_container_name("0_unit").unwrap(),
            "test-metadata"
        );
        assert_eq!(
            helper.get_file_bucket_from_container_name("1_object").unwrap(),
            "test-objects"
        );
        assert_eq!(
            helper.get_file_bucket_from_container_name("2_logbook").unwrap(),
            "admin-default"
        );
        assert!(helper.get_file_bucket_from_container_name("9_unit").is_err());
        assert!(helper.get_file_bucket_from_container_name("garbage").is_err());
    }

    #[test]
    fn test_bucket_lookups() {
        let helper = helper();
        assert_eq!(helper.get_bucket_from_file_bucket("admin-objects").unwrap(), "admin");
        assert!(helper.get_bucket_from_file_bucket("nope").is_err());
        assert!(helper.is_valid_file_bucket_id("test-default"));
        assert!(!helper.is_valid_file_bucket_id("test"));
        assert_eq!(helper.list_file_buckets().len(), 6);
        assert_eq!(helper.get_tar_buffering_timeout_in_minutes("admin").unwrap(), 5);
        assert!(helper.keep_file_bucket_id_forever_in_cache("test-metadata"));
        assert!(!helper.keep_file_bucket_id_forever_in_cache("test-objects"));
    }

    #[test]
    fn test_list_container_names() {
        let helper = helper();
        let mut containers = helper.list_container_names("test-metadata").unwrap();
        containers.sort();
        assert_eq!(
            containers,
            vec!["0_objectGroup", "0_unit", "1_objectGroup", "1_unit"]
        );
        let defaults = helper.list_container_names("admin-default").unwrap();
        assert!(defaults.contains(&"2_logbook".to_string()));
        assert!(!defaults.contains(&"2_unit".to_string()));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = topology_config();
        config.buckets.get_mut("admin").unwrap().tenants.push(0);
        assert!(BucketTopologyHelper::new(&config).is_err());

        let mut config = topology_config();
        config.buckets.clear();
        assert!(BucketTopologyHelper::new(&config).is_err());

        let mut config = topology_config();
        config.file_buckets.remove(DEFAULT_FILE_BUCKET);
        assert!(BucketTopologyHelper::new(&config).is_err());

        let mut config = topology_config();
        config
            .buckets
            .get_mut("test")
            .unwrap()
            .tar_buffering_timeout_minutes = -1;
        assert!(BucketTopologyHelper::new(&config).is_err());

        let mut config = topology_config();
        config.file_buckets.insert(
            "other".into(),
            FileBucketConfig {
                folders: vec!["unit".into()],
                keep_forever_in_cache: false,
            },
        );
        assert!(BucketTopologyHelper::new(&config).is_err());
    }
}
