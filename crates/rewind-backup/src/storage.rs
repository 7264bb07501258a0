//! Backup storage access
//!
//! Backup data lives in object storage under the location's prefix:
//!
//! ```text
//! <prefix>/backups/<name>/<name>.tar.gz
//! <prefix>/backups/<name>/<name>-volumesnapshots.json.gz
//! <prefix>/restores/<name>/...
//! ```
//!
//! [`BackupStore`] is the seam the deletion controller uses; the shipped
//! implementation sits on top of `object_store`.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, ObjectStoreExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use rewind_common::crd::BackupStorageLocation;
use rewind_common::Error;

/// A volume snapshot taken as part of a backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VolumeSnapshot {
    /// What was snapshotted and where
    #[serde(default)]
    pub spec: VolumeSnapshotSpec,
    /// Provider-side result
    #[serde(default)]
    pub status: VolumeSnapshotStatus,
}

/// Snapshot source details
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// Backup the snapshot belongs to
    #[serde(default)]
    pub backup_name: String,
    /// UID of that backup
    #[serde(default, rename = "backupUID")]
    pub backup_uid: String,
    /// VolumeSnapshotLocation the snapshot was taken with
    #[serde(default)]
    pub location: String,
    /// PersistentVolume that was snapshotted
    #[serde(default)]
    pub persistent_volume_name: String,
    /// Provider identifier of the source volume
    #[serde(default, rename = "providerVolumeID")]
    pub provider_volume_id: String,
    /// Volume type reported by the provider
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_type: String,
    /// Availability zone of the source volume
    #[serde(default, rename = "volumeAZ", skip_serializing_if = "String::is_empty")]
    pub volume_az: String,
}

/// Snapshot result
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Provider identifier of the snapshot
    #[serde(default, rename = "providerSnapshotID")]
    pub provider_snapshot_id: String,
    /// Snapshot phase ("New", "Completed", "Failed")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
}

/// Operations on the stored data of one backup storage location
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Volume snapshots recorded for a backup; empty if none were recorded
    async fn get_backup_volume_snapshots(&self, name: &str) -> Result<Vec<VolumeSnapshot>, Error>;

    /// The backup archive
    async fn get_backup_contents(&self, name: &str) -> Result<Bytes, Error>;

    /// Remove every object belonging to a backup
    async fn delete_backup(&self, name: &str) -> Result<(), Error>;

    /// Remove every object belonging to a restore
    async fn delete_restore(&self, name: &str) -> Result<(), Error>;
}

/// Builds a [`BackupStore`] for a storage location
#[cfg_attr(test, automock)]
pub trait BackupStoreGetter: Send + Sync {
    /// Store for the given location
    fn get(&self, location: &BackupStorageLocation) -> Result<Arc<dyn BackupStore>, Error>;
}

/// [`BackupStore`] on top of any `object_store` backend
pub struct ObjectBackupStore {
    location: String,
    prefix: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectBackupStore {
    /// Wrap an object store; `prefix` may be empty
    pub fn new(location: impl Into<String>, prefix: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            location: location.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            store,
        }
    }

    fn path(&self, rest: String) -> Path {
        if self.prefix.is_empty() {
            Path::from(rest)
        } else {
            Path::from(format!("{}/{}", self.prefix, rest))
        }
    }

    fn backup_dir(&self, name: &str) -> Path {
        self.path(format!("backups/{}", name))
    }

    fn backup_archive(&self, name: &str) -> Path {
        self.path(format!("backups/{}/{}.tar.gz", name, name))
    }

    fn volume_snapshots(&self, name: &str) -> Path {
        self.path(format!("backups/{}/{}-volumesnapshots.json.gz", name, name))
    }

    fn restore_dir(&self, name: &str) -> Path {
        self.path(format!("restores/{}", name))
    }

    fn storage_error(&self, msg: impl Into<String>) -> Error {
        Error::storage_for(&self.location, msg)
    }

    /// Delete everything under a directory, collecting per-object failures
    async fn delete_dir(&self, dir: &Path) -> Result<usize, Error> {
        let objects: Vec<ObjectMeta> = self
            .store
            .list(Some(dir))
            .try_collect()
            .await
            .map_err(|e| self.storage_error(format!("failed to list {}: {}", dir, e)))?;

        let mut failures = Vec::new();
        let mut deleted = 0;
        for meta in &objects {
            match self.store.delete(&meta.location).await {
                Ok(()) => deleted += 1,
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => failures.push(format!("{}: {}", meta.location, e)),
            }
        }

        if failures.is_empty() {
            Ok(deleted)
        } else {
            Err(self.storage_error(format!(
                "failed to delete objects: {}",
                failures.join("; ")
            )))
        }
    }
}

#[async_trait]
impl BackupStore for ObjectBackupStore {
    async fn get_backup_volume_snapshots(&self, name: &str) -> Result<Vec<VolumeSnapshot>, Error> {
        let path = self.volume_snapshots(name);
        let data = match self.store.get(&path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| self.storage_error(format!("failed to read {}: {}", path, e)))?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!(backup = %name, "no volume snapshots recorded");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(self.storage_error(format!("failed to get {}: {}", path, e)));
            }
        };

        let mut json = String::new();
        GzDecoder::new(data.as_ref())
            .read_to_string(&mut json)
            .map_err(|e| {
                Error::serialization_for_kind(
                    "VolumeSnapshot",
                    format!("failed to decompress {}: {}", path, e),
                )
            })?;

        let snapshots: Option<Vec<VolumeSnapshot>> = serde_json::from_str(&json).map_err(|e| {
            Error::serialization_for_kind("VolumeSnapshot", format!("failed to parse {}: {}", path, e))
        })?;
        Ok(snapshots.unwrap_or_default())
    }

    async fn get_backup_contents(&self, name: &str) -> Result<Bytes, Error> {
        let path = self.backup_archive(name);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| self.storage_error(format!("failed to get {}: {}", path, e)))?;
        result
            .bytes()
            .await
            .map_err(|e| self.storage_error(format!("failed to read {}: {}", path, e)))
    }

    async fn delete_backup(&self, name: &str) -> Result<(), Error> {
        let deleted = self.delete_dir(&self.backup_dir(name)).await?;
        info!(location = %self.location, backup = %name, objects = deleted, "deleted backup data");
        Ok(())
    }

    async fn delete_restore(&self, name: &str) -> Result<(), Error> {
        let deleted = self.delete_dir(&self.restore_dir(name)).await?;
        info!(location = %self.location, restore = %name, objects = deleted, "deleted restore data");
        Ok(())
    }
}

/// Config key holding the bucket region
pub const REGION_CONFIG_KEY: &str = "region";
/// Config key holding a custom S3-compatible endpoint
pub const S3_URL_CONFIG_KEY: &str = "s3Url";

const DEFAULT_REGION: &str = "us-east-1";

/// Builds S3-backed stores from a location's provider and config
#[derive(Debug, Default, Clone)]
pub struct ObjectBackupStoreGetter;

impl ObjectBackupStoreGetter {
    /// Create a getter
    pub fn new() -> Self {
        Self
    }
}

impl BackupStoreGetter for ObjectBackupStoreGetter {
    fn get(&self, location: &BackupStorageLocation) -> Result<Arc<dyn BackupStore>, Error> {
        let name = location.metadata.name.clone().unwrap_or_default();
        let provider = location.spec.provider.as_str();

        let store: Arc<dyn ObjectStore> = match provider {
            "aws" | "velero.io/aws" => {
                let config = &location.spec.config;
                let region = config
                    .get(REGION_CONFIG_KEY)
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_REGION);

                let mut builder = AmazonS3Builder::from_env()
                    .with_region(region)
                    .with_bucket_name(&location.spec.object_storage.bucket);

                if let Some(endpoint) = config.get(S3_URL_CONFIG_KEY) {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }

                Arc::new(builder.build().map_err(|e| {
                    Error::storage_for(&name, format!("failed to build S3 client: {}", e))
                })?)
            }
            other => {
                warn!(location = %name, provider = %other, "unsupported object storage provider");
                return Err(Error::storage_for(
                    &name,
                    format!("unsupported object storage provider {:?}", other),
                ));
            }
        };

        Ok(Arc::new(ObjectBackupStore::new(
            name,
            location.prefix(),
            store,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use object_store::memory::InMemory;
    use object_store::PutPayload;
    use rewind_common::crd::{BackupStorageLocationSpec, ObjectStorageLocation};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    async fn put(store: &InMemory, key: &str, data: Bytes) {
        store
            .put(&Path::from(key), PutPayload::from(data))
            .await
            .unwrap();
    }

    async fn keys(store: &InMemory) -> Vec<String> {
        let mut keys: Vec<String> = store
            .list(None)
            .map_ok(|m| m.location.to_string())
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        keys
    }

    fn backup_store(mem: Arc<InMemory>, prefix: &str) -> ObjectBackupStore {
        ObjectBackupStore::new("primary", prefix, mem)
    }

    #[tokio::test]
    async fn volume_snapshots_are_read_from_gzip_json() {
        let mem = Arc::new(InMemory::new());
        let json = r#"[{"spec":{"backupName":"foo","location":"vsl-1","persistentVolumeName":"pv-1","providerVolumeID":"vol-1"},"status":{"providerSnapshotID":"snap-1","phase":"Completed"}}]"#;
        put(&mem, "cluster-a/backups/foo/foo-volumesnapshots.json.gz", gzip(json.as_bytes())).await;

        let snapshots = backup_store(mem, "cluster-a")
            .get_backup_volume_snapshots("foo")
            .await
            .unwrap();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].spec.location, "vsl-1");
        assert_eq!(snapshots[0].spec.persistent_volume_name, "pv-1");
        assert_eq!(snapshots[0].status.provider_snapshot_id, "snap-1");
    }

    #[tokio::test]
    async fn missing_snapshot_record_means_no_snapshots() {
        let mem = Arc::new(InMemory::new());
        let snapshots = backup_store(mem, "")
            .get_backup_volume_snapshots("foo")
            .await
            .unwrap();
        assert!(snapshots.is_empty());
    }

    #[tokio::test]
    async fn null_snapshot_record_means_no_snapshots() {
        let mem = Arc::new(InMemory::new());
        put(&mem, "backups/foo/foo-volumesnapshots.json.gz", gzip(b"null")).await;
        let snapshots = backup_store(mem, "")
            .get_backup_volume_snapshots("foo")
            .await
            .unwrap();
        assert!(snapshots.is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_record_is_a_serialization_error() {
        let mem = Arc::new(InMemory::new());
        put(&mem, "backups/foo/foo-volumesnapshots.json.gz", Bytes::from_static(b"not gzip")).await;
        let err = backup_store(mem, "")
            .get_backup_volume_snapshots("foo")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[tokio::test]
    async fn backup_contents_are_returned_verbatim() {
        let mem = Arc::new(InMemory::new());
        put(&mem, "backups/foo/foo.tar.gz", Bytes::from_static(b"hello world")).await;

        let contents = backup_store(mem.clone(), "").get_backup_contents("foo").await.unwrap();
        assert_eq!(contents.as_ref(), b"hello world");

        let err = backup_store(mem, "").get_backup_contents("bar").await.unwrap_err();
        assert_eq!(err.resource(), Some("primary"));
    }

    #[tokio::test]
    async fn delete_backup_removes_only_that_backup() {
        let mem = Arc::new(InMemory::new());
        put(&mem, "p/backups/foo/foo.tar.gz", Bytes::from_static(b"a")).await;
        put(&mem, "p/backups/foo/foo-logs.gz", Bytes::from_static(b"b")).await;
        put(&mem, "p/backups/foo-2/foo-2.tar.gz", Bytes::from_static(b"c")).await;
        put(&mem, "p/restores/restore-1/restore-1-logs.gz", Bytes::from_static(b"d")).await;

        backup_store(mem.clone(), "p").delete_backup("foo").await.unwrap();

        assert_eq!(
            keys(&mem).await,
            vec![
                "p/backups/foo-2/foo-2.tar.gz".to_string(),
                "p/restores/restore-1/restore-1-logs.gz".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn delete_restore_removes_restore_data() {
        let mem = Arc::new(InMemory::new());
        put(&mem, "restores/restore-1/restore-1-logs.gz", Bytes::from_static(b"a")).await;
        put(&mem, "restores/restore-1/restore-1-results.gz", Bytes::from_static(b"b")).await;
        put(&mem, "restores/restore-2/restore-2-logs.gz", Bytes::from_static(b"c")).await;

        let store = backup_store(mem.clone(), "");
        store.delete_restore("restore-1").await.unwrap();
        // Deleting again is a no-op
        store.delete_restore("restore-1").await.unwrap();

        assert_eq!(
            keys(&mem).await,
            vec!["restores/restore-2/restore-2-logs.gz".to_string()]
        );
    }

    #[test]
    fn getter_rejects_unknown_provider() {
        let bsl = BackupStorageLocation::new(
            "primary",
            BackupStorageLocationSpec {
                provider: "carrier-pigeon".to_string(),
                object_storage: ObjectStorageLocation {
                    bucket: "bucket".to_string(),
                    prefix: None,
                },
                ..Default::default()
            },
        );
        let err = ObjectBackupStoreGetter::new().get(&bsl).err().unwrap();
        assert!(err.to_string().contains("unsupported object storage provider"));
    }

    #[test]
    fn getter_builds_s3_store() {
        let mut spec = BackupStorageLocationSpec {
            provider: "aws".to_string(),
            object_storage: ObjectStorageLocation {
                bucket: "bucket".to_string(),
                prefix: Some("cluster-a".to_string()),
            },
            ..Default::default()
        };
        spec.config
            .insert(S3_URL_CONFIG_KEY.to_string(), "http://minio:9000".to_string());
        let bsl = BackupStorageLocation::new("primary", spec);
        assert!(ObjectBackupStoreGetter::new().get(&bsl).is_ok());
    }
}
