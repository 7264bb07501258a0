//! BackupStorageLocation Custom Resource Definition
//!
//! Describes the object-storage bucket that holds backup archives, snapshot
//! records and restore artifacts.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Access mode of a BackupStorageLocation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AccessMode {
    /// Backups may be written and deleted
    #[default]
    ReadWrite,
    /// Backups may only be read
    ReadOnly,
}

/// Bucket and prefix within the object store
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    /// Bucket name
    pub bucket: String,

    /// Optional key prefix inside the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Status of a BackupStorageLocation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationStatus {
    /// Availability phase ("Available" / "Unavailable")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Access mode observed by the storage controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
}

/// Specification for a BackupStorageLocation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "BackupStorageLocation",
    plural = "backupstoragelocations",
    shortname = "bsl",
    namespaced,
    status = "BackupStorageLocationStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Bucket","type":"string","jsonPath":".spec.objectStorage.bucket"}"#,
    printcolumn = r#"{"name":"Access","type":"string","jsonPath":".spec.accessMode"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Object storage provider name (e.g. "aws")
    pub provider: String,

    /// Bucket and prefix
    pub object_storage: ObjectStorageLocation,

    /// Provider-specific configuration (region, s3Url, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Access mode; defaults to ReadWrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
}

impl BackupStorageLocation {
    /// True when backups in this location must not be modified
    pub fn is_read_only(&self) -> bool {
        self.spec.access_mode == Some(AccessMode::ReadOnly)
    }

    /// Key prefix inside the bucket, without leading or trailing slashes
    pub fn prefix(&self) -> &str {
        self.spec
            .object_storage
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> BackupStorageLocation {
        let spec: BackupStorageLocationSpec = serde_yaml::from_str(yaml).expect("parse spec");
        BackupStorageLocation::new("primary", spec)
    }

    #[test]
    fn test_bsl_defaults_to_read_write() {
        let bsl = parse(
            r#"
provider: aws
objectStorage:
  bucket: backups
"#,
        );
        assert!(!bsl.is_read_only());
        assert_eq!(bsl.prefix(), "");
    }

    #[test]
    fn test_bsl_read_only_and_prefix() {
        let bsl = parse(
            r#"
provider: aws
objectStorage:
  bucket: backups
  prefix: /cluster-a/
accessMode: ReadOnly
config:
  region: us-east-1
"#,
        );
        assert!(bsl.is_read_only());
        assert_eq!(bsl.prefix(), "cluster-a");
        assert_eq!(bsl.spec.config.get("region").map(String::as_str), Some("us-east-1"));
    }
}
