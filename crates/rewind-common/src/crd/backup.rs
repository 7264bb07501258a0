//! Backup Custom Resource Definition
//!
//! A Backup records one backup job. This operator only reads it, marks it
//! `Deleting` and finally removes it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase of a Backup
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupPhase {
    /// Backup has been created but not yet processed
    #[default]
    New,
    /// Backup spec failed validation
    FailedValidation,
    /// Backup is being taken
    InProgress,
    /// Backup finished without errors
    Completed,
    /// Backup finished with some errors
    PartiallyFailed,
    /// Backup failed
    Failed,
    /// Backup is being deleted
    Deleting,
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::FailedValidation => write!(f, "FailedValidation"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::PartiallyFailed => write!(f, "PartiallyFailed"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Status of a Backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,

    /// Number of warnings encountered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<i32>,

    /// Number of errors encountered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<i32>,
}

/// Specification for a Backup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".spec.storageLocation"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Name of the BackupStorageLocation holding this backup's data
    #[serde(default)]
    pub storage_location: String,

    /// Names of the VolumeSnapshotLocations used for this backup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_locations: Vec<String>,

    /// Namespaces included in the backup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,

    /// How long the backup is retained (e.g. "720h0m0s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl Backup {
    /// Current phase, treating a missing status as `New`
    pub fn phase(&self) -> BackupPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_spec_parse() {
        let spec: BackupSpec = serde_yaml::from_str(
            r#"
storageLocation: primary
volumeSnapshotLocations: [aws-default]
ttl: 720h0m0s
"#,
        )
        .expect("parse spec");

        assert_eq!(spec.storage_location, "primary");
        assert_eq!(spec.volume_snapshot_locations, vec!["aws-default"]);
        assert_eq!(spec.ttl.as_deref(), Some("720h0m0s"));
    }

    #[test]
    fn test_missing_status_is_new() {
        let backup = Backup::new("foo", BackupSpec::default());
        assert_eq!(backup.phase(), BackupPhase::New);
    }

    #[test]
    fn test_phase_serializes_as_string() {
        let status = BackupStatus {
            phase: Some(BackupPhase::Deleting),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json, serde_json::json!({ "phase": "Deleting" }));
        assert_eq!(BackupPhase::PartiallyFailed.to_string(), "PartiallyFailed");
    }
}
