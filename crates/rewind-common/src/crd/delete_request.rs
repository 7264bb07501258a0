//! DeleteBackupRequest Custom Resource Definition
//!
//! A DeleteBackupRequest records the intent to delete one Backup together
//! with everything derived from it. Its status is the only record of what
//! went wrong during the cascade.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels::BACKUP_UID_LABEL;

/// Phase of a DeleteBackupRequest
///
/// Only ever advances `New` -> `InProgress` -> `Processed`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum DeleteBackupRequestPhase {
    /// Request has not been picked up yet
    #[default]
    New,
    /// Request is being worked on
    InProgress,
    /// Request is finished (terminal)
    Processed,
}

impl std::fmt::Display for DeleteBackupRequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Processed => write!(f, "Processed"),
        }
    }
}

/// Status of a DeleteBackupRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DeleteBackupRequestPhase>,

    /// Errors encountered while processing; final once the phase is Processed
    #[serde(default)]
    pub errors: Vec<String>,
}

impl DeleteBackupRequestStatus {
    /// Status with the given phase and no errors
    pub fn with_phase(phase: DeleteBackupRequestPhase) -> Self {
        Self {
            phase: Some(phase),
            errors: Vec::new(),
        }
    }

    /// Terminal status carrying the given errors
    pub fn processed(errors: Vec<String>) -> Self {
        Self {
            phase: Some(DeleteBackupRequestPhase::Processed),
            errors,
        }
    }
}

/// Specification for a DeleteBackupRequest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "DeleteBackupRequest",
    plural = "deletebackuprequests",
    namespaced,
    status = "DeleteBackupRequestStatus",
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".spec.backupName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestSpec {
    /// Name of the backup to delete
    #[serde(default)]
    pub backup_name: String,
}

impl DeleteBackupRequest {
    /// Backup UID label recorded once the backup was found
    pub fn backup_uid(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(BACKUP_UID_LABEL))
            .map(String::as_str)
            .filter(|uid| !uid.is_empty())
    }

    /// Current phase, treating a missing status as `New`
    pub fn phase(&self) -> DeleteBackupRequestPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    /// Errors recorded so far
    pub fn errors(&self) -> &[String] {
        self.status.as_ref().map(|s| s.errors.as_slice()).unwrap_or(&[])
    }
}
