//! Custom Resource Definitions for Rewind
//!
//! All resources live in the `velero.io/v1` API group so the operator can
//! work against clusters that already run the backup-creation flow.

mod backup;
mod delete_request;
mod restore;
mod snapshot_location;
mod storage_location;

pub use backup::{Backup, BackupPhase, BackupSpec, BackupStatus};
pub use delete_request::{
    DeleteBackupRequest, DeleteBackupRequestPhase, DeleteBackupRequestSpec,
    DeleteBackupRequestStatus,
};
pub use restore::{Restore, RestorePhase, RestoreSpec, RestoreStatus};
pub use snapshot_location::{
    VolumeSnapshotLocation, VolumeSnapshotLocationSpec, VolumeSnapshotLocationStatus,
};
pub use storage_location::{
    AccessMode, BackupStorageLocation, BackupStorageLocationSpec, BackupStorageLocationStatus,
    ObjectStorageLocation,
};

/// Every CRD managed by the operator, in install order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    use kube::CustomResourceExt;
    vec![
        Backup::crd(),
        Restore::crd(),
        BackupStorageLocation::crd(),
        VolumeSnapshotLocation::crd(),
        DeleteBackupRequest::crd(),
    ]
}
