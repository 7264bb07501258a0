//! Backup deletion for Rewind
//!
//! Watches `DeleteBackupRequest` resources and tears down the targeted backup
//! together with its volume snapshots, restores and stored data. A separate
//! sweeper garbage-collects requests once they have been processed.

pub mod deletion_controller;
pub mod expiry;
pub mod plugins;
pub mod storage;
pub mod tracker;

use std::time::Duration;

pub use deletion_controller::{error_policy, reconcile, Context, ContextBuilder};
pub use expiry::{run_expiry_sweeper, ExpirySweeper};
pub use plugins::{
    DeleteItemAction, DeleteItemActionInput, PluginManager, PluginManagerFactory, PluginRegistry,
    PluginSession, VolumeSnapshotter,
};
pub use storage::{
    BackupStore, BackupStoreGetter, ObjectBackupStore, ObjectBackupStoreGetter, VolumeSnapshot,
};
pub use tracker::{BackupTracker, InMemoryBackupTracker};

/// Requeue delay after a failed reconcile
pub(crate) const REQUEUE_ERROR: Duration = Duration::from_secs(5);

/// How long processed requests are kept before the sweeper removes them
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the expiry sweeper runs
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
