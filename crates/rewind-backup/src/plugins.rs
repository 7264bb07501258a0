//! Plugin capabilities used during backup deletion
//!
//! Volume snapshotters remove provider-side snapshots and delete-item actions
//! undo side effects of individual backed-up items. How plugins are hosted is
//! not this crate's concern: [`PluginManager`] is the boundary, and
//! [`PluginRegistry`] is an in-process implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use rewind_common::crd::Backup;
use rewind_common::Error;

/// Deletes provider-side volume snapshots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeSnapshotter: Send + Sync {
    /// Configure the snapshotter with a VolumeSnapshotLocation's config
    async fn init(&self, config: &BTreeMap<String, String>) -> Result<(), Error>;

    /// Delete one snapshot by its provider identifier
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), Error>;
}

/// What a delete-item action gets to work with
#[derive(Clone, Debug)]
pub struct DeleteItemActionInput {
    /// The backup being deleted
    pub backup: Backup,
    /// The backup archive (`<name>.tar.gz`)
    pub archive: Bytes,
}

/// Undoes external side effects recorded in a backup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeleteItemAction: Send + Sync {
    /// Name used in logs and error messages
    fn name(&self) -> String;

    /// Run the action against a backup archive
    async fn execute(&self, input: &DeleteItemActionInput) -> Result<(), Error>;
}

/// Hands out plugin capabilities for one deletion request
#[cfg_attr(test, automock)]
pub trait PluginManager: Send + Sync {
    /// Snapshotter for a provider name
    fn get_volume_snapshotter(&self, provider: &str) -> Result<Arc<dyn VolumeSnapshotter>, Error>;

    /// All registered delete-item actions
    fn get_delete_item_actions(&self) -> Result<Vec<Arc<dyn DeleteItemAction>>, Error>;

    /// Release any plugin clients held by this manager
    fn cleanup_clients(&self);
}

/// Creates a fresh plugin manager per deletion request
pub type PluginManagerFactory = Arc<dyn Fn() -> Arc<dyn PluginManager> + Send + Sync>;

/// Scopes a plugin manager to a single request
///
/// `cleanup_clients` runs when the session is dropped, on every exit path.
pub struct PluginSession {
    manager: Arc<dyn PluginManager>,
}

impl PluginSession {
    /// Open a session over a manager
    pub fn new(manager: Arc<dyn PluginManager>) -> Self {
        Self { manager }
    }
}

impl std::ops::Deref for PluginSession {
    type Target = dyn PluginManager;

    fn deref(&self) -> &Self::Target {
        self.manager.as_ref()
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        self.manager.cleanup_clients();
    }
}

/// In-process plugin registry
///
/// Snapshotters are registered by provider name. Plugins live in-process,
/// so there are no clients to release.
#[derive(Default)]
pub struct PluginRegistry {
    snapshotters: HashMap<String, Arc<dyn VolumeSnapshotter>>,
    actions: Vec<Arc<dyn DeleteItemAction>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshotter for a provider name
    pub fn with_volume_snapshotter(
        mut self,
        provider: impl Into<String>,
        snapshotter: Arc<dyn VolumeSnapshotter>,
    ) -> Self {
        self.snapshotters.insert(provider.into(), snapshotter);
        self
    }

    /// Register a delete-item action
    pub fn with_delete_item_action(mut self, action: Arc<dyn DeleteItemAction>) -> Self {
        self.actions.push(action);
        self
    }

    /// Factory handing out this registry for every request
    pub fn into_factory(self) -> PluginManagerFactory {
        let registry: Arc<dyn PluginManager> = Arc::new(self);
        Arc::new(move || registry.clone())
    }
}

impl PluginManager for PluginRegistry {
    fn get_volume_snapshotter(&self, provider: &str) -> Result<Arc<dyn VolumeSnapshotter>, Error> {
        self.snapshotters
            .get(provider)
            .cloned()
            .ok_or_else(|| Error::plugin(provider, "volume snapshotter not registered"))
    }

    fn get_delete_item_actions(&self) -> Result<Vec<Arc<dyn DeleteItemAction>>, Error> {
        Ok(self.actions.clone())
    }

    fn cleanup_clients(&self) {
        debug!("plugin session closed");
    }
}
