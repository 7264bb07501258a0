//! DeleteBackupRequest controller
//!
//! Tears down a backup and everything derived from it. A request moves
//! `New` -> `InProgress` -> `Processed`; once processed its error list is the
//! complete record of what could not be cleaned up.
//!
//! Only two writes abort a request and trigger a requeue: marking the request
//! `InProgress` and marking the backup `Deleting`. The final status write is
//! also propagated. Every other failure is recorded and the cascade keeps
//! going so a single broken snapshot or restore never leaves the rest behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use rewind_common::crd::{
    Backup, BackupPhase, BackupStorageLocation, DeleteBackupRequest, DeleteBackupRequestPhase,
    DeleteBackupRequestStatus, Restore, VolumeSnapshotLocation,
};
use rewind_common::kube_utils::{get_opt, is_not_found, patch_resource_status, split_key};
use rewind_common::labels::{
    backup_name_selector, backup_name_uid_selector, label_value, BACKUP_NAME_LABEL,
    BACKUP_UID_LABEL,
};
use rewind_common::{Error, FIELD_MANAGER};

use crate::plugins::{
    DeleteItemActionInput, PluginManagerFactory, PluginRegistry, PluginSession, VolumeSnapshotter,
};
use crate::storage::{BackupStore, BackupStoreGetter, ObjectBackupStoreGetter};
use crate::tracker::{BackupTracker, InMemoryBackupTracker};
use crate::REQUEUE_ERROR;

/// Error recorded when the request names no backup
pub const MSG_BACKUP_NAME_REQUIRED: &str = "spec.backupName is required";
/// Error recorded when the backup is still being created
pub const MSG_BACKUP_IN_PROGRESS: &str = "backup is still in progress";
/// Error recorded when the backup does not exist
pub const MSG_BACKUP_NOT_FOUND: &str = "backup not found";

/// Trait abstracting Kubernetes operations used by the deletion controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Merge labels into a request and/or replace its status
    ///
    /// Empty `labels` and `None` status are skipped. Status is a subresource,
    /// so the implementation sends the label patch and the status patch as two
    /// requests: the labels may persist while the status write fails. The
    /// labels are derived from the spec and rewritten on retry, so a request
    /// left labelled but still `New` is reprocessed from the start.
    async fn patch_request(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        status: Option<DeleteBackupRequestStatus>,
    ) -> Result<(), Error>;

    /// List requests, optionally filtered by a label selector
    async fn list_requests(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DeleteBackupRequest>, Error>;

    /// Delete a single request; a missing request is not an error
    async fn delete_request(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete every request matching a label selector
    async fn delete_requests(&self, namespace: &str, selector: &str) -> Result<(), Error>;

    /// Get a Backup by name
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error>;

    /// Set the phase of a Backup
    async fn patch_backup_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: BackupPhase,
    ) -> Result<(), Error>;

    /// Delete a Backup; a missing backup is not an error
    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a BackupStorageLocation by name
    async fn get_storage_location(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupStorageLocation>, Error>;

    /// Get a VolumeSnapshotLocation by name
    async fn get_snapshot_location(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshotLocation>, Error>;

    /// List restores matching a label selector
    async fn list_restores(&self, namespace: &str, selector: &str) -> Result<Vec<Restore>, Error>;

    /// Delete a Restore; a missing restore is not an error
    async fn delete_restore(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn list_params(selector: &str) -> ListParams {
        if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(selector)
        }
    }
}

/// Treat a 404 on delete as success
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_request(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        status: Option<DeleteBackupRequestStatus>,
    ) -> Result<(), Error> {
        if !labels.is_empty() {
            let api: Api<DeleteBackupRequest> = Api::namespaced(self.client.clone(), namespace);
            let patch = serde_json::json!({ "metadata": { "labels": labels } });
            api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await?;
        }
        if let Some(status) = status {
            patch_resource_status::<DeleteBackupRequest>(
                &self.client,
                name,
                namespace,
                &status,
                FIELD_MANAGER,
            )
            .await?;
        }
        Ok(())
    }

    async fn list_requests(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DeleteBackupRequest>, Error> {
        let api: Api<DeleteBackupRequest> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Self::list_params(selector)).await?.items)
    }

    async fn delete_request(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<DeleteBackupRequest> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn delete_requests(&self, namespace: &str, selector: &str) -> Result<(), Error> {
        let api: Api<DeleteBackupRequest> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(&DeleteParams::default(), &Self::list_params(selector))
            .await?;
        Ok(())
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error> {
        Ok(get_opt::<Backup>(&self.client, name, namespace).await?)
    }

    async fn patch_backup_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: BackupPhase,
    ) -> Result<(), Error> {
        patch_resource_status::<Backup>(
            &self.client,
            name,
            namespace,
            &serde_json::json!({ "phase": phase }),
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_storage_location(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupStorageLocation>, Error> {
        Ok(get_opt::<BackupStorageLocation>(&self.client, name, namespace).await?)
    }

    async fn get_snapshot_location(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshotLocation>, Error> {
        Ok(get_opt::<VolumeSnapshotLocation>(&self.client, name, namespace).await?)
    }

    async fn list_restores(&self, namespace: &str, selector: &str) -> Result<Vec<Restore>, Error> {
        let api: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Self::list_params(selector)).await?.items)
    }

    async fn delete_restore(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }
}

/// Read access to the controller's view of DeleteBackupRequests
#[cfg_attr(test, automock)]
pub trait RequestCache: Send + Sync {
    /// Cached request, if any
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<DeleteBackupRequest>>;
}

impl RequestCache for Store<DeleteBackupRequest> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<DeleteBackupRequest>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

/// Controller context for DeleteBackupRequest reconciliation
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, Arc::new(controller.store()))
///     .tracker(tracker)
///     .plugins(registry.into_factory())
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Cached requests, fed by the controller's reflector
    pub cache: Arc<dyn RequestCache>,
    /// Backups currently being created
    pub tracker: Arc<dyn BackupTracker>,
    /// Builds a store handle for a storage location
    pub stores: Arc<dyn BackupStoreGetter>,
    /// Creates a plugin manager per request
    pub plugins: PluginManagerFactory,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, cache: Arc<dyn RequestCache>) -> ContextBuilder {
        ContextBuilder::new(client, cache)
    }

    /// Create a context for testing with custom mocks
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        cache: Arc<dyn RequestCache>,
        tracker: Arc<dyn BackupTracker>,
        stores: Arc<dyn BackupStoreGetter>,
        plugins: PluginManagerFactory,
    ) -> Self {
        Self {
            kube,
            cache,
            tracker,
            stores,
            plugins,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    cache: Arc<dyn RequestCache>,
    tracker: Option<Arc<dyn BackupTracker>>,
    plugins: Option<PluginManagerFactory>,
}

impl ContextBuilder {
    fn new(client: Client, cache: Arc<dyn RequestCache>) -> Self {
        Self {
            client,
            cache,
            tracker: None,
            plugins: None,
        }
    }

    /// Share the tracker used by the backup-creation flow
    pub fn tracker(mut self, tracker: Arc<dyn BackupTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Set the plugin manager factory
    pub fn plugins(mut self, plugins: PluginManagerFactory) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(KubeClientImpl::new(self.client)),
            cache: self.cache,
            tracker: self
                .tracker
                .unwrap_or_else(|| Arc::new(InMemoryBackupTracker::new())),
            stores: Arc::new(ObjectBackupStoreGetter::new()),
            plugins: self
                .plugins
                .unwrap_or_else(|| PluginRegistry::new().into_factory()),
        }
    }
}

/// Reconcile a DeleteBackupRequest
///
/// Requests are looked up again through the cache by key so a request that
/// was already processed or removed is skipped.
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn reconcile(request: Arc<DeleteBackupRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = format!(
        "{}/{}",
        request.namespace().unwrap_or_default(),
        request.name_any()
    );
    process_queue_item(&key, &ctx).await?;
    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Logs the error and requeues the request after a fixed delay.
pub fn error_policy(request: Arc<DeleteBackupRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        request = %request.name_any(),
        retryable = error.is_retryable(),
        resource = error.resource().unwrap_or_default(),
        context = error.context().unwrap_or_default(),
        "delete backup request reconciliation failed"
    );
    Action::requeue(REQUEUE_ERROR)
}

/// Process the request stored under a `namespace/name` key
pub async fn process_queue_item(key: &str, ctx: &Context) -> Result<(), Error> {
    let (namespace, name) = split_key(key)?;

    let Some(request) = ctx.cache.get(namespace, name) else {
        debug!(key = %key, "request no longer exists");
        return Ok(());
    };

    if request.phase() == DeleteBackupRequestPhase::Processed {
        debug!(key = %key, errors = ?request.errors(), "request already processed");
        return Ok(());
    }

    process_request(&request, ctx).await
}

/// Persist a terminal status
async fn finish(ctx: &Context, namespace: &str, name: &str, errors: Vec<String>) -> Result<(), Error> {
    if errors.is_empty() {
        info!(request = %name, "delete backup request processed");
    } else {
        warn!(request = %name, errors = ?errors, "delete backup request processed with errors");
    }
    ctx.kube
        .patch_request(
            namespace,
            name,
            BTreeMap::new(),
            Some(DeleteBackupRequestStatus::processed(errors)),
        )
        .await
}

/// Run one request through the deletion cascade
pub async fn process_request(request: &DeleteBackupRequest, ctx: &Context) -> Result<(), Error> {
    let namespace = request.namespace().unwrap_or_default();
    let name = request.name_any();
    let backup_name = request.spec.backup_name.as_str();

    if backup_name.is_empty() {
        return finish(ctx, &namespace, &name, vec![MSG_BACKUP_NAME_REQUIRED.to_string()]).await;
    }

    let mut errors = delete_sibling_requests(ctx, &namespace, &name, backup_name).await;

    if ctx.tracker.contains(&namespace, backup_name) {
        errors.push(MSG_BACKUP_IN_PROGRESS.to_string());
        return finish(ctx, &namespace, &name, errors).await;
    }

    let mut labels = BTreeMap::new();
    labels.insert(BACKUP_NAME_LABEL.to_string(), label_value(backup_name));
    ctx.kube
        .patch_request(
            &namespace,
            &name,
            labels,
            Some(DeleteBackupRequestStatus::with_phase(
                DeleteBackupRequestPhase::InProgress,
            )),
        )
        .await
        .map_err(|e| {
            error!(request = %name, error = %e, "failed to mark request in progress");
            e
        })?;

    let backup = match ctx.kube.get_backup(&namespace, backup_name).await {
        Ok(Some(backup)) => backup,
        Ok(None) => {
            if let Some(uid) = resolved_backup_uid(request) {
                info!(backup = %backup_name, "backup already deleted by an earlier attempt");
                finish(ctx, &namespace, &name, errors).await?;
                delete_correlated_requests(ctx, &namespace, backup_name, &uid).await;
                return Ok(());
            }
            errors.push(MSG_BACKUP_NOT_FOUND.to_string());
            return finish(ctx, &namespace, &name, errors).await;
        }
        Err(e) => {
            errors.push(format!("error getting backup: {}", e));
            return finish(ctx, &namespace, &name, errors).await;
        }
    };
    let backup_uid = backup.uid().unwrap_or_default();

    let mut labels = BTreeMap::new();
    labels.insert(BACKUP_UID_LABEL.to_string(), label_value(&backup_uid));
    if let Err(e) = ctx.kube.patch_request(&namespace, &name, labels, None).await {
        errors.push(format!("error labelling request with backup uid: {}", e));
    }

    let location_name = backup.spec.storage_location.as_str();
    let location = if location_name.is_empty() {
        None
    } else {
        match ctx.kube.get_storage_location(&namespace, location_name).await {
            Ok(location) => location,
            Err(e) => {
                errors.push(format!(
                    "error getting backup storage location {}: {}",
                    location_name, e
                ));
                return finish(ctx, &namespace, &name, errors).await;
            }
        }
    };
    let Some(location) = location else {
        errors.push(format!(
            "backup storage location {} not found",
            location_name
        ));
        return finish(ctx, &namespace, &name, errors).await;
    };

    if location.is_read_only() {
        errors.push(format!(
            "cannot delete backup because backup storage location {} is currently in read-only mode",
            location_name
        ));
        return finish(ctx, &namespace, &name, errors).await;
    }

    ctx.kube
        .patch_backup_phase(&namespace, backup_name, BackupPhase::Deleting)
        .await
        .map_err(|e| {
            error!(backup = %backup_name, error = %e, "failed to mark backup deleting");
            e
        })?;
    info!(backup = %backup_name, location = %location_name, "deleting backup");

    let cascade_ran = match ctx.stores.get(&location) {
        Ok(store) => {
            let session = PluginSession::new((ctx.plugins)());
            let cascade = Cascade {
                ctx,
                namespace: &namespace,
                backup: &backup,
                store: store.as_ref(),
                session: &session,
            };
            cascade.run(&mut errors).await;
            true
        }
        Err(e) => {
            errors.push(format!("error getting backup store: {}", e));
            false
        }
    };

    finish(ctx, &namespace, &name, errors).await?;

    // The request is the only record of a backup left in Deleting.
    if cascade_ran {
        delete_correlated_requests(ctx, &namespace, backup_name, &backup_uid).await;
    }

    Ok(())
}

/// UID recorded on a request by an earlier attempt that found its backup
fn resolved_backup_uid(request: &DeleteBackupRequest) -> Option<String> {
    if request.phase() != DeleteBackupRequestPhase::InProgress {
        return None;
    }
    request.backup_uid().map(str::to_string)
}

/// Remove every request labelled with a deleted backup's name and UID
async fn delete_correlated_requests(ctx: &Context, namespace: &str, backup_name: &str, uid: &str) {
    let selector = backup_name_uid_selector(backup_name, uid);
    if let Err(e) = ctx.kube.delete_requests(namespace, &selector).await {
        error!(selector = %selector, error = %e, "failed to delete requests for deleted backup");
    }
}

/// Remove other requests for the same backup so only one is acted on
async fn delete_sibling_requests(
    ctx: &Context,
    namespace: &str,
    name: &str,
    backup_name: &str,
) -> Vec<String> {
    let selector = backup_name_selector(backup_name);
    let siblings = match ctx.kube.list_requests(namespace, &selector).await {
        Ok(siblings) => siblings,
        Err(e) => {
            warn!(selector = %selector, error = %e, "failed to list existing requests");
            return vec![format!("error listing existing delete backup requests: {}", e)];
        }
    };

    let mut errors = Vec::new();
    for sibling in siblings.iter().filter(|r| r.name_any() != name) {
        let sibling_name = sibling.name_any();
        debug!(request = %sibling_name, "deleting existing request for backup");
        if let Err(e) = ctx.kube.delete_request(namespace, &sibling_name).await {
            errors.push(format!(
                "error deleting existing delete backup request {}: {}",
                sibling_name, e
            ));
        }
    }
    errors
}

/// Best-effort removal of everything derived from a backup
struct Cascade<'a> {
    ctx: &'a Context,
    namespace: &'a str,
    backup: &'a Backup,
    store: &'a dyn BackupStore,
    session: &'a PluginSession,
}

impl Cascade<'_> {
    fn backup_name(&self) -> String {
        self.backup.name_any()
    }

    async fn run(&self, errors: &mut Vec<String>) {
        self.run_delete_item_actions(errors).await;
        self.delete_volume_snapshots(errors).await;
        self.delete_restores(errors).await;
        self.delete_backup(errors).await;
    }

    async fn run_delete_item_actions(&self, errors: &mut Vec<String>) {
        let actions = match self.session.get_delete_item_actions() {
            Ok(actions) => actions,
            Err(e) => {
                errors.push(format!("error getting delete item actions: {}", e));
                return;
            }
        };
        if actions.is_empty() {
            return;
        }

        let backup_name = self.backup_name();
        let archive = match self.store.get_backup_contents(&backup_name).await {
            Ok(archive) => archive,
            Err(e) => {
                warn!(backup = %backup_name, error = %e, "unable to download backup, skipping delete item actions");
                return;
            }
        };

        let input = DeleteItemActionInput {
            backup: self.backup.clone(),
            archive,
        };
        for action in actions {
            if let Err(e) = action.execute(&input).await {
                errors.push(format!(
                    "error running delete item action {}: {}",
                    action.name(),
                    e
                ));
            }
        }
    }

    async fn delete_volume_snapshots(&self, errors: &mut Vec<String>) {
        let backup_name = self.backup_name();
        let snapshots = match self.store.get_backup_volume_snapshots(&backup_name).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                errors.push(format!("error getting backup's volume snapshots: {}", e));
                return;
            }
        };

        let mut snapshotters: HashMap<String, Arc<dyn VolumeSnapshotter>> = HashMap::new();
        for snapshot in snapshots {
            let location = snapshot.spec.location.clone();
            let snapshot_id = snapshot.status.provider_snapshot_id.as_str();

            let snapshotter = match snapshotters.get(&location) {
                Some(s) => s.clone(),
                None => match self.snapshotter_for(&location).await {
                    Ok(s) => {
                        snapshotters.insert(location.clone(), s.clone());
                        s
                    }
                    Err(e) => {
                        errors.push(e.to_string());
                        continue;
                    }
                },
            };

            debug!(snapshot = %snapshot_id, location = %location, "deleting volume snapshot");
            if let Err(e) = snapshotter.delete_snapshot(snapshot_id).await {
                errors.push(format!("error deleting snapshot {}: {}", snapshot_id, e));
            }
        }
    }

    async fn snapshotter_for(&self, location: &str) -> Result<Arc<dyn VolumeSnapshotter>, Error> {
        let vsl = self
            .ctx
            .kube
            .get_snapshot_location(self.namespace, location)
            .await?
            .ok_or_else(|| {
                Error::validation_for(
                    location,
                    format!("volume snapshot location {} not found", location),
                )
            })?;

        let snapshotter = self.session.get_volume_snapshotter(&vsl.spec.provider)?;
        snapshotter.init(&vsl.spec.config).await?;
        Ok(snapshotter)
    }

    async fn delete_restores(&self, errors: &mut Vec<String>) {
        let backup_name = self.backup_name();
        let selector = backup_name_selector(&backup_name);
        let restores = match self.ctx.kube.list_restores(self.namespace, &selector).await {
            Ok(restores) => restores,
            Err(e) => {
                errors.push(format!("error listing restore API objects: {}", e));
                return;
            }
        };

        for restore in restores
            .iter()
            .filter(|r| r.spec.backup_name == backup_name)
        {
            let restore_name = restore.name_any();
            info!(restore = %restore_name, "deleting restore");

            if let Err(e) = self.ctx.kube.delete_restore(self.namespace, &restore_name).await {
                errors.push(format!("error deleting restore {}: {}", restore_name, e));
            }
            if let Err(e) = self.store.delete_restore(&restore_name).await {
                errors.push(format!(
                    "error deleting restore data for {}: {}",
                    restore_name, e
                ));
            }
        }
    }

    async fn delete_backup(&self, errors: &mut Vec<String>) {
        let backup_name = self.backup_name();
        if let Err(e) = self.store.delete_backup(&backup_name).await {
            errors.push(format!("error deleting backup data: {}", e));
        }
        if let Err(e) = self.ctx.kube.delete_backup(self.namespace, &backup_name).await {
            errors.push(format!("error deleting backup: {}", e));
        }
    }
}
