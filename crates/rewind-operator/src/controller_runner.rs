//! Controller runner - wires the deletion controller and the expiry sweeper
//!
//! `run` resolves when the controller stops on SIGTERM/SIGINT; the sweeper is
//! cancelled at that point.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use rewind_backup::deletion_controller::KubeClientImpl;
use rewind_backup::{
    error_policy, reconcile, run_expiry_sweeper, BackupTracker, Context, PluginManagerFactory,
};
use rewind_common::crd::DeleteBackupRequest;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Settings for the backup deletion workers
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Namespace holding requests, backups and locations
    pub namespace: String,
    /// Maximum requests reconciled in parallel
    pub workers: u16,
    /// How long processed requests are kept
    pub request_ttl: Duration,
    /// Time between expiry sweeps
    pub sweep_interval: Duration,
}

/// Run the deletion controller and the sweeper until shutdown
///
/// `tracker` is shared with whatever creates backups in this process.
pub async fn run(
    client: Client,
    config: RunnerConfig,
    tracker: Arc<dyn BackupTracker>,
    plugins: PluginManagerFactory,
) {
    let requests: Api<DeleteBackupRequest> = Api::namespaced(client.clone(), &config.namespace);

    let controller = Controller::new(
        requests,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(config.workers));

    let ctx = Arc::new(
        Context::builder(client.clone(), Arc::new(controller.store()))
            .tracker(tracker)
            .plugins(plugins)
            .build(),
    );

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(run_expiry_sweeper(
        Arc::new(KubeClientImpl::new(client)),
        config.namespace.clone(),
        config.request_ttl,
        config.sweep_interval,
        cancel.clone(),
    ));

    tracing::info!(
        namespace = %config.namespace,
        workers = config.workers,
        "- DeleteBackupRequest controller"
    );

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((request, action)) => {
                    tracing::debug!(request = %request.name, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("DeleteBackupRequest controller stopped");
    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "expiry sweeper task failed");
    }
}
