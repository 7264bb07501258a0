//! Rewind operator - deletes backups on request and cleans up after itself

mod controller_runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rewind_backup::{InMemoryBackupTracker, PluginRegistry};
use rewind_common::clusters::{ClusterClients, ClusterRole};
use rewind_common::crd::all_crds;
use rewind_common::kube_utils::create_client;
use rewind_common::telemetry::{init_telemetry, TelemetryConfig};
use rewind_common::DEFAULT_NAMESPACE;

use controller_runner::RunnerConfig;

/// Rewind - backup deletion operator
#[derive(Parser, Debug)]
#[command(name = "rewind-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace holding backups, locations and credential secrets
    #[arg(long, env = "REWIND_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Kubeconfig for the local cluster (in-cluster config when unset)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// HTTPS proxy for remote clusters, overrides proxies set in secrets
    #[arg(long, env = "REWIND_HTTPS_PROXY")]
    https_proxy: Option<String>,

    /// Requests reconciled in parallel
    #[arg(long, env = "REWIND_WORKERS", default_value_t = 1)]
    workers: u16,

    /// Seconds a processed request is kept before it is deleted
    #[arg(long, env = "REWIND_REQUEST_TTL_SECS", default_value_t = rewind_backup::DEFAULT_REQUEST_TTL.as_secs())]
    request_ttl_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, env = "REWIND_SWEEP_INTERVAL_SECS", default_value_t = rewind_backup::DEFAULT_SWEEP_INTERVAL.as_secs())]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "rewind-operator".to_string(),
        ..Default::default()
    })?;

    validate(&cli)?;

    let bootstrap = create_client(cli.kubeconfig.as_deref()).await?;
    let clusters = ClusterClients::new(
        bootstrap,
        cli.namespace.clone(),
        cli.kubeconfig.clone(),
        cli.https_proxy.clone(),
    );
    let client = clusters.local_client().await?;
    log_remote_clusters(&clusters).await;

    controller_runner::run(
        client,
        RunnerConfig {
            namespace: cli.namespace,
            workers: cli.workers,
            request_ttl: Duration::from_secs(cli.request_ttl_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
        },
        Arc::new(InMemoryBackupTracker::new()),
        PluginRegistry::new().into_factory(),
    )
    .await;

    tracing::info!("Rewind operator shutting down");
    Ok(())
}

/// Reject settings the runtime would silently misinterpret
fn validate(cli: &Cli) -> anyhow::Result<()> {
    if cli.workers == 0 {
        anyhow::bail!("--workers must be greater than zero");
    }
    if cli.sweep_interval_secs == 0 {
        anyhow::bail!("--sweep-interval-secs must be greater than zero");
    }
    Ok(())
}

/// Resolve source and destination credentials once so misconfiguration
/// shows up at startup
async fn log_remote_clusters(clusters: &ClusterClients) {
    tracing::info!(
        namespace = clusters.namespace(),
        kubeconfig = ?clusters.kubeconfig(),
        https_proxy = clusters.https_proxy().is_some(),
        "resolving remote clusters"
    );
    for role in [ClusterRole::Source, ClusterRole::Destination] {
        if let Err(e) = clusters.config(role).await {
            tracing::warn!(role = %role, error = %e, "failed to resolve cluster credentials");
        }
    }
    tracing::info!(
        source = ?clusters.source_cluster_host(),
        destination = ?clusters.destination_cluster_host(),
        "remote clusters"
    );
}
