//! Garbage collection of processed DeleteBackupRequests
//!
//! Processed requests are kept for a while so their error lists can be read,
//! then removed. Requests in any other phase are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rewind_common::crd::{DeleteBackupRequest, DeleteBackupRequestPhase};
use rewind_common::Error;

use crate::deletion_controller::KubeClient;
use crate::{DEFAULT_REQUEST_TTL, DEFAULT_SWEEP_INTERVAL};

/// True when a request is processed and at least `ttl` old
///
/// A request without a creation timestamp is never expired.
pub fn is_expired(request: &DeleteBackupRequest, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
    if request.phase() != DeleteBackupRequestPhase::Processed {
        return false;
    }
    match request.creation_timestamp() {
        Some(created) => created.0 <= now - ttl,
        None => false,
    }
}

/// Delete every expired request in a namespace
///
/// Returns how many requests were deleted. A failed deletion is logged and
/// the sweep moves on to the next request.
pub async fn delete_expired_requests(
    kube: &dyn KubeClient,
    namespace: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<usize, Error> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::config("request-ttl", format!("invalid ttl: {}", e)))?;

    let requests = kube.list_requests(namespace, "").await?;
    let mut deleted = 0;
    for request in requests.iter().filter(|r| is_expired(r, now, ttl)) {
        let name = request.name_any();
        let ns = request.namespace().unwrap_or_else(|| namespace.to_string());
        match kube.delete_request(&ns, &name).await {
            Ok(()) => {
                debug!(request = %name, "deleted expired request");
                deleted += 1;
            }
            Err(e) => warn!(request = %name, error = %e, "failed to delete expired request"),
        }
    }
    Ok(deleted)
}

/// Periodically removes expired requests
pub struct ExpirySweeper {
    kube: Arc<dyn KubeClient>,
    namespace: String,
    ttl: Duration,
    interval: Duration,
}

impl ExpirySweeper {
    /// Sweeper with the default TTL and interval
    pub fn new(kube: Arc<dyn KubeClient>, namespace: impl Into<String>) -> Self {
        Self {
            kube,
            namespace: namespace.into(),
            ttl: DEFAULT_REQUEST_TTL,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// How long processed requests are kept
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Time between sweeps
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run a single sweep against the current time
    pub async fn sweep(&self) -> Result<usize, Error> {
        delete_expired_requests(self.kube.as_ref(), &self.namespace, Utc::now(), self.ttl).await
    }

    /// Sweep on every tick until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            namespace = %self.namespace,
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.interval.as_secs(),
            "expiry sweeper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("expiry sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(0) => debug!("no expired requests"),
                        Ok(n) => info!(deleted = n, "deleted expired requests"),
                        Err(e) => warn!(error = %e, "expiry sweep failed"),
                    }
                }
            }
        }
    }
}

/// Run a sweeper with explicit settings until cancelled
pub async fn run_expiry_sweeper(
    kube: Arc<dyn KubeClient>,
    namespace: impl Into<String>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    ExpirySweeper::new(kube, namespace)
        .with_ttl(ttl)
        .with_interval(interval)
        .run(cancel)
        .await
}
