//! Health check aggregation
//!
//! A fixed set of probes runs concurrently on an interval. The latest results
//! are kept as a snapshot that is replaced wholesale on every cycle, so
//! readers never see a half-updated set.

pub mod checks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use checks::{CacheProbe, DatabaseProbe, FilesystemProbe, MemoryProbe};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthError {
    #[error("{label} health check timed out after {ms}ms")]
    TimedOut { label: String, ms: u64 },
}

/// Await `fut`, failing with a labelled timeout error after `limit`
pub async fn with_timeout<T, F>(fut: F, limit: Duration, label: &str) -> Result<T, HealthError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| HealthError::TimedOut {
            label: label.to_string(),
            ms: limit.as_millis() as u64,
        })
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            duration_ms: None,
            details: None,
            error: None,
        }
    }

    pub fn failed(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            healthy: false,
            duration_ms: None,
            details: None,
            error: Some(error.into()),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(elapsed.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub checks: Vec<HealthCheckResult>,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn is_degraded(&self) -> bool {
        self.status == HealthStatus::Degraded
    }
}

/// Derive the overall status from a set of results
pub fn build_snapshot(checks: Vec<HealthCheckResult>) -> HealthSnapshot {
    let status = if checks.is_empty() {
        HealthStatus::Disabled
    } else if checks.iter().all(|c| c.healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    HealthSnapshot {
        checks,
        status,
        timestamp: Utc::now(),
    }
}

/// A named dependency check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> anyhow::Result<HealthCheckResult>;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "health check panicked".to_string()
    }
}

/// Runs the probes and holds the latest snapshot
pub struct HealthAggregator {
    probes: Vec<Arc<dyn HealthProbe>>,
    interval: Duration,
    snapshot: RwLock<Arc<HealthSnapshot>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HealthAggregator {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, interval: Duration) -> Self {
        Self {
            probes,
            interval,
            snapshot: RwLock::new(Arc::new(build_snapshot(Vec::new()))),
            poller: Mutex::new(None),
        }
    }

    /// An aggregator with no probes; its snapshot is always `disabled`
    pub fn disabled() -> Self {
        Self::new(Vec::new(), Duration::from_secs(15))
    }

    pub fn is_enabled(&self) -> bool {
        !self.probes.is_empty()
    }

    /// Latest snapshot, without running anything
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot.read().clone()
    }

    /// Run every probe concurrently and replace the snapshot
    pub async fn run_checks(&self) -> Arc<HealthSnapshot> {
        let runs = self.probes.iter().map(|probe| async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(probe.check()).catch_unwind().await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok(mut result)) => {
                    result.name = probe.name().to_string();
                    if result.duration_ms.is_none() {
                        result.duration_ms = Some(elapsed.as_millis() as u64);
                    }
                    result
                }
                Ok(Err(e)) => HealthCheckResult::failed(probe.name(), e.to_string()).with_duration(elapsed),
                Err(payload) => {
                    HealthCheckResult::failed(probe.name(), panic_message(payload.as_ref())).with_duration(elapsed)
                }
            }
        });

        let snapshot = Arc::new(build_snapshot(join_all(runs).await));

        for check in snapshot.checks.iter().filter(|c| !c.healthy) {
            warn!(
                check = %check.name,
                error = check.error.as_deref().unwrap_or(""),
                "Health check failed"
            );
        }
        debug!(status = ?snapshot.status, checks = snapshot.checks.len(), "Health checks completed");

        *self.snapshot.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// Start background polling: one run immediately, then one per interval
    ///
    /// Does nothing for an aggregator with no probes or one already polling.
    pub fn start(self: &Arc<Self>) {
        if !self.is_enabled() {
            info!("Health checks disabled");
            return;
        }

        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }

        info!(
            interval_ms = self.interval.as_millis() as u64,
            probes = self.probes.len(),
            "Health checks started"
        );

        let aggregator = Arc::clone(self);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                aggregator.run_checks().await;
            }
        }));
    }

    /// Stop background polling
    pub fn stop(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
            debug!("Health checks stopped");
        }
    }
}

impl Drop for HealthAggregator {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}
