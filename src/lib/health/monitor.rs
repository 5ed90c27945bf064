use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::types::{HealthStatus, HealthVerdict, OverallHealth};
use crate::lib::containers::LifecycleManager;
use crate::lib::error::Result;

/// Samples the lifecycle manager on a fixed cadence and keeps one current
/// verdict per known service. Never mutates the manager.
pub struct HealthMonitor {
    manager: Arc<LifecycleManager>,
    interval: Duration,
    verdicts: RwLock<HashMap<String, HealthVerdict>>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<LifecycleManager>, interval: Duration) -> Self {
        HealthMonitor {
            manager,
            interval,
            verdicts: RwLock::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the monitoring loop. Calling it on a running monitor does nothing.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().monitor_loop(token.clone()));
        *worker = Some((token, handle));
        info!(interval_secs = self.interval.as_secs(), "health monitor started");
    }

    /// Cancels the pending sleep and waits for the loop to exit. A pass that is
    /// already running completes first.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.worker.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "health monitor loop ended abnormally");
        }
        info!("health monitor stopped");
    }

    async fn monitor_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            if let Err(e) = self.run_pass().await {
                error!(error = %e, "health check pass failed");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Classifies every registered service once and replaces the verdict set.
    /// Returns the number of services checked.
    pub async fn run_pass(&self) -> Result<usize> {
        let containers = self.manager.list_containers().await?;
        let now = Utc::now();

        let verdicts: HashMap<String, HealthVerdict> = containers
            .iter()
            .map(|info| {
                let verdict = HealthVerdict::classify(info, now);
                if matches!(verdict.status, HealthStatus::Unhealthy | HealthStatus::Error) {
                    warn!(service = %verdict.service, message = %verdict.message, "unhealthy service detected");
                }
                (info.service.clone(), verdict)
            })
            .collect();

        let count = verdicts.len();
        *self.verdicts.write().await = verdicts;
        Ok(count)
    }

    pub async fn get_service_health(&self, name: &str) -> Option<HealthVerdict> {
        self.verdicts.read().await.get(name).cloned()
    }

    pub async fn get_all_health_checks(&self) -> Vec<HealthVerdict> {
        let mut checks: Vec<HealthVerdict> = self.verdicts.read().await.values().cloned().collect();
        checks.sort_by(|a, b| a.service.cmp(&b.service));
        checks
    }

    pub async fn get_overall_health(&self) -> OverallHealth {
        OverallHealth::aggregate(self.get_all_health_checks().await, Utc::now())
    }

    pub async fn get_unhealthy_services(&self) -> Vec<HealthVerdict> {
        self.get_all_health_checks()
            .await
            .into_iter()
            .filter(HealthVerdict::needs_attention)
            .collect()
    }

    pub async fn is_service_healthy(&self, name: &str) -> bool {
        self.get_service_health(name)
            .await
            .is_some_and(|v| v.is_healthy())
    }
}
