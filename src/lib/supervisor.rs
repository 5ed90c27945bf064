use std::sync::Arc;

use tracing::{error, info};

use crate::lib::api::AppState;
use crate::lib::backup::{BackupCoordinator, BackupPaths, BackupSelection};
use crate::lib::config::Config;
use crate::lib::containers::LifecycleManager;
use crate::lib::containers::runtime::ContainerRuntime;
use crate::lib::error::Result;
use crate::lib::health::HealthMonitor;
use crate::lib::scheduler::Scheduler;

pub const HEALTH_CHECK_TASK: &str = "health_check";
pub const CLEANUP_TASK: &str = "cleanup";
pub const BACKUP_TASK: &str = "backup";

// Every 5 minutes, and daily at 03:00.
const HEALTH_CHECK_SCHEDULE: &str = "*/5 * * * *";
const CLEANUP_SCHEDULE: &str = "0 3 * * *";

/// Owns the four components and brings them up and down in order.
pub struct Supervisor {
    config: Config,
    manager: Arc<LifecycleManager>,
    monitor: Arc<HealthMonitor>,
    scheduler: Arc<Scheduler>,
    backups: Arc<BackupCoordinator>,
}

impl Supervisor {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let manager = Arc::new(LifecycleManager::new(
            runtime,
            &config.docker.network_name,
            config.docker.stop_timeout(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            manager.clone(),
            config.monitoring.check_interval(),
        ));
        let backups = Arc::new(BackupCoordinator::new(
            BackupPaths {
                backup_dir: config.storage.backup_path.clone(),
                config_dir: config.storage.config_path.clone(),
                data_dir: config.storage.data_path.clone(),
            },
            config.backup.retention_days,
        ));

        Supervisor {
            config,
            manager,
            monitor,
            scheduler: Arc::new(Scheduler::new()),
            backups,
        }
    }

    /// Brings every component up. A runtime that cannot be reached is fatal;
    /// nothing else is started in that case.
    pub async fn start(&self) -> Result<()> {
        info!(name = %self.config.name, "starting orchestrator");

        self.manager
            .initialize()
            .await
            .inspect_err(|e| error!(error = %e, "failed to initialize lifecycle manager"))?;

        self.scheduler.start().await;
        self.register_default_tasks().await?;

        self.monitor.start().await;

        if self.config.backup.enabled {
            self.backups.initialize().await?;
        }

        info!("orchestrator started");
        Ok(())
    }

    async fn register_default_tasks(&self) -> Result<()> {
        let monitor = self.monitor.clone();
        self.scheduler
            .add_task(
                HEALTH_CHECK_TASK,
                "Health check",
                HEALTH_CHECK_SCHEDULE,
                true,
                move || {
                    let monitor = monitor.clone();
                    async move { monitor.run_pass().await.map(|_| ()) }
                },
            )
            .await?;

        let backups = self.backups.clone();
        self.scheduler
            .add_task(
                CLEANUP_TASK,
                "System cleanup",
                CLEANUP_SCHEDULE,
                true,
                move || {
                    let backups = backups.clone();
                    async move {
                        let removed = backups.cleanup_old_backups().await?;
                        info!(removed, "system cleanup finished");
                        Ok(())
                    }
                },
            )
            .await?;

        if self.config.backup.enabled {
            let backups = self.backups.clone();
            self.scheduler
                .add_task(
                    BACKUP_TASK,
                    "Scheduled backup",
                    &self.config.backup.schedule,
                    true,
                    move || {
                        let backups = backups.clone();
                        async move { backups.create_backup(BackupSelection::All).await.map(|_| ()) }
                    },
                )
                .await?;
        }
        Ok(())
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            &self.config.name,
            self.manager.clone(),
            self.monitor.clone(),
            self.scheduler.clone(),
            self.backups.clone(),
        )
    }

    /// Stops the background loops, waits for them, then releases the runtime.
    pub async fn shutdown(&self) {
        info!("shutting down orchestrator");
        self.monitor.stop().await;
        self.scheduler.stop().await;
        self.manager.cleanup().await;
        info!("orchestrator shutdown completed");
    }
}
