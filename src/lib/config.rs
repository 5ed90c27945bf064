use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "ORCHESTRATOR_NAME", default = "Homie Orchestrator")]
    pub name: String,

    #[envconfig(from = "ORCHESTRATOR_BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "ORCHESTRATOR_BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(from = "ORCHESTRATOR_LOG_FORMAT", default = "text")]
    pub log_format: String,

    #[envconfig(nested = true)]
    pub docker: DockerConfig,

    #[envconfig(nested = true)]
    pub storage: StorageConfig,

    #[envconfig(nested = true)]
    pub monitoring: MonitoringConfig,

    #[envconfig(nested = true)]
    pub backup: BackupConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct DockerConfig {
    #[envconfig(from = "ORCHESTRATOR_DOCKER_SOCKET", default = "/var/run/docker.sock")]
    pub socket_path: String,

    #[envconfig(from = "ORCHESTRATOR_NETWORK_NAME", default = "homie_network")]
    pub network_name: String,

    #[envconfig(from = "ORCHESTRATOR_STOP_TIMEOUT_SECS", default = "30")]
    pub stop_timeout_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct StorageConfig {
    #[envconfig(from = "ORCHESTRATOR_DATA_PATH", default = "/data")]
    pub data_path: PathBuf,

    #[envconfig(from = "ORCHESTRATOR_CONFIG_PATH", default = "/config")]
    pub config_path: PathBuf,

    #[envconfig(from = "ORCHESTRATOR_BACKUP_PATH", default = "/backups")]
    pub backup_path: PathBuf,
}

#[derive(Envconfig, Clone, Debug)]
pub struct MonitoringConfig {
    #[envconfig(from = "ORCHESTRATOR_HEALTH_CHECK_INTERVAL_SECS", default = "30")]
    pub health_check_interval_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct BackupConfig {
    #[envconfig(from = "ORCHESTRATOR_BACKUP_ENABLED", default = "true")]
    pub enabled: bool,

    // Daily at 02:00
    #[envconfig(from = "ORCHESTRATOR_BACKUP_SCHEDULE", default = "0 2 * * *")]
    pub schedule: String,

    #[envconfig(from = "ORCHESTRATOR_BACKUP_RETENTION_DAYS", default = "30")]
    pub retention_days: u32,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

impl DockerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl MonitoringConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}
