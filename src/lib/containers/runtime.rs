use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::spec::LaunchSpec;
use super::types::{ContainerSummary, RuntimeContainer};
use crate::lib::error::OrchestratorError;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("runtime unreachable: {0}")]
    Unavailable(String),
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Failed(String),
}

impl From<RuntimeError> for OrchestratorError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => OrchestratorError::RuntimeUnavailable(msg),
            RuntimeError::NotFound(msg) => OrchestratorError::NotFound(msg),
            RuntimeError::Conflict(msg) => OrchestratorError::Conflict(msg),
            RuntimeError::Failed(msg) => OrchestratorError::OperationFailed(msg),
        }
    }
}

/// The container engine as seen by the lifecycle manager.
///
/// Every call crosses into the engine and may fail for reasons outside the
/// orchestrator's control. Implementations do not retry.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> RuntimeResult<()>;

    async fn network_exists(&self, name: &str) -> RuntimeResult<bool>;

    async fn create_network(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> RuntimeResult<()>;

    async fn connect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()>;

    /// Lists every container, running or not, carrying `label` (`key=value`).
    async fn list_labelled(&self, label: &str) -> RuntimeResult<Vec<ContainerSummary>>;

    /// Creates a container without starting it and returns its id.
    async fn create_container(&self, spec: &LaunchSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    /// The engine force-kills the container once `timeout` elapses.
    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;

    async fn restart_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<RuntimeContainer>;

    async fn container_logs(&self, id: &str, tail: usize) -> RuntimeResult<String>;

    async fn container_stats(&self, id: &str) -> RuntimeResult<serde_json::Value>;

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()>;
}
