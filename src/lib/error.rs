use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// The container runtime cannot be reached. Fatal during start-up.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A service configuration value could not be translated for the runtime.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl OrchestratorError {
    pub fn failed(msg: impl Into<String>) -> Self {
        OrchestratorError::OperationFailed(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        OrchestratorError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        OrchestratorError::Conflict(msg.into())
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => OrchestratorError::NotFound(err.to_string()),
            _ => OrchestratorError::OperationFailed(err.to_string()),
        }
    }
}
