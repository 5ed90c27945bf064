use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ARCHIVE_PREFIX: &str = "orchestrator_backup_";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const METADATA_FILE: &str = "metadata.json";
pub const ORCHESTRATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sentinel used in `services` for a full backup.
pub const ALL_SERVICES: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSelection {
    All,
    Services(Vec<String>),
}

impl BackupSelection {
    /// `None` or an empty list selects everything.
    pub fn from_services(services: Option<Vec<String>>) -> Self {
        match services {
            Some(services) if !services.is_empty() => BackupSelection::Services(services),
            _ => BackupSelection::All,
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        match self {
            BackupSelection::All => vec![ALL_SERVICES.to_string()],
            BackupSelection::Services(services) => services.clone(),
        }
    }

    pub fn backup_type(&self) -> BackupType {
        match self {
            BackupSelection::All => BackupType::Full,
            BackupSelection::Services(_) => BackupType::Partial,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Partial,
}

/// Descriptor stored as `metadata.json` at the archive root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub orchestrator_version: String,
    pub services: Vec<String>,
    pub backup_type: BackupType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupArchive {
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub services: Vec<String>,
    pub orchestrator_version: String,
}

pub fn archive_name(at: DateTime<Utc>) -> String {
    format!(
        "{ARCHIVE_PREFIX}{}{ARCHIVE_SUFFIX}",
        at.format("%Y%m%d_%H%M%S")
    )
}

/// True for a bare file name following the archive naming pattern.
pub fn is_archive_name(name: &str) -> bool {
    let Some(stem) = name
        .strip_prefix(ARCHIVE_PREFIX)
        .and_then(|rest| rest.strip_suffix(ARCHIVE_SUFFIX))
    else {
        return false;
    };
    !stem.is_empty() && !stem.contains(['/', '\\']) && !stem.contains("..")
}
