use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::archive::{ArchiveCodec, TarGzCodec, copy_tree};
use super::types::{
    ALL_SERVICES, BackupArchive, BackupMetadata, BackupSelection, METADATA_FILE,
    ORCHESTRATOR_VERSION, archive_name, is_archive_name,
};
use crate::lib::error::{OrchestratorError, Result};

const SECS_PER_DAY: u64 = 86_400;

/// Filesystem locations owned by the coordinator.
#[derive(Debug, Clone)]
pub struct BackupPaths {
    pub backup_dir: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

/// Exclusive hold on one archive name, released on drop.
struct ArchiveClaim {
    busy: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for ArchiveClaim {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// Produces, restores and expires backup archives.
///
/// An archive only ever appears under its final name once it is completely
/// written: content is staged in a private directory, packed to a hidden
/// temporary file and then linked into place without overwriting.
pub struct BackupCoordinator {
    paths: Arc<BackupPaths>,
    retention_days: u32,
    codec: Arc<dyn ArchiveCodec>,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl BackupCoordinator {
    pub fn new(paths: BackupPaths, retention_days: u32) -> Self {
        Self::with_codec(paths, retention_days, Arc::new(TarGzCodec))
    }

    pub fn with_codec(
        paths: BackupPaths,
        retention_days: u32,
        codec: Arc<dyn ArchiveCodec>,
    ) -> Self {
        BackupCoordinator {
            paths: Arc::new(paths),
            retention_days,
            codec,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Creates the backup directory and runs the retention sweep.
    pub async fn initialize(&self) -> Result<()> {
        let backup_dir = self.paths.backup_dir.clone();
        blocking(move || fs::create_dir_all(&backup_dir).map_err(OrchestratorError::from))
            .await
            .inspect_err(|e| error!(error = %e, "failed to initialize backup directory"))?;

        if let Err(e) = self.cleanup_old_backups().await {
            error!(error = %e, "retention sweep failed");
        }
        info!(path = %self.paths.backup_dir.display(), "backup coordinator initialized");
        Ok(())
    }

    fn claim(&self, name: &str) -> Result<ArchiveClaim> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(name.to_string()) {
            return Err(OrchestratorError::conflict(format!(
                "backup {name} is in use by another operation"
            )));
        }
        Ok(ArchiveClaim {
            busy: self.busy.clone(),
            name: name.to_string(),
        })
    }

    fn archive_path(&self, filename: &str) -> Result<PathBuf> {
        if !is_archive_name(filename) {
            return Err(OrchestratorError::not_found(format!("backup {filename}")));
        }
        Ok(self.paths.backup_dir.join(filename))
    }

    pub async fn create_backup(&self, selection: BackupSelection) -> Result<BackupArchive> {
        if let BackupSelection::Services(services) = &selection {
            if let Some(bad) = services.iter().find(|s| !is_plain_name(s)) {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "invalid service name {bad:?}"
                )));
            }
        }

        let now = Utc::now();
        let filename = archive_name(now);
        let claim = self.claim(&filename)?;
        info!(backup = %filename, "creating backup");

        let paths = self.paths.clone();
        let codec = self.codec.clone();
        let result = blocking(move || {
            let _claim = claim;
            write_archive(&paths, codec.as_ref(), &selection, &filename, now)
        })
        .await;

        match &result {
            Ok(archive) => info!(backup = %archive.filename, size = archive.size_bytes, "backup created"),
            Err(e) => error!(error = %e, "failed to create backup"),
        }
        result
    }

    /// Extracts `filename` and overlays its configuration and data onto the
    /// live trees. An error while writing may leave a partial overlay.
    pub async fn restore_backup(&self, filename: &str) -> Result<()> {
        let archive = self.archive_path(filename)?;
        let claim = self.claim(filename)?;
        if !archive.is_file() {
            error!(backup = filename, "backup file not found");
            return Err(OrchestratorError::not_found(format!("backup {filename}")));
        }
        info!(backup = filename, "restoring backup");

        let paths = self.paths.clone();
        let codec = self.codec.clone();
        let result = blocking(move || {
            let _claim = claim;
            restore_archive(&paths, codec.as_ref(), &archive)
        })
        .await;

        match &result {
            Ok(()) => info!(backup = filename, "backup restored"),
            Err(e) => error!(backup = filename, error = %e, "failed to restore backup"),
        }
        result
    }

    /// Archives in the backup directory, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupArchive>> {
        let backup_dir = self.paths.backup_dir.clone();
        let codec = self.codec.clone();
        blocking(move || list_archives(&backup_dir, codec.as_ref()))
            .await
            .inspect_err(|e| error!(error = %e, "failed to list backups"))
    }

    pub async fn delete_backup(&self, filename: &str) -> Result<()> {
        let archive = self.archive_path(filename)?;
        let claim = self.claim(filename)?;

        let result = blocking(move || {
            let _claim = claim;
            fs::remove_file(&archive).map_err(OrchestratorError::from)
        })
        .await;

        match &result {
            Ok(()) => info!(backup = filename, "backup deleted"),
            Err(e) => error!(backup = filename, error = %e, "failed to delete backup"),
        }
        result
    }

    /// Deletes archives whose modification time is older than the retention
    /// horizon. Archives busy in another operation are skipped.
    pub async fn cleanup_old_backups(&self) -> Result<usize> {
        let horizon = Duration::from_secs(u64::from(self.retention_days) * SECS_PER_DAY);
        let cutoff = SystemTime::now()
            .checked_sub(horizon)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let backup_dir = self.paths.backup_dir.clone();
        let expired = blocking(move || expired_archives(&backup_dir, cutoff)).await?;

        let mut removed = 0;
        for filename in expired {
            match self.delete_backup(&filename).await {
                Ok(()) => {
                    info!(backup = %filename, "deleted expired backup");
                    removed += 1;
                }
                Err(OrchestratorError::Conflict(_)) => {
                    warn!(backup = %filename, "expired backup is busy, skipping");
                }
                Err(e) => error!(backup = %filename, error = %e, "failed to delete expired backup"),
            }
        }
        Ok(removed)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OrchestratorError::failed(format!("backup worker failed: {e}")))?
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != ALL_SERVICES
        && !name.contains(['/', '\\'])
}

fn write_archive(
    paths: &BackupPaths,
    codec: &dyn ArchiveCodec,
    selection: &BackupSelection,
    filename: &str,
    now: DateTime<Utc>,
) -> Result<BackupArchive> {
    let target = paths.backup_dir.join(filename);
    if target.exists() {
        return Err(OrchestratorError::conflict(format!("backup {filename} already exists")));
    }
    fs::create_dir_all(&paths.backup_dir)?;

    // Both temporaries are removed on drop, so every early return below
    // leaves the backup directory as it was.
    let staging = tempfile::Builder::new()
        .prefix(".staging_")
        .tempdir_in(&paths.backup_dir)?;
    stage(paths, selection, staging.path())?;

    let metadata = BackupMetadata {
        timestamp: now,
        orchestrator_version: ORCHESTRATOR_VERSION.to_string(),
        services: selection.service_names(),
        backup_type: selection.backup_type(),
    };
    let descriptor = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| OrchestratorError::failed(format!("cannot encode metadata: {e}")))?;
    fs::write(staging.path().join(METADATA_FILE), descriptor)?;

    let partial = tempfile::Builder::new()
        .prefix(&format!(".{filename}."))
        .suffix(".partial")
        .tempfile_in(&paths.backup_dir)?;
    codec
        .pack(staging.path(), partial.path())
        .map_err(|e| OrchestratorError::failed(format!("cannot pack archive: {e}")))?;
    partial.persist_noclobber(&target).map_err(|e| {
        OrchestratorError::failed(format!("cannot finalize archive {filename}: {}", e.error))
    })?;

    if let Err(e) = staging.close() {
        warn!(error = %e, "failed to remove staging directory");
    }
    let size_bytes = fs::metadata(&target)?.len();

    Ok(BackupArchive {
        filename: filename.to_string(),
        size_bytes,
        created_at: now,
        services: metadata.services,
        orchestrator_version: metadata.orchestrator_version,
    })
}

fn stage(paths: &BackupPaths, selection: &BackupSelection, staging: &Path) -> Result<()> {
    let config = staging.join("config");
    fs::create_dir_all(&config)?;
    if paths.config_dir.is_dir() {
        copy_tree(&paths.config_dir, &config)?;
    }

    let data = staging.join("data");
    fs::create_dir_all(&data)?;
    match selection {
        BackupSelection::All => {
            let all = data.join(ALL_SERVICES);
            fs::create_dir_all(&all)?;
            if paths.data_dir.is_dir() {
                copy_tree(&paths.data_dir, &all)?;
            }
        }
        BackupSelection::Services(services) => {
            for service in services {
                let source = paths.data_dir.join(service);
                if !source.is_dir() {
                    warn!(service = %service, "no data directory for service");
                    continue;
                }
                copy_tree(&source, &data.join(service))?;
            }
        }
    }
    Ok(())
}

fn restore_archive(paths: &BackupPaths, codec: &dyn ArchiveCodec, archive: &Path) -> Result<()> {
    let extracted = tempfile::Builder::new()
        .prefix(".restore_")
        .tempdir_in(&paths.backup_dir)?;
    codec
        .unpack(archive, extracted.path())
        .map_err(|e| OrchestratorError::failed(format!("cannot extract archive: {e}")))?;

    match fs::read(extracted.path().join(METADATA_FILE)) {
        Ok(raw) => match serde_json::from_slice::<BackupMetadata>(&raw) {
            Ok(metadata) => info!(
                services = ?metadata.services,
                version = %metadata.orchestrator_version,
                "backup metadata"
            ),
            Err(e) => warn!(error = %e, "unreadable backup metadata"),
        },
        Err(_) => warn!("backup has no metadata"),
    }

    let write_failed =
        |what: &str, e: std::io::Error| OrchestratorError::failed(format!("restoring {what}: {e}"));

    let config = extracted.path().join("config");
    if config.is_dir() {
        copy_tree(&config, &paths.config_dir).map_err(|e| write_failed("configuration", e))?;
    }

    let data = extracted.path().join("data");
    let all = data.join(ALL_SERVICES);
    if all.is_dir() {
        copy_tree(&all, &paths.data_dir).map_err(|e| write_failed("data", e))?;
    } else if data.is_dir() {
        let mut failed = Vec::new();
        for entry in fs::read_dir(&data)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let service = entry.file_name().to_string_lossy().into_owned();
            if let Err(e) = copy_tree(&entry.path(), &paths.data_dir.join(&service)) {
                error!(service = %service, error = %e, "failed to restore service data");
                failed.push(service);
            }
        }
        if !failed.is_empty() {
            return Err(OrchestratorError::failed(format!(
                "restoring data failed for {}",
                failed.join(", ")
            )));
        }
    }
    Ok(())
}

fn list_archives(backup_dir: &Path, codec: &dyn ArchiveCodec) -> Result<Vec<BackupArchive>> {
    if !backup_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut archives = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        if !is_archive_name(&filename) {
            continue;
        }
        let Some(stat) = archive_stat(&entry.path())? else {
            continue;
        };
        if !stat.is_file() {
            continue;
        }

        let metadata = codec
            .read_entry(&entry.path(), METADATA_FILE)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_slice::<BackupMetadata>(&raw).ok());

        archives.push(BackupArchive {
            filename,
            size_bytes: stat.len(),
            created_at: stat.modified().map(DateTime::<Utc>::from).unwrap_or_default(),
            services: metadata.as_ref().map(|m| m.services.clone()).unwrap_or_default(),
            orchestrator_version: metadata
                .map(|m| m.orchestrator_version)
                .unwrap_or_else(|| "unknown".to_string()),
        });
    }

    archives.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(archives)
}

/// Metadata of a listed archive, or `None` if it was deleted after the
/// directory was read.
fn archive_stat(path: &Path) -> std::io::Result<Option<fs::Metadata>> {
    match fs::metadata(path) {
        Ok(stat) => Ok(Some(stat)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn expired_archives(backup_dir: &Path, cutoff: SystemTime) -> Result<Vec<String>> {
    if !backup_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut expired = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        if !is_archive_name(&filename) {
            continue;
        }
        let Some(stat) = archive_stat(&entry.path())? else {
            continue;
        };
        if stat.modified()? < cutoff {
            expired.push(filename);
        }
    }
    Ok(expired)
}
