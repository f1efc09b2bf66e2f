use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, warn};

use crate::errors::{FleetError, FleetResult};
use crate::files::{
    self, ensure_extension, list_files_with_extension, sanitized_file_name, FileMetaData,
    LOG_EXTENSION,
};
use crate::server::ServerEntity;

/// The log the wrapper currently writes to, in the server's base directory.
pub const CURRENT_LOG_NAME: &str = "console.log";

const ARCHIVE_PREFIX: &str = "console-";
const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

pub struct LogRotator;

impl LogRotator {
    /// Archives the current console log before a server starts. The archive
    /// name carries the log's creation timestamp (modification time where the
    /// filesystem has no creation time), the live log is truncated, and the
    /// oldest archives are deleted down to the server's retention cap.
    pub async fn rotate(entity: &ServerEntity) -> FleetResult<()> {
        fs::create_dir_all(&entity.logs_dir)
            .await
            .map_err(|e| FleetError::File(format!("Failed to create dir: {}", e)))?;

        match fs::metadata(&entity.current_log_path).await {
            Ok(metadata) => {
                let stamp = files::created_or_modified(&metadata).format(ARCHIVE_STAMP_FORMAT);
                let archive = entity
                    .logs_dir
                    .join(format!("{}{}.{}", ARCHIVE_PREFIX, stamp, LOG_EXTENSION));

                fs::copy(&entity.current_log_path, &archive)
                    .await
                    .map_err(|e| FleetError::File(format!("Error archiving log: {}", e)))?;
                debug!(
                    server_id = %entity.server_id,
                    "Log archived: {:?}", archive
                );
            }
            Err(_) => {
                debug!(server_id = %entity.server_id, "No log to rotate");
            }
        }

        // Truncate (or create) the live log so the next run starts clean.
        fs::write(&entity.current_log_path, b"")
            .await
            .map_err(|e| FleetError::File(format!("Error truncating log: {}", e)))?;

        Self::enforce_retention(entity).await
    }

    async fn enforce_retention(entity: &ServerEntity) -> FleetResult<()> {
        let mut archives: Vec<(std::time::SystemTime, String, PathBuf)> = Vec::new();
        let mut dir = fs::read_dir(&entity.logs_dir)
            .await
            .map_err(|e| FleetError::File(format!("Failed to read dir: {}", e)))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| FleetError::File(format!("Error reading dir entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| FleetError::File(format!("Failed to get metadata: {}", e)))?;
            let modified = metadata
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            archives.push((modified, entry.file_name().to_string_lossy().to_string(), path));
        }

        if archives.len() <= entity.max_log_files {
            return Ok(());
        }

        archives.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let excess = archives.len() - entity.max_log_files;
        for (_, name, path) in archives.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path).await {
                warn!(server_id = %entity.server_id, "Failed to delete old log {}: {}", name, e);
            } else {
                debug!(server_id = %entity.server_id, "Old log deleted: {}", name);
            }
        }

        Ok(())
    }

    /// Lists the live log plus the archived ones, newest first.
    pub async fn list(entity: &ServerEntity) -> FleetResult<Vec<FileMetaData>> {
        let mut logs = Vec::new();

        if let Ok(metadata) = fs::metadata(&entity.current_log_path).await {
            logs.push(FileMetaData {
                name: CURRENT_LOG_NAME.to_string(),
                directory: entity.server_id.clone(),
                created_time: files::created_or_modified(&metadata),
                last_modified_time: files::modified_time(&metadata),
                size: metadata.len(),
            });
        }

        if fs::try_exists(&entity.logs_dir).await.unwrap_or(false) {
            let directory_name = format!("{}/logs", entity.server_id);
            let mut archived =
                list_files_with_extension(&entity.logs_dir, &directory_name, LOG_EXTENSION).await?;
            archived.sort_by(|a, b| b.created_time.cmp(&a.created_time));
            logs.extend(archived);
        }

        Ok(logs)
    }

    /// Resolves a log name to its path for download. `console.log` maps to the
    /// live log; anything else must be an archive in the server's logs
    /// directory.
    pub async fn resolve(entity: &ServerEntity, file_name: &str) -> FleetResult<PathBuf> {
        let name = sanitized_file_name(file_name)?;

        let path = if name == CURRENT_LOG_NAME {
            entity.current_log_path.clone()
        } else {
            entity.logs_dir.join(name)
        };
        ensure_extension(&path, LOG_EXTENSION)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(FleetError::MissingFile(file_name.to_string()));
        }

        Ok(path)
    }
}
