use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::config::FleetConfig;
use crate::errors::{FleetError, FleetResult};

pub const GLOBAL_SAVES_DIR: &str = "global_saves";
pub const LOCAL_SAVES_DIR: &str = "local_saves";
pub const TEMP_SAVES_DIR: &str = "temp_saves";

pub const SAVE_EXTENSION: &str = "zip";
pub const LOG_EXTENSION: &str = "log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetaData {
    pub name: String,
    pub directory: String,
    pub created_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub size: u64,
}

/// Resolves save-file operations against the three logical save roots:
/// the shared `global_saves` plus `<server id>/local_saves` and
/// `<server id>/temp_saves` per registered server. Every resolved path must
/// stay under the configured base directory.
pub struct FileManager {
    base_dir: PathBuf,
    scenario_dir: PathBuf,
    valid_save_dirs: HashSet<String>,
}

impl FileManager {
    pub fn new(config: &FleetConfig) -> Self {
        let mut valid_save_dirs = HashSet::new();
        valid_save_dirs.insert(GLOBAL_SAVES_DIR.to_string());
        for server in &config.servers {
            valid_save_dirs.insert(format!("{}/{}", server.id, LOCAL_SAVES_DIR));
            valid_save_dirs.insert(format!("{}/{}", server.id, TEMP_SAVES_DIR));
        }

        Self {
            base_dir: config.paths.base_dir.clone(),
            scenario_dir: config.paths.scenario_dir(),
            valid_save_dirs,
        }
    }

    /// Maps a logical directory name onto its filesystem path, creating the
    /// directory when missing. Unknown names and names escaping the base
    /// directory fail with `InvalidDirectory`.
    async fn save_directory(&self, directory_name: &str) -> FleetResult<PathBuf> {
        if !self.valid_save_dirs.contains(directory_name) {
            return Err(FleetError::InvalidDirectory(directory_name.to_string()));
        }

        let dir = self.base_dir.join(directory_name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FleetError::File(format!("Failed to create dir: {}", e)))?;

        let canonical_base = self
            .base_dir
            .canonicalize()
            .map_err(|_| FleetError::InvalidDirectory("Base directory missing".to_string()))?;
        let canonical = dir
            .canonicalize()
            .map_err(|e| FleetError::File(format!("Failed to resolve dir: {}", e)))?;
        if !canonical.starts_with(&canonical_base) {
            return Err(FleetError::InvalidDirectory(directory_name.to_string()));
        }

        Ok(canonical)
    }

    fn resolve(&self, directory: &Path, file_name: &str) -> FleetResult<PathBuf> {
        Ok(directory.join(sanitized_file_name(file_name)?))
    }

    /// Path of an existing `.zip` save in one of the save roots.
    pub async fn get_save_file(
        &self,
        directory_name: &str,
        file_name: &str,
    ) -> FleetResult<PathBuf> {
        let directory = self.save_directory(directory_name).await?;
        let path = self.resolve(&directory, file_name)?;

        ensure_extension(&path, SAVE_EXTENSION)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(FleetError::MissingFile(format!(
                "{}/{}",
                directory_name, file_name
            )));
        }

        Ok(path)
    }

    pub async fn upload_save(
        &self,
        directory_name: &str,
        file_name: &str,
        data: &[u8],
    ) -> FleetResult<()> {
        if file_name.trim().is_empty() {
            return Err(FleetError::InvalidFileName(file_name.to_string()));
        }
        if file_name.contains(' ') {
            return Err(FleetError::InvalidFileName(format!(
                "name {} cannot contain spaces.",
                file_name
            )));
        }

        let directory = self.save_directory(directory_name).await?;
        let path = self.resolve(&directory, file_name)?;
        ensure_extension(&path, SAVE_EXTENSION)?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(FleetError::FileAlreadyExists(format!(
                "{} already exists.",
                file_name
            )));
        }

        fs::write(&path, data)
            .await
            .map_err(|e| FleetError::File(format!("Error uploading {}: {}", file_name, e)))?;

        info!("Save uploaded: {:?} ({} bytes)", path, data.len());
        Ok(())
    }

    pub async fn delete_save(&self, directory_name: &str, file_name: &str) -> FleetResult<()> {
        let path = self.get_save_file(directory_name, file_name).await?;

        fs::remove_file(&path)
            .await
            .map_err(|e| FleetError::File(format!("Error deleting {}: {}", file_name, e)))?;

        info!("Save deleted: {:?}", path);
        Ok(())
    }

    pub async fn move_save(
        &self,
        source_directory: &str,
        file_name: &str,
        destination_directory: &str,
    ) -> FleetResult<()> {
        let source = self.get_save_file(source_directory, file_name).await?;
        let destination_dir = self.save_directory(destination_directory).await?;
        let destination = self.resolve(&destination_dir, file_name)?;

        if fs::try_exists(&destination).await.unwrap_or(false) {
            return Err(FleetError::FileAlreadyExists(format!(
                "{}/{} already exists.",
                destination_directory, file_name
            )));
        }

        fs::rename(&source, &destination)
            .await
            .map_err(|e| FleetError::File(format!("Error moving {}: {}", file_name, e)))?;

        debug!("Save moved: {:?} -> {:?}", source, destination);
        Ok(())
    }

    pub async fn copy_save(
        &self,
        source_directory: &str,
        file_name: &str,
        destination_directory: &str,
    ) -> FleetResult<()> {
        let source = self.get_save_file(source_directory, file_name).await?;
        let destination_dir = self.save_directory(destination_directory).await?;
        let destination = self.resolve(&destination_dir, file_name)?;

        if fs::try_exists(&destination).await.unwrap_or(false) {
            return Err(FleetError::FileAlreadyExists(format!(
                "{}/{} already exists.",
                destination_directory, file_name
            )));
        }

        fs::copy(&source, &destination)
            .await
            .map_err(|e| FleetError::File(format!("Error copying {}: {}", file_name, e)))?;

        debug!("Save copied: {:?} -> {:?}", source, destination);
        Ok(())
    }

    pub async fn rename_save(
        &self,
        directory_name: &str,
        file_name: &str,
        new_file_name: &str,
    ) -> FleetResult<()> {
        if new_file_name.trim().is_empty() {
            return Err(FleetError::InvalidFileName(new_file_name.to_string()));
        }
        if new_file_name.contains(' ') {
            return Err(FleetError::InvalidFileName(format!(
                "name {} cannot contain spaces.",
                new_file_name
            )));
        }

        let source = self.get_save_file(directory_name, file_name).await?;
        let directory = self.save_directory(directory_name).await?;

        let mut new_name = sanitized_file_name(new_file_name)?.to_string();
        if Path::new(&new_name).extension().and_then(|e| e.to_str()) != Some(SAVE_EXTENSION) {
            new_name.push('.');
            new_name.push_str(SAVE_EXTENSION);
        }
        let destination = directory.join(&new_name);

        if fs::try_exists(&destination).await.unwrap_or(false) {
            return Err(FleetError::FileAlreadyExists(format!(
                "File {} already exists.",
                new_name
            )));
        }

        fs::rename(&source, &destination)
            .await
            .map_err(|e| FleetError::File(format!("Error renaming {}: {}", file_name, e)))?;

        debug!("Save renamed: {:?} -> {:?}", source, destination);
        Ok(())
    }

    pub async fn list_saves(&self, directory_name: &str) -> FleetResult<Vec<FileMetaData>> {
        let directory = self.save_directory(directory_name).await?;
        list_files_with_extension(&directory, directory_name, SAVE_EXTENSION).await
    }

    /// Resolves a scenario name against the shared scenario root; the
    /// scenario directory must exist.
    pub async fn scenario_path(&self, scenario_name: &str) -> FleetResult<PathBuf> {
        let name = sanitized_file_name(scenario_name)?;
        let path = self.scenario_dir.join(name);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(FleetError::MissingFile(format!(
                "Scenario {} not found.",
                scenario_name
            )));
        }

        Ok(path)
    }

    pub async fn list_scenarios(&self) -> FleetResult<Vec<FileMetaData>> {
        fs::create_dir_all(&self.scenario_dir)
            .await
            .map_err(|e| FleetError::File(format!("Failed to create dir: {}", e)))?;

        let mut scenarios = Vec::new();
        let mut dir = fs::read_dir(&self.scenario_dir)
            .await
            .map_err(|e| FleetError::File(format!("Failed to read dir: {}", e)))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| FleetError::File(format!("Error reading dir entry: {}", e)))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| FleetError::File(format!("Failed to get metadata: {}", e)))?;
            if !metadata.is_dir() {
                continue;
            }

            scenarios.push(FileMetaData {
                name: entry.file_name().to_string_lossy().to_string(),
                directory: "scenarios".to_string(),
                created_time: created_or_modified(&metadata),
                last_modified_time: modified_time(&metadata),
                size: 0,
            });
        }

        scenarios.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scenarios)
    }
}

/// Accepts only a bare file name: a single normal path component. Separators
/// and parent components are traversal attempts.
pub fn sanitized_file_name(file_name: &str) -> FleetResult<&str> {
    let path = Path::new(file_name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name
            .to_str()
            .ok_or_else(|| FleetError::InvalidFileName(file_name.to_string())),
        _ => Err(FleetError::File(format!(
            "Invalid file name {}",
            file_name
        ))),
    }
}

pub fn ensure_extension(path: &Path, extension: &str) -> FleetResult<()> {
    if path.extension().and_then(|e| e.to_str()) == Some(extension) {
        Ok(())
    } else {
        Err(FleetError::InvalidFileName(format!(
            "{} must have a .{} extension.",
            path.display(),
            extension
        )))
    }
}

pub fn created_or_modified(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

pub fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) async fn list_files_with_extension(
    directory: &Path,
    directory_name: &str,
    extension: &str,
) -> FleetResult<Vec<FileMetaData>> {
    let mut files = Vec::new();
    let mut dir = fs::read_dir(directory)
        .await
        .map_err(|e| FleetError::File(format!("Failed to read dir: {}", e)))?;

    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| FleetError::File(format!("Error reading dir entry: {}", e)))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }

        let metadata = entry
            .metadata()
            .await
            .map_err(|e| FleetError::File(format!("Failed to get metadata: {}", e)))?;
        if metadata.is_dir() {
            continue;
        }

        files.push(FileMetaData {
            name: entry.file_name().to_string_lossy().to_string(),
            directory: directory_name.to_string(),
            created_time: created_or_modified(&metadata),
            last_modified_time: modified_time(&metadata),
            size: metadata.len(),
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoggingConfig, PathsConfig, ServerConfig, WrapperConfig};

    fn manager_for(base_dir: &Path) -> FileManager {
        FileManager::new(&FleetConfig {
            paths: PathsConfig {
                base_dir: base_dir.to_path_buf(),
            },
            wrapper: WrapperConfig {
                executable: "/bin/true".into(),
                arguments: vec![],
                factorio_binary: "bin/x64/factorio".to_string(),
                signals_supported: true,
            },
            servers: vec![ServerConfig {
                id: "1".to_string(),
                port: 34197,
                max_log_files: 10,
            }],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        })
    }

    #[test]
    fn file_names_with_traversal_are_rejected() {
        assert!(sanitized_file_name("save.zip").is_ok());
        assert!(sanitized_file_name("../save.zip").is_err());
        assert!(sanitized_file_name("a/b.zip").is_err());
        assert!(sanitized_file_name("..").is_err());
        assert!(sanitized_file_name("").is_err());
    }

    #[tokio::test]
    async fn unknown_directory_name_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(tmp.path());

        assert!(matches!(
            manager.get_save_file("2/local_saves", "a.zip").await,
            Err(FleetError::InvalidDirectory(_))
        ));
        assert!(matches!(
            manager.get_save_file("../etc", "a.zip").await,
            Err(FleetError::InvalidDirectory(_))
        ));
    }

    #[tokio::test]
    async fn upload_rejects_spaces_duplicates_and_wrong_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(tmp.path());

        assert!(matches!(
            manager.upload_save(GLOBAL_SAVES_DIR, "my save.zip", b"x").await,
            Err(FleetError::InvalidFileName(_))
        ));
        assert!(matches!(
            manager.upload_save(GLOBAL_SAVES_DIR, "save.tar", b"x").await,
            Err(FleetError::InvalidFileName(_))
        ));

        manager
            .upload_save(GLOBAL_SAVES_DIR, "save.zip", b"x")
            .await
            .unwrap();
        assert!(matches!(
            manager.upload_save(GLOBAL_SAVES_DIR, "save.zip", b"y").await,
            Err(FleetError::FileAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn rename_appends_zip_and_refuses_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(tmp.path());

        manager
            .upload_save("1/local_saves", "old.zip", b"x")
            .await
            .unwrap();
        manager
            .rename_save("1/local_saves", "old.zip", "new")
            .await
            .unwrap();
        assert!(manager.get_save_file("1/local_saves", "new.zip").await.is_ok());

        manager
            .upload_save("1/local_saves", "other.zip", b"y")
            .await
            .unwrap();
        assert!(matches!(
            manager.rename_save("1/local_saves", "other.zip", "new.zip").await,
            Err(FleetError::FileAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn move_and_copy_between_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(tmp.path());

        manager
            .upload_save(GLOBAL_SAVES_DIR, "map.zip", b"x")
            .await
            .unwrap();
        manager
            .copy_save(GLOBAL_SAVES_DIR, "map.zip", "1/temp_saves")
            .await
            .unwrap();
        assert!(manager.get_save_file(GLOBAL_SAVES_DIR, "map.zip").await.is_ok());
        assert!(manager.get_save_file("1/temp_saves", "map.zip").await.is_ok());

        manager
            .move_save(GLOBAL_SAVES_DIR, "map.zip", "1/local_saves")
            .await
            .unwrap();
        assert!(manager.get_save_file(GLOBAL_SAVES_DIR, "map.zip").await.is_err());
        assert!(manager.get_save_file("1/local_saves", "map.zip").await.is_ok());
    }

    #[tokio::test]
    async fn scenario_lookup_requires_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(tmp.path());

        assert!(matches!(
            manager.scenario_path("scn1").await,
            Err(FleetError::MissingFile(_))
        ));
        assert!(manager.scenario_path("../scn1").await.is_err());

        tokio::fs::create_dir_all(tmp.path().join("scenarios/scn1"))
            .await
            .unwrap();
        assert!(manager.scenario_path("scn1").await.is_ok());
    }
}
