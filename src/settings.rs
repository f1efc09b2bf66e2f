use serde::{Deserialize, Serialize};

use crate::errors::{FleetError, FleetResult};
use crate::server::ServerEntity;

/// The subset of Factorio's `server-settings.json` the web layer can edit.
/// Cached on the entity after first load and written back on change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct FactorioServerSettings {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub max_players: u32,
    pub game_password: String,
    pub auto_pause: bool,
    pub admins: Vec<String>,
}

impl Default for FactorioServerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            tags: Vec::new(),
            max_players: 0,
            game_password: String::new(),
            auto_pause: true,
            admins: Vec::new(),
        }
    }
}

impl FactorioServerSettings {
    pub fn default_for(server_id: &str) -> Self {
        Self {
            name: format!("Factorio server {}", server_id),
            description: format!("Managed Factorio server {}", server_id),
            ..Self::default()
        }
    }

    /// Reads the settings file for `entity`, creating it with defaults when
    /// missing. Caller must hold the entity lock; the cached copy lives in
    /// `ServerState::settings`.
    pub async fn load_or_create(entity: &ServerEntity) -> FleetResult<Self> {
        match tokio::fs::read_to_string(&entity.settings_path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(FleetError::from)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default_for(&entity.server_id);
                settings.write_to_disk(entity).await?;
                Ok(settings)
            }
            Err(err) => Err(FleetError::File(format!(
                "Failed to read server settings: {}",
                err
            ))),
        }
    }

    pub async fn write_to_disk(&self, entity: &ServerEntity) -> FleetResult<()> {
        let data = serde_json::to_string_pretty(self)?;
        if let Some(parent) = entity.settings_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FleetError::File(format!("Failed to create dir: {}", e)))?;
        }
        tokio::fs::write(&entity.settings_path, data)
            .await
            .map_err(|e| FleetError::File(format!("Failed to write server settings: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_serialize_with_snake_case_keys() {
        let settings = FactorioServerSettings::default_for("1");
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"max_players\""));
        assert!(json.contains("\"auto_pause\""));
        assert!(json.contains("Factorio server 1"));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: FactorioServerSettings =
            serde_json::from_str(r#"{"name": "s2"}"#).unwrap();
        assert_eq!(settings.name, "s2");
        assert!(settings.auto_pause);
        assert_eq!(settings.max_players, 0);
    }
}
