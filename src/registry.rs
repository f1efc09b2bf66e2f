use std::collections::HashMap;
use std::sync::Arc;

use crate::config::FleetConfig;
use crate::errors::{FleetError, FleetResult};
use crate::server::ServerEntity;

/// Read-only catalog of managed servers, built once at startup. The
/// orchestrator only ever looks entities up by id; ids are never created or
/// destroyed at runtime.
pub struct ServerRegistry {
    servers: HashMap<String, Arc<ServerEntity>>,
}

impl ServerRegistry {
    pub fn from_config(config: &FleetConfig) -> Self {
        let servers = config
            .servers
            .iter()
            .map(|server| {
                (
                    server.id.clone(),
                    Arc::new(ServerEntity::new(server, &config.paths)),
                )
            })
            .collect();

        Self { servers }
    }

    pub fn get(&self, server_id: &str) -> FleetResult<Arc<ServerEntity>> {
        self.servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| FleetError::UnknownServerId(server_id.to_string()))
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerEntity>> {
        self.servers.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoggingConfig, PathsConfig, ServerConfig, WrapperConfig};

    fn test_config() -> FleetConfig {
        FleetConfig {
            paths: PathsConfig {
                base_dir: "/factorio".into(),
            },
            wrapper: WrapperConfig {
                executable: "/factorio/wrapper".into(),
                arguments: vec![],
                factorio_binary: "bin/x64/factorio".to_string(),
                signals_supported: true,
            },
            servers: vec![
                ServerConfig {
                    id: "1".to_string(),
                    port: 34197,
                    max_log_files: 10,
                },
                ServerConfig {
                    id: "2".to_string(),
                    port: 34198,
                    max_log_files: 10,
                },
            ],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }

    #[test]
    fn lookup_fails_for_unknown_id() {
        let registry = ServerRegistry::from_config(&test_config());
        assert!(registry.get("1").is_ok());
        assert!(matches!(
            registry.get("99"),
            Err(FleetError::UnknownServerId(id)) if id == "99"
        ));
    }

    #[test]
    fn entity_paths_derive_from_base_dir() {
        let registry = ServerRegistry::from_config(&test_config());
        let entity = registry.get("1").unwrap();
        assert_eq!(entity.base_dir, std::path::PathBuf::from("/factorio/1"));
        assert_eq!(
            entity.temp_saves_dir,
            std::path::PathBuf::from("/factorio/1/temp_saves")
        );
        assert_eq!(entity.port, 34197);
    }
}
