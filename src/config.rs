use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    pub paths: PathsConfig,
    pub wrapper: WrapperConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    pub logging: LoggingConfig,
}

/// Filesystem roots shared by every server. Per-server directories live under
/// `base_dir/<server id>/`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    pub base_dir: PathBuf,
}

impl PathsConfig {
    pub fn scenario_dir(&self) -> PathBuf {
        self.base_dir.join("scenarios")
    }
}

/// How the wrapper process is invoked. The argument template is resolved once
/// from configuration instead of being branched per platform at compile time.
/// Recognized placeholders: `{serverId}`, `{basePath}`, `{binary}`,
/// `{startMode}`, `{settings}`, `{port}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WrapperConfig {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    /// Factorio binary location relative to a server's base directory.
    #[serde(default = "default_factorio_binary")]
    pub factorio_binary: String,
    /// Whether stop/install signals work on this host.
    #[serde(default = "default_true")]
    pub signals_supported: bool,
}

fn default_factorio_binary() -> String {
    "bin/x64/factorio".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub id: String,
    pub port: u16,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

fn default_max_log_files() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl FleetConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        let servers = std::env::var("FLEET_SERVERS")
            .map_err(|_| "FLEET_SERVERS not set".to_string())?
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(parse_server_entry)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            paths: PathsConfig {
                base_dir: PathBuf::from(
                    std::env::var("FLEET_BASE_DIR").unwrap_or_else(|_| "/factorio".to_string()),
                ),
            },
            wrapper: WrapperConfig {
                executable: PathBuf::from(
                    std::env::var("FLEET_WRAPPER").map_err(|_| "FLEET_WRAPPER not set".to_string())?,
                ),
                arguments: std::env::var("FLEET_WRAPPER_ARGS")
                    .map(|args| args.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_else(|_| default_wrapper_arguments()),
                factorio_binary: std::env::var("FLEET_FACTORIO_BINARY")
                    .unwrap_or_else(|_| default_factorio_binary()),
                signals_supported: true,
            },
            servers,
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            },
        })
    }
}

fn default_wrapper_arguments() -> Vec<String> {
    [
        "{serverId}",
        "{basePath}",
        "{binary}",
        "{startMode}",
        "--server-settings",
        "{settings}",
        "--port",
        "{port}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// "id:port" pairs, e.g. FLEET_SERVERS="1:34197,2:34198"
fn parse_server_entry(entry: &str) -> Result<ServerConfig, String> {
    let (id, port) = entry
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("Invalid FLEET_SERVERS entry: {}", entry))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("Invalid port in FLEET_SERVERS entry: {}", entry))?;

    Ok(ServerConfig {
        id: id.to_string(),
        port,
        max_log_files: default_max_log_files(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let toml = r#"
            [paths]
            base_dir = "/factorio"

            [wrapper]
            executable = "/factorio/wrapper"
            arguments = ["{serverId}", "{binary}", "{startMode}", "--port", "{port}"]

            [[servers]]
            id = "1"
            port = 34197

            [[servers]]
            id = "2"
            port = 34198
            max_log_files = 5

            [logging]
            level = "info"
            format = "json"
        "#;

        let config: FleetConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].max_log_files, 10);
        assert_eq!(config.servers[1].max_log_files, 5);
        assert!(config.wrapper.signals_supported);
        assert_eq!(config.wrapper.factorio_binary, "bin/x64/factorio");
        assert_eq!(config.paths.scenario_dir(), PathBuf::from("/factorio/scenarios"));
    }

    #[test]
    fn parses_server_env_entries() {
        let server = parse_server_entry("3:34199").unwrap();
        assert_eq!(server.id, "3");
        assert_eq!(server.port, 34199);

        assert!(parse_server_entry("bad").is_err());
        assert!(parse_server_entry("4:notaport").is_err());
    }
}
