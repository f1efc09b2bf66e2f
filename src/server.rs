use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{PathsConfig, ServerConfig};
use crate::settings::FactorioServerSettings;

/// Oldest messages are dropped once the control buffer reaches this size.
pub const CONTROL_BUFFER_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactorioServerStatus {
    Unknown,
    WrapperStarting,
    WrapperStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Killing,
    Killed,
    Crashed,
    Updating,
    Updated,
}

impl FactorioServerStatus {
    /// States a server can be started (resume/load/scenario) from.
    pub fn is_startable(self) -> bool {
        matches!(
            self,
            FactorioServerStatus::Unknown
                | FactorioServerStatus::Stopped
                | FactorioServerStatus::Killed
                | FactorioServerStatus::Crashed
                | FactorioServerStatus::Updated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FactorioServerStatus::Unknown => "Unknown",
            FactorioServerStatus::WrapperStarting => "WrapperStarting",
            FactorioServerStatus::WrapperStarted => "WrapperStarted",
            FactorioServerStatus::Starting => "Starting",
            FactorioServerStatus::Running => "Running",
            FactorioServerStatus::Stopping => "Stopping",
            FactorioServerStatus::Stopped => "Stopped",
            FactorioServerStatus::Killing => "Killing",
            FactorioServerStatus::Killed => "Killed",
            FactorioServerStatus::Crashed => "Crashed",
            FactorioServerStatus::Updating => "Updating",
            FactorioServerStatus::Updated => "Updated",
        }
    }
}

impl fmt::Display for FactorioServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactorioServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(FactorioServerStatus::Unknown),
            "WrapperStarting" => Ok(FactorioServerStatus::WrapperStarting),
            "WrapperStarted" => Ok(FactorioServerStatus::WrapperStarted),
            "Starting" => Ok(FactorioServerStatus::Starting),
            "Running" => Ok(FactorioServerStatus::Running),
            "Stopping" => Ok(FactorioServerStatus::Stopping),
            "Stopped" => Ok(FactorioServerStatus::Stopped),
            "Killing" => Ok(FactorioServerStatus::Killing),
            "Killed" => Ok(FactorioServerStatus::Killed),
            "Crashed" => Ok(FactorioServerStatus::Crashed),
            "Updating" => Ok(FactorioServerStatus::Updating),
            "Updated" => Ok(FactorioServerStatus::Updated),
            other => Err(format!("Unknown server status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Status,
    Control,
    Discord,
    Output,
    Wrapper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub message_type: MessageType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageData {
    pub fn new(message_type: MessageType, message: impl Into<String>) -> Self {
        Self {
            message_type,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One-shot action stored on an entity, executed when the server later
/// reaches a stopped state. Taken and cleared under the entity lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredAction {
    StartScenario { scenario: String, user: String },
}

/// Mutable per-server state. Only ever touched while holding the entity's lock.
#[derive(Debug)]
pub struct ServerState {
    pub status: FactorioServerStatus,
    pub control_message_buffer: VecDeque<MessageData>,
    pub tracking_data_sets: HashSet<String>,
    pub stop_callback: Option<DeferredAction>,
    pub settings: Option<FactorioServerSettings>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            status: FactorioServerStatus::Unknown,
            control_message_buffer: VecDeque::new(),
            tracking_data_sets: HashSet::new(),
            stop_callback: None,
            settings: None,
        }
    }

    pub fn push_message(&mut self, message: MessageData) {
        if self.control_message_buffer.len() >= CONTROL_BUFFER_CAPACITY {
            self.control_message_buffer.pop_front();
        }
        self.control_message_buffer.push_back(message);
    }

    pub fn messages_snapshot(&self) -> Vec<MessageData> {
        self.control_message_buffer.iter().cloned().collect()
    }
}

/// One managed server slot. Entities are created once at startup from the
/// registry configuration and live for the application's lifetime.
#[derive(Debug)]
pub struct ServerEntity {
    pub server_id: String,
    pub port: u16,
    pub max_log_files: usize,
    pub base_dir: PathBuf,
    pub local_saves_dir: PathBuf,
    pub temp_saves_dir: PathBuf,
    pub local_scenario_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub current_log_path: PathBuf,
    pub settings_path: PathBuf,
    pub ban_list_path: PathBuf,
    lock: Mutex<ServerState>,
}

impl ServerEntity {
    pub fn new(config: &ServerConfig, paths: &PathsConfig) -> Self {
        let base_dir = paths.base_dir.join(&config.id);
        Self {
            server_id: config.id.clone(),
            port: config.port,
            max_log_files: config.max_log_files,
            local_saves_dir: base_dir.join(crate::files::LOCAL_SAVES_DIR),
            temp_saves_dir: base_dir.join(crate::files::TEMP_SAVES_DIR),
            local_scenario_dir: base_dir.join("scenarios"),
            logs_dir: base_dir.join("logs"),
            current_log_path: base_dir.join(crate::logs::CURRENT_LOG_NAME),
            settings_path: base_dir.join("server-settings.json"),
            ban_list_path: base_dir.join("banlist.json"),
            base_dir,
            lock: Mutex::new(ServerState::new()),
        }
    }

    pub async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, ServerState> {
        self.lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            FactorioServerStatus::Unknown,
            FactorioServerStatus::WrapperStarting,
            FactorioServerStatus::Running,
            FactorioServerStatus::Killed,
            FactorioServerStatus::Updated,
        ] {
            assert_eq!(status.as_str().parse::<FactorioServerStatus>(), Ok(status));
        }
        assert!("Resting".parse::<FactorioServerStatus>().is_err());
    }

    #[test]
    fn startable_states_match_guard_set() {
        let startable: Vec<_> = [
            FactorioServerStatus::Unknown,
            FactorioServerStatus::Stopped,
            FactorioServerStatus::Killed,
            FactorioServerStatus::Crashed,
            FactorioServerStatus::Updated,
        ]
        .into();

        for status in [
            FactorioServerStatus::Unknown,
            FactorioServerStatus::WrapperStarting,
            FactorioServerStatus::WrapperStarted,
            FactorioServerStatus::Starting,
            FactorioServerStatus::Running,
            FactorioServerStatus::Stopping,
            FactorioServerStatus::Stopped,
            FactorioServerStatus::Killing,
            FactorioServerStatus::Killed,
            FactorioServerStatus::Crashed,
            FactorioServerStatus::Updating,
            FactorioServerStatus::Updated,
        ] {
            assert_eq!(status.is_startable(), startable.contains(&status));
        }
    }

    #[test]
    fn control_buffer_drops_oldest_when_full() {
        let mut state = ServerState::new();
        for i in 0..CONTROL_BUFFER_CAPACITY + 10 {
            state.push_message(MessageData::new(MessageType::Output, format!("line {}", i)));
        }

        let messages = state.messages_snapshot();
        assert_eq!(messages.len(), CONTROL_BUFFER_CAPACITY);
        assert_eq!(messages[0].message, "line 10");
        assert_eq!(
            messages.last().unwrap().message,
            format!("line {}", CONTROL_BUFFER_CAPACITY + 9)
        );
    }
}
