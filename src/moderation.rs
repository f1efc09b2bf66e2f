//! Ban and regular-player propagation. A moderation action from the web, a
//! chat admin, or a game admin on one server is persisted to the shared store
//! and replayed on every other running server, so the fleet converges on one
//! ban list and one regular roster.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::channels::ProcessChannel;
use crate::commands::CommandBuilder;
use crate::dispatch::{parse_ban, parse_unban, SERVER_ADMIN_TOKEN};
use crate::errors::{FleetError, FleetResult};
use crate::registry::ServerRegistry;
use crate::server::{FactorioServerStatus, ServerEntity};
use crate::store::{Ban, ModerationStore, Regular};

/// Row format of Factorio's `banlist.json`.
#[derive(Debug, Serialize)]
struct BanListEntry<'a> {
    username: &'a str,
    reason: &'a str,
}

pub struct ModerationService {
    registry: Arc<ServerRegistry>,
    store: Arc<dyn ModerationStore>,
    process: Arc<dyn ProcessChannel>,
}

impl ModerationService {
    pub fn new(
        registry: Arc<ServerRegistry>,
        store: Arc<dyn ModerationStore>,
        process: Arc<dyn ProcessChannel>,
    ) -> Self {
        Self {
            registry,
            store,
            process,
        }
    }

    /// Persists the ban and replays `/ban` on every other running server.
    /// `source_server_id` is the server the ban originated on (`None` for
    /// web/chat sources); it already applied the ban locally.
    pub async fn ban_player(&self, source_server_id: Option<&str>, ban: Ban) -> FleetResult<()> {
        let command = format!("/ban {} {}", ban.username, ban.reason);
        info!(username = %ban.username, admin = %ban.admin, "Banning player");

        self.store
            .upsert_ban(ban)
            .await
            .map_err(|e| FleetError::Unexpected(format!("Error saving ban: {}", e)))?;

        self.fan_out(source_server_id, &command).await;
        Ok(())
    }

    pub async fn unban_player(
        &self,
        source_server_id: Option<&str>,
        username: &str,
    ) -> FleetResult<()> {
        info!(username = %username, "Unbanning player");

        self.store
            .remove_ban(username)
            .await
            .map_err(|e| FleetError::Unexpected(format!("Error removing ban: {}", e)))?;

        self.fan_out(source_server_id, &format!("/unban {}", username))
            .await;
        Ok(())
    }

    pub async fn promote_regular(
        &self,
        source_server_id: Option<&str>,
        name: &str,
        promoted_by: &str,
    ) -> FleetResult<()> {
        self.store
            .add_regular(Regular {
                name: name.to_string(),
                promoted_by: promoted_by.to_string(),
                date: Utc::now(),
            })
            .await
            .map_err(|e| FleetError::Unexpected(format!("Error saving regular: {}", e)))?;

        let command = CommandBuilder::server_command("regular_promote")
            .add_quoted(name)
            .build();
        self.fan_out(source_server_id, &command).await;
        Ok(())
    }

    pub async fn demote_regular(
        &self,
        source_server_id: Option<&str>,
        name: &str,
    ) -> FleetResult<()> {
        self.store
            .remove_regular(name)
            .await
            .map_err(|e| FleetError::Unexpected(format!("Error removing regular: {}", e)))?;

        let command = CommandBuilder::server_command("regular_demote")
            .add_quoted(name)
            .build();
        self.fan_out(source_server_id, &command).await;
        Ok(())
    }

    /// `[BAN]` handler. Bans whose admin is the server token were issued by
    /// this system and must not be re-applied.
    pub async fn handle_ban_tag(&self, server_id: &str, payload: &str) {
        let Some(event) = parse_ban(payload) else {
            warn!(server_id = %server_id, "Unparsable ban line: {}", payload);
            return;
        };
        if event.admin == SERVER_ADMIN_TOKEN {
            return;
        }

        let ban = Ban {
            username: event.username,
            reason: event.reason,
            admin: event.admin,
            date_time: Utc::now(),
        };
        if let Err(e) = self.ban_player(Some(server_id), ban).await {
            warn!(server_id = %server_id, "Error propagating ban: {}", e);
        }
    }

    /// `[UNBANNED]` handler, with the same server-token echo guard.
    pub async fn handle_unban_tag(&self, server_id: &str, payload: &str) {
        let Some(event) = parse_unban(payload) else {
            warn!(server_id = %server_id, "Unparsable unban line: {}", payload);
            return;
        };
        if event.admin == SERVER_ADMIN_TOKEN {
            return;
        }

        if let Err(e) = self.unban_player(Some(server_id), &event.username).await {
            warn!(server_id = %server_id, "Error propagating unban: {}", e);
        }
    }

    /// `[REGULAR-PROMOTE]` / `[REGULAR-DEMOTE]` handlers. The payload is the
    /// player name.
    pub async fn handle_promote_tag(&self, server_id: &str, payload: &str) {
        let name = payload.trim();
        if name.is_empty() {
            return;
        }
        let promoted_by = format!("server {}", server_id);
        if let Err(e) = self.promote_regular(Some(server_id), name, &promoted_by).await {
            warn!(server_id = %server_id, "Error propagating promotion: {}", e);
        }
    }

    pub async fn handle_demote_tag(&self, server_id: &str, payload: &str) {
        let name = payload.trim();
        if name.is_empty() {
            return;
        }
        if let Err(e) = self.demote_regular(Some(server_id), name).await {
            warn!(server_id = %server_id, "Error propagating demotion: {}", e);
        }
    }

    /// Intercepts `/ban` and `/unban` lines sent through the control channel.
    /// Returns `Some` when the line was handled as a moderation command; the
    /// caller must not forward it to the game verbatim. `source_server_id` is
    /// the console the line was typed into and is excluded from the replay.
    pub async fn handle_command_line(
        &self,
        source_server_id: Option<&str>,
        user: &str,
        line: &str,
    ) -> Option<FleetResult<()>> {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("/ban ") {
            let (username, reason) = match rest.split_once(' ') {
                Some((username, reason)) => (username, reason.trim()),
                None => (rest, "unspecified."),
            };
            let ban = Ban {
                username: username.to_string(),
                reason: reason.to_string(),
                admin: user.to_string(),
                date_time: Utc::now(),
            };
            return Some(self.ban_player(source_server_id, ban).await);
        }

        if let Some(rest) = trimmed.strip_prefix("/unban ") {
            return Some(self.unban_player(source_server_id, rest.trim()).await);
        }

        None
    }

    /// Writes the shared ban list as the server's `banlist.json` so a freshly
    /// started game enforces it from the first tick.
    pub async fn build_ban_list(&self, entity: &ServerEntity) -> FleetResult<()> {
        let bans = self
            .store
            .bans()
            .await
            .map_err(|e| FleetError::Unexpected(format!("Error fetching bans: {}", e)))?;

        let entries: Vec<BanListEntry<'_>> = bans
            .iter()
            .map(|ban| BanListEntry {
                username: &ban.username,
                reason: &ban.reason,
            })
            .collect();

        let data = serde_json::to_string_pretty(&entries)?;
        tokio::fs::write(&entity.ban_list_path, data)
            .await
            .map_err(|e| FleetError::File(format!("Error writing ban list: {}", e)))?;
        Ok(())
    }

    async fn fan_out(&self, source_server_id: Option<&str>, command: &str) {
        for entity in self.registry.iter() {
            if Some(entity.server_id.as_str()) == source_server_id {
                continue;
            }

            let running = {
                let state = entity.lock_state().await;
                state.status == FactorioServerStatus::Running
            };

            if running {
                self.process
                    .send_to_factorio(&entity.server_id, command)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FleetConfig, LoggingConfig, PathsConfig, ServerConfig, WrapperConfig};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingProcessChannel {
        sent: StdMutex<Vec<(String, String)>>,
    }

    impl RecordingProcessChannel {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessChannel for RecordingProcessChannel {
        async fn send_to_factorio(&self, server_id: &str, data: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((server_id.to_string(), data.to_string()));
        }
        async fn stop(&self, _server_id: &str) {}
        async fn force_stop(&self, _server_id: &str) {}
        async fn get_status(&self, _server_id: &str) {}
    }

    fn test_config(base_dir: std::path::PathBuf) -> FleetConfig {
        FleetConfig {
            paths: PathsConfig { base_dir },
            wrapper: WrapperConfig {
                executable: "/bin/true".into(),
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

    struct Fixture {
        registry: Arc<ServerRegistry>,
        store: Arc<MemoryStore>,
        process: Arc<RecordingProcessChannel>,
        service: ModerationService,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ServerRegistry::from_config(&test_config("/factorio".into())));
        let store = Arc::new(MemoryStore::new());
        let process = Arc::new(RecordingProcessChannel::default());
        let service = ModerationService::new(registry.clone(), store.clone(), process.clone());
        Fixture {
            registry,
            store,
            process,
            service,
        }
    }

    async fn mark_running(registry: &ServerRegistry, server_id: &str) {
        let entity = registry.get(server_id).unwrap();
        entity.lock_state().await.status = FactorioServerStatus::Running;
    }

    #[tokio::test]
    async fn ban_persists_and_replays_on_other_running_servers() {
        let f = fixture();
        mark_running(&f.registry, "1").await;
        mark_running(&f.registry, "2").await;

        f.service
            .handle_ban_tag("1", "Player1 was banned by admin1. Reason: grief.")
            .await;

        let bans = f.store.bans().await.unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].username, "player1");
        assert_eq!(bans[0].admin, "admin1.");

        let sent = f.process.sent();
        assert_eq!(sent, vec![("2".to_string(), "/ban Player1 grief.".to_string())]);
    }

    #[tokio::test]
    async fn server_issued_bans_are_not_reapplied() {
        let f = fixture();
        mark_running(&f.registry, "2").await;

        f.service
            .handle_ban_tag("1", "Player1 was banned by <server>. Reason: echo.")
            .await;

        assert!(f.store.bans().await.unwrap().is_empty());
        assert!(f.process.sent().is_empty());
    }

    #[tokio::test]
    async fn unban_removes_and_replays() {
        let f = fixture();
        mark_running(&f.registry, "2").await;
        f.store
            .upsert_ban(Ban {
                username: "player1".to_string(),
                reason: "grief.".to_string(),
                admin: "a".to_string(),
                date_time: Utc::now(),
            })
            .await
            .unwrap();

        f.service
            .handle_unban_tag("1", "Player1 was unbanned by admin1.")
            .await;

        assert!(f.store.bans().await.unwrap().is_empty());
        assert_eq!(
            f.process.sent(),
            vec![("2".to_string(), "/unban Player1".to_string())]
        );
    }

    #[tokio::test]
    async fn promote_and_demote_use_server_commands() {
        let f = fixture();
        mark_running(&f.registry, "2").await;

        f.service.handle_promote_tag("1", "grilledham").await;
        f.service.handle_demote_tag("1", "grilledham").await;

        let sent = f.process.sent();
        assert_eq!(sent[0].1, r#"/sc regular_promote("grilledham")"#);
        assert_eq!(sent[1].1, r#"/sc regular_demote("grilledham")"#);
        assert!(f.store.regulars().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn control_ban_command_replays_on_other_servers_only() {
        let f = fixture();
        mark_running(&f.registry, "1").await;
        mark_running(&f.registry, "2").await;

        let handled = f
            .service
            .handle_command_line(Some("1"), "admin1", "/ban player1 being rude")
            .await;
        assert!(matches!(handled, Some(Ok(()))));
        assert!(f
            .service
            .handle_command_line(Some("1"), "admin1", "/save mysave")
            .await
            .is_none());

        // The console the command was typed into is not replayed to.
        assert_eq!(
            f.process.sent(),
            vec![("2".to_string(), "/ban player1 being rude".to_string())]
        );

        let bans = f.store.bans().await.unwrap();
        assert_eq!(bans[0].admin, "admin1");
        assert_eq!(bans[0].reason, "being rude");
    }

    #[tokio::test]
    async fn ban_list_file_contains_current_bans() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::from_config(&test_config(
            tmp.path().to_path_buf(),
        )));
        let store = Arc::new(MemoryStore::new());
        let service = ModerationService::new(
            registry.clone(),
            store.clone(),
            Arc::new(RecordingProcessChannel::default()),
        );

        store
            .upsert_ban(Ban {
                username: "player1".to_string(),
                reason: "grief.".to_string(),
                admin: "a".to_string(),
                date_time: Utc::now(),
            })
            .await
            .unwrap();

        let entity = registry.get("1").unwrap();
        tokio::fs::create_dir_all(&entity.base_dir).await.unwrap();
        service.build_ban_list(&entity).await.unwrap();

        let content = tokio::fs::read_to_string(&entity.ban_list_path).await.unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_str(&content).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["username"], "player1");
        assert_eq!(rows[0]["reason"], "grief.");
    }
}
