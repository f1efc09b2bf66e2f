//! The orchestrator: per-server lifecycle operations, worker status/output
//! handling, and the exhaustive routing of tagged output lines. All state
//! transitions happen under the owning entity's lock; the lock is never held
//! across another entity's lock.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::channels::{ChatBridge, ChatEmbed, ControlChannel, ProcessChannel};
use crate::commands::CommandBuilder;
use crate::config::WrapperConfig;
use crate::datasets::ScenarioDataSync;
use crate::dispatch::{
    parse_line, sanitize_chat, sanitize_game_chat, split_callback, OutputTag, SERVER_USERNAME,
};
use crate::errors::{FleetError, FleetResult};
use crate::files::{FileManager, SAVE_EXTENSION};
use crate::logs::LogRotator;
use crate::moderation::ModerationService;
use crate::registry::ServerRegistry;
use crate::server::{
    DeferredAction, FactorioServerStatus, MessageData, MessageType, ServerEntity, ServerState,
};
use crate::settings::FactorioServerSettings;

/// How the game process is told to obtain its map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    ResumeLatest,
    LoadFile(PathBuf),
    LoadScenario(String),
}

impl StartMode {
    fn arguments(&self) -> Vec<String> {
        match self {
            StartMode::ResumeLatest => vec!["--start-server-load-latest".to_string()],
            StartMode::LoadFile(path) => vec![
                "--start-server".to_string(),
                path.to_string_lossy().to_string(),
            ],
            StartMode::LoadScenario(name) => vec![
                "--start-server-load-scenario".to_string(),
                name.clone(),
            ],
        }
    }
}

pub struct ServerManager {
    registry: Arc<ServerRegistry>,
    files: Arc<FileManager>,
    moderation: Arc<ModerationService>,
    datasets: Arc<ScenarioDataSync>,
    process: Arc<dyn ProcessChannel>,
    control: Arc<dyn ControlChannel>,
    chat: Arc<dyn ChatBridge>,
    wrapper: WrapperConfig,
}

impl ServerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ServerRegistry>,
        files: Arc<FileManager>,
        moderation: Arc<ModerationService>,
        datasets: Arc<ScenarioDataSync>,
        process: Arc<dyn ProcessChannel>,
        control: Arc<dyn ControlChannel>,
        chat: Arc<dyn ChatBridge>,
        wrapper: WrapperConfig,
    ) -> Self {
        Self {
            registry,
            files,
            moderation,
            datasets,
            process,
            control,
            chat,
            wrapper,
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Resumes the latest temp save. Requires at least one save to resume.
    pub async fn resume(&self, server_id: &str, user: &str) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;

        self.guard_startable(&state)?;
        if !has_save_file(&entity.temp_saves_dir).await {
            return Err(FleetError::MissingFile(
                "No saves to resume server from.".to_string(),
            ));
        }

        self.prepare_server(&entity, &mut state).await?;
        self.spawn_wrapper(&entity, &StartMode::ResumeLatest)?;
        self.change_status_locked(&entity, &mut state, FactorioServerStatus::WrapperStarting)
            .await;
        self.send_control_message_locked(
            &entity,
            &mut state,
            MessageType::Control,
            format!("Server resumed by user: {}", user),
        )
        .await;
        Ok(())
    }

    /// Starts from a named save file. Saves outside the server's temp
    /// directory are copied into it first, so the running game only ever
    /// writes temp saves.
    pub async fn load(
        &self,
        server_id: &str,
        directory_name: &str,
        file_name: &str,
        user: &str,
    ) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;

        self.guard_startable(&state)?;
        let source = self.files.get_save_file(directory_name, file_name).await?;

        self.prepare_server(&entity, &mut state).await?;

        let target = entity.temp_saves_dir.join(
            source
                .file_name()
                .ok_or_else(|| FleetError::InvalidFileName(file_name.to_string()))?,
        );
        // The source path is canonical; the target may not exist yet.
        let already_in_temp = match fs::canonicalize(&target).await {
            Ok(canonical) => canonical == source,
            Err(_) => false,
        };
        if !already_in_temp {
            fs::copy(&source, &target)
                .await
                .map_err(|e| FleetError::File(format!("Error copying save: {}", e)))?;
        }

        self.spawn_wrapper(&entity, &StartMode::LoadFile(target))?;
        self.change_status_locked(&entity, &mut state, FactorioServerStatus::WrapperStarting)
            .await;
        self.send_control_message_locked(
            &entity,
            &mut state,
            MessageType::Control,
            format!("Server load file: {} by user: {}", file_name, user),
        )
        .await;
        Ok(())
    }

    /// Starts a named scenario from the shared scenario root.
    pub async fn start_scenario(&self, server_id: &str, scenario: &str, user: &str) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;
        self.start_scenario_inner(&entity, &mut state, scenario, user)
            .await
    }

    /// Like `start_scenario`, but a running server is stopped first and the
    /// scenario start is deferred until the stop is reported.
    pub async fn force_start_scenario(
        &self,
        server_id: &str,
        scenario: &str,
        user: &str,
    ) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;

        if state.status.is_startable() {
            return self
                .start_scenario_inner(&entity, &mut state, scenario, user)
                .await;
        }

        if state.status == FactorioServerStatus::Running {
            self.files.scenario_path(scenario).await?;
            state.stop_callback = Some(DeferredAction::StartScenario {
                scenario: scenario.to_string(),
                user: user.to_string(),
            });
            self.send_control_message_locked(
                &entity,
                &mut state,
                MessageType::Control,
                format!("Server restarting to scenario: {} by user: {}", scenario, user),
            )
            .await;
            drop(state);
            self.process.stop(server_id).await;
            return Ok(());
        }

        Err(FleetError::InvalidServerState(format!(
            "Cannot force start scenario when in state {}",
            state.status
        )))
    }

    /// Runs while the caller already holds the entity lock, so the deferred
    /// continuation in `status_changed` can reuse it without relocking.
    async fn start_scenario_inner(
        &self,
        entity: &ServerEntity,
        state: &mut ServerState,
        scenario: &str,
        user: &str,
    ) -> FleetResult<()> {
        self.guard_startable(state)?;
        self.files.scenario_path(scenario).await?;

        self.prepare_server(entity, state).await?;
        self.spawn_wrapper(entity, &StartMode::LoadScenario(scenario.to_string()))?;
        self.change_status_locked(entity, state, FactorioServerStatus::WrapperStarting)
            .await;
        self.send_control_message_locked(
            entity,
            state,
            MessageType::Control,
            format!("Server load scenario: {} by user: {}", scenario, user),
        )
        .await;
        Ok(())
    }

    /// Graceful stop. Clears any pending deferred action; the status
    /// transition arrives asynchronously from the worker.
    pub async fn stop(&self, server_id: &str, user: &str) -> FleetResult<()> {
        if !self.wrapper.signals_supported {
            return Err(FleetError::NotSupported(
                "Stopping a server is not supported on this host.".to_string(),
            ));
        }

        let entity = self.registry.get(server_id)?;
        {
            let mut state = entity.lock_state().await;
            match state.status {
                FactorioServerStatus::Unknown
                | FactorioServerStatus::WrapperStarted
                | FactorioServerStatus::Starting
                | FactorioServerStatus::Running
                | FactorioServerStatus::Updated => {}
                other => {
                    return Err(FleetError::InvalidServerState(format!(
                        "Cannot stop server when in state {}",
                        other
                    )));
                }
            }

            state.stop_callback = None;
            self.send_control_message_locked(
                &entity,
                &mut state,
                MessageType::Control,
                format!("Server stopped by user: {}", user),
            )
            .await;
        }

        self.process.stop(server_id).await;
        Ok(())
    }

    /// Kill. The force-stop signal is always sent; the `Killing`/`Killed`
    /// transitions arrive asynchronously from the worker, except from
    /// `WrapperStarting`, where no worker has attached yet and `Killed` is
    /// applied immediately.
    pub async fn force_stop(&self, server_id: &str, user: &str) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        {
            let mut state = entity.lock_state().await;

            match state.status {
                FactorioServerStatus::Stopped
                | FactorioServerStatus::Killed
                | FactorioServerStatus::Crashed
                | FactorioServerStatus::Updating => {
                    return Err(FleetError::InvalidServerState(format!(
                        "Cannot force stop server when in state {}",
                        state.status
                    )));
                }
                FactorioServerStatus::WrapperStarting => {
                    self.change_status_locked(&entity, &mut state, FactorioServerStatus::Killed)
                        .await;
                }
                _ => {}
            }

            state.stop_callback = None;
            self.send_control_message_locked(
                &entity,
                &mut state,
                MessageType::Control,
                format!("Server killed by user: {}", user),
            )
            .await;
        }

        self.process.force_stop(server_id).await;
        Ok(())
    }

    /// In-game save, running servers only. No state change.
    pub async fn save(&self, server_id: &str, user: &str, save_name: &str) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        {
            let state = entity.lock_state().await;
            if state.status != FactorioServerStatus::Running {
                return Err(FleetError::InvalidServerState(format!(
                    "Cannot save game when in state {}",
                    state.status
                )));
            }
        }

        let command = CommandBuilder::silent_command()
            .add("game.server_save(")
            .add_quoted(save_name)
            .add(")")
            .build();
        self.process.send_to_factorio(server_id, &command).await;
        info!(server_id = %server_id, user = %user, "Game save requested: {}", save_name);
        Ok(())
    }

    /// Downloads and installs a Factorio version. The transition to
    /// `Updating` is synchronous; download, extraction, and the final
    /// `Updated`/`Crashed` transition run in a detached task.
    pub async fn install(
        self: &Arc<Self>,
        server_id: &str,
        user: &str,
        version: &str,
    ) -> FleetResult<()> {
        if !self.wrapper.signals_supported {
            return Err(FleetError::NotSupported(
                "Installing is not supported on this host.".to_string(),
            ));
        }

        let entity = self.registry.get(server_id)?;
        {
            let mut state = entity.lock_state().await;
            if !state.status.is_startable() {
                return Err(FleetError::InvalidServerState(format!(
                    "Cannot install version when in state {}",
                    state.status
                )));
            }

            self.change_status_locked(&entity, &mut state, FactorioServerStatus::Updating)
                .await;
            self.send_control_message_locked(
                &entity,
                &mut state,
                MessageType::Control,
                format!("Server updating to version: {} by user: {}", version, user),
            )
            .await;
        }

        let manager = Arc::clone(self);
        let version = version.to_string();
        tokio::spawn(async move {
            let result = manager.run_install(&entity, &version).await;
            let mut state = entity.lock_state().await;
            match result {
                Ok(()) => {
                    manager
                        .change_status_locked(&entity, &mut state, FactorioServerStatus::Updated)
                        .await;
                    manager
                        .send_control_message_locked(
                            &entity,
                            &mut state,
                            MessageType::Control,
                            format!("Server updated to version: {}", version),
                        )
                        .await;
                }
                Err(e) => {
                    error!(server_id = %entity.server_id, "Install failed: {}", e);
                    manager
                        .change_status_locked(&entity, &mut state, FactorioServerStatus::Crashed)
                        .await;
                    manager
                        .send_control_message_locked(
                            &entity,
                            &mut state,
                            MessageType::Control,
                            format!("Error updating server: {}", e),
                        )
                        .await;
                }
            }
        });
        Ok(())
    }

    async fn run_install(&self, entity: &ServerEntity, version: &str) -> FleetResult<()> {
        let url = format!(
            "https://factorio.com/get-download/{}/headless/linux64",
            version
        );
        let response = reqwest::get(&url)
            .await
            .map_err(|e| FleetError::Update(format!("Download failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(FleetError::Update(format!(
                "Download failed with status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FleetError::Update(format!("Download failed: {}", e)))?;

        fs::create_dir_all(&entity.base_dir)
            .await
            .map_err(|e| FleetError::File(format!("Failed to create dir: {}", e)))?;
        let archive = entity.base_dir.join(format!("factorio-{}.tar.xz", version));
        fs::write(&archive, &bytes)
            .await
            .map_err(|e| FleetError::Update(format!("Error writing archive: {}", e)))?;

        let status = Command::new("tar")
            .arg("-xf")
            .arg(&archive)
            .arg("-C")
            .arg(&entity.base_dir)
            .arg("--strip-components=1")
            .status()
            .await
            .map_err(|e| FleetError::Update(format!("Error extracting archive: {}", e)))?;
        let _ = fs::remove_file(&archive).await;
        if !status.success() {
            return Err(FleetError::Update(format!(
                "Archive extraction exited with {}",
                status
            )));
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Status and messaging
    // ------------------------------------------------------------------

    pub async fn get_status(&self, server_id: &str) -> FleetResult<FactorioServerStatus> {
        let entity = self.registry.get(server_id)?;
        let state = entity.lock_state().await;
        Ok(state.status)
    }

    /// Asks the worker to re-report its status.
    pub async fn request_status(&self, server_id: &str) -> FleetResult<()> {
        self.registry.get(server_id)?;
        self.process.get_status(server_id).await;
        Ok(())
    }

    /// Sends a console line to the game. `/ban` and `/unban` lines are
    /// handled as fleet-wide moderation commands instead of being forwarded
    /// verbatim.
    pub async fn send_to_process(&self, server_id: &str, user: &str, data: &str) -> FleetResult<()> {
        self.registry.get(server_id)?;

        if let Some(result) = self
            .moderation
            .handle_command_line(Some(server_id), user, data)
            .await
        {
            return result;
        }

        self.process.send_to_factorio(server_id, data).await;
        Ok(())
    }

    /// Appends a message to the server's control buffer and broadcasts it.
    pub async fn send_to_control(
        &self,
        server_id: &str,
        message_type: MessageType,
        text: &str,
    ) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;
        self.send_control_message_locked(&entity, &mut state, message_type, text.to_string())
            .await;
        Ok(())
    }

    pub async fn get_control_messages(&self, server_id: &str) -> FleetResult<Vec<MessageData>> {
        let entity = self.registry.get(server_id)?;
        let state = entity.lock_state().await;
        Ok(state.messages_snapshot())
    }

    /// Worker status report. Records the transition and runs the per-edge
    /// side effects, including the deferred scenario start on stop. A report
    /// that carries no transition is ignored, so a worker re-announcing its
    /// current status cannot replay the edge's side effects.
    pub async fn status_changed(
        &self,
        server_id: &str,
        new_status: FactorioServerStatus,
        old_status: FactorioServerStatus,
    ) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        if new_status == old_status {
            return Ok(());
        }
        let mut state = entity.lock_state().await;
        self.change_status_locked(&entity, &mut state, new_status).await;

        match (old_status, new_status) {
            (FactorioServerStatus::Starting, FactorioServerStatus::Running) => {
                self.chat
                    .send_embed_to_server_channel(server_id, ChatEmbed::success("Server has started."))
                    .await;
                self.process
                    .send_to_factorio(
                        server_id,
                        &CommandBuilder::server_command("server_started").build(),
                    )
                    .await;
                self.process
                    .send_to_factorio(
                        server_id,
                        &CommandBuilder::server_command("get_tracked_data_sets").build(),
                    )
                    .await;
            }
            (_, FactorioServerStatus::Running) => {
                self.process
                    .send_to_factorio(
                        server_id,
                        &CommandBuilder::server_command("get_tracked_data_sets").build(),
                    )
                    .await;
            }
            (FactorioServerStatus::Stopping, FactorioServerStatus::Stopped)
            | (FactorioServerStatus::Killing, FactorioServerStatus::Killed) => {
                self.chat
                    .send_embed_to_server_channel(server_id, ChatEmbed::info("Server has stopped."))
                    .await;

                if let Some(DeferredAction::StartScenario { scenario, user }) =
                    state.stop_callback.take()
                {
                    if let Err(e) = self
                        .start_scenario_inner(&entity, &mut state, &scenario, &user)
                        .await
                    {
                        error!(
                            server_id = %server_id,
                            "Deferred scenario start failed: {}", e
                        );
                    }
                }
            }
            (_, FactorioServerStatus::Crashed) => {
                self.chat
                    .send_embed_to_server_channel(server_id, ChatEmbed::failure("Server has crashed."))
                    .await;
            }
            _ => {}
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Output handling
    // ------------------------------------------------------------------

    /// A line of game output. Every line is archived; tagged lines are
    /// additionally dispatched. Handler failures are logged, never propagated.
    pub async fn process_output(&self, server_id: &str, line: &str) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        {
            let mut state = entity.lock_state().await;
            self.send_control_message_locked(
                &entity,
                &mut state,
                MessageType::Output,
                line.to_string(),
            )
            .await;
        }

        let Some((tag, payload)) = parse_line(line) else {
            return Ok(());
        };

        match tag {
            OutputTag::Chat => {
                self.chat
                    .send_to_server_channel(server_id, &sanitize_chat(payload))
                    .await;
            }
            OutputTag::Discord => {
                let text = unescape_newlines(payload);
                self.chat
                    .send_to_server_channel(server_id, &sanitize_chat(&text))
                    .await;
            }
            OutputTag::DiscordRaw => {
                self.chat
                    .send_to_server_channel(server_id, &unescape_newlines(payload))
                    .await;
            }
            OutputTag::DiscordBold => {
                let text = sanitize_chat(&unescape_newlines(payload));
                self.chat
                    .send_to_server_channel(server_id, &format!("**{}**", text))
                    .await;
            }
            OutputTag::DiscordAdmin => {
                let text = unescape_newlines(payload);
                self.chat
                    .send_to_admin_channel(&sanitize_chat(&text))
                    .await;
            }
            OutputTag::DiscordAdminRaw => {
                self.chat
                    .send_to_admin_channel(&unescape_newlines(payload))
                    .await;
            }
            OutputTag::DiscordEmbed => {
                let text = sanitize_chat(&unescape_newlines(payload));
                self.chat
                    .send_embed_to_server_channel(server_id, ChatEmbed::info(text))
                    .await;
            }
            OutputTag::DiscordEmbedRaw => {
                self.chat
                    .send_embed_to_server_channel(
                        server_id,
                        ChatEmbed::info(unescape_newlines(payload)),
                    )
                    .await;
            }
            OutputTag::DiscordAdminEmbed => {
                let text = sanitize_chat(&unescape_newlines(payload));
                self.chat
                    .send_embed_to_admin_channel(ChatEmbed::info(text))
                    .await;
            }
            OutputTag::DiscordAdminEmbedRaw => {
                self.chat
                    .send_embed_to_admin_channel(ChatEmbed::info(unescape_newlines(payload)))
                    .await;
            }
            OutputTag::Join | OutputTag::Leave => {
                self.chat
                    .send_to_server_channel(
                        server_id,
                        &format!("**{}**", sanitize_chat(payload)),
                    )
                    .await;
            }
            OutputTag::RegularPromote => {
                self.moderation.handle_promote_tag(server_id, payload).await;
            }
            OutputTag::RegularDemote => {
                self.moderation.handle_demote_tag(server_id, payload).await;
            }
            OutputTag::StartScenario => {
                let scenario = payload.trim();
                if let Err(e) = self
                    .force_start_scenario(server_id, scenario, SERVER_USERNAME)
                    .await
                {
                    warn!(server_id = %server_id, "Scenario start from game failed: {}", e);
                    let text = sanitize_game_chat(&format!(
                        "Error starting scenario {}: {}",
                        scenario, e
                    ));
                    let command = CommandBuilder::silent_command()
                        .add(&format!("game.print('{}')", text))
                        .build();
                    self.process.send_to_factorio(server_id, &command).await;
                }
            }
            OutputTag::Ban => {
                self.moderation.handle_ban_tag(server_id, payload).await;
            }
            OutputTag::Unbanned => {
                self.moderation.handle_unban_tag(server_id, payload).await;
            }
            OutputTag::Ping => {
                if let Some((callback, rest)) = split_callback(payload) {
                    let command = CommandBuilder::server_command("raise_callback")
                        .add(callback)
                        .add(",")
                        .add(rest)
                        .build();
                    self.process.send_to_factorio(server_id, &command).await;
                }
            }
            OutputTag::DataSet => {
                self.datasets.handle_data_set(server_id, payload).await;
            }
            OutputTag::DataGet => {
                self.datasets.handle_data_get(server_id, payload).await;
            }
            OutputTag::DataGetAll => {
                self.datasets.handle_data_get_all(server_id, payload).await;
            }
            OutputTag::DataTracked => {
                self.datasets.handle_data_tracked(server_id, payload).await;
            }
        }

        Ok(())
    }

    /// A line from the wrapper itself, archived only.
    pub async fn wrapper_output(&self, server_id: &str, line: &str) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;
        self.send_control_message_locked(&entity, &mut state, MessageType::Wrapper, line.to_string())
            .await;
        Ok(())
    }

    /// Chat arriving from the bridge, relayed into the game and archived.
    pub async fn chat_received(&self, server_id: &str, user: &str, message: &str) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;

        let text = sanitize_game_chat(&format!("[Discord] {}: {}", user, message));
        let command = CommandBuilder::silent_command()
            .add(&format!("game.print('{}')", text))
            .build();
        self.process.send_to_factorio(server_id, &command).await;

        let mut state = entity.lock_state().await;
        self.send_control_message_locked(
            &entity,
            &mut state,
            MessageType::Discord,
            format!("{}: {}", user, message),
        )
        .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_editable_settings(&self, server_id: &str) -> FleetResult<FactorioServerSettings> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;

        if let Some(settings) = &state.settings {
            return Ok(settings.clone());
        }

        let settings = FactorioServerSettings::load_or_create(&entity).await?;
        state.settings = Some(settings.clone());
        Ok(settings)
    }

    pub async fn save_editable_settings(
        &self,
        server_id: &str,
        settings: FactorioServerSettings,
    ) -> FleetResult<()> {
        let entity = self.registry.get(server_id)?;
        let mut state = entity.lock_state().await;

        settings.write_to_disk(&entity).await?;
        state.settings = Some(settings);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn guard_startable(&self, state: &ServerState) -> FleetResult<()> {
        if state.status.is_startable() {
            Ok(())
        } else {
            Err(FleetError::InvalidServerState(format!(
                "Cannot start server when in state {}",
                state.status
            )))
        }
    }

    /// Pre-start work: directories, ban list, tracking reset, log rotation,
    /// settings cache. Runs under the entity lock.
    async fn prepare_server(
        &self,
        entity: &ServerEntity,
        state: &mut ServerState,
    ) -> FleetResult<()> {
        for dir in [
            &entity.base_dir,
            &entity.temp_saves_dir,
            &entity.local_saves_dir,
            &entity.local_scenario_dir,
        ] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| FleetError::File(format!("Failed to create dir: {}", e)))?;
        }

        state.tracking_data_sets.clear();
        self.moderation.build_ban_list(entity).await?;
        LogRotator::rotate(entity).await?;

        let settings = FactorioServerSettings::load_or_create(entity).await?;
        state.settings = Some(settings);
        Ok(())
    }

    fn spawn_wrapper(&self, entity: &ServerEntity, start_mode: &StartMode) -> FleetResult<()> {
        let arguments = self.resolve_arguments(entity, start_mode);
        let child = Command::new(&self.wrapper.executable)
            .args(&arguments)
            .spawn()
            .map_err(|e| {
                FleetError::WrapperProcess(format!(
                    "Failed to spawn wrapper {:?}: {}",
                    self.wrapper.executable, e
                ))
            })?;

        info!(
            server_id = %entity.server_id,
            pid = ?child.id(),
            "Wrapper spawned: {:?} {:?}", self.wrapper.executable, arguments
        );
        Ok(())
    }

    fn resolve_arguments(&self, entity: &ServerEntity, start_mode: &StartMode) -> Vec<String> {
        let binary = entity.base_dir.join(&self.wrapper.factorio_binary);
        let mut arguments = Vec::with_capacity(self.wrapper.arguments.len() + 1);

        for token in &self.wrapper.arguments {
            if token == "{startMode}" {
                arguments.extend(start_mode.arguments());
                continue;
            }
            arguments.push(
                token
                    .replace("{serverId}", &entity.server_id)
                    .replace("{basePath}", &entity.base_dir.to_string_lossy())
                    .replace("{binary}", &binary.to_string_lossy())
                    .replace("{settings}", &entity.settings_path.to_string_lossy())
                    .replace("{port}", &entity.port.to_string()),
            );
        }

        arguments
    }

    async fn change_status_locked(
        &self,
        entity: &ServerEntity,
        state: &mut ServerState,
        new_status: FactorioServerStatus,
    ) {
        let old_status = state.status;
        state.status = new_status;
        self.control
            .status_changed(&entity.server_id, new_status, old_status)
            .await;

        if new_status != old_status {
            let message = MessageData::new(MessageType::Status, new_status.as_str());
            state.push_message(message.clone());
            self.control.send_message(&entity.server_id, &message).await;
        }
    }

    async fn send_control_message_locked(
        &self,
        entity: &ServerEntity,
        state: &mut ServerState,
        message_type: MessageType,
        text: String,
    ) {
        let message = MessageData::new(message_type, text);
        state.push_message(message.clone());
        self.control.send_message(&entity.server_id, &message).await;
    }
}

fn unescape_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
}

async fn has_save_file(directory: &std::path::Path) -> bool {
    let Ok(mut dir) = fs::read_dir(directory).await else {
        return false;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        if entry.path().extension().and_then(|e| e.to_str()) == Some(SAVE_EXTENSION) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_mode_arguments_match_the_game_cli() {
        assert_eq!(
            StartMode::ResumeLatest.arguments(),
            vec!["--start-server-load-latest"]
        );
        assert_eq!(
            StartMode::LoadFile("/factorio/1/temp_saves/map.zip".into()).arguments(),
            vec!["--start-server", "/factorio/1/temp_saves/map.zip"]
        );
        assert_eq!(
            StartMode::LoadScenario("my_scenario".to_string()).arguments(),
            vec!["--start-server-load-scenario", "my_scenario"]
        );
    }

    #[test]
    fn newline_escapes_are_expanded() {
        assert_eq!(unescape_newlines("a\\nb"), "a\nb");
        assert_eq!(unescape_newlines("plain"), "plain");
    }
}
