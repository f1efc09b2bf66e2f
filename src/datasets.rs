//! Cross-server scenario data synchronization. A change originating on one
//! server (or from the web) is persisted to the shared store and fanned out to
//! every other running server that tracks the dataset, one entity lock at a
//! time.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::channels::{ProcessChannel, ScenarioDataPublisher};
use crate::commands::CommandBuilder;
use crate::dispatch::split_callback;
use crate::errors::{FleetError, FleetResult};
use crate::registry::ServerRegistry;
use crate::server::FactorioServerStatus;
use crate::store::{ScenarioDataEntry, ScenarioStore, StoreError, StoreResult};

/// Optimistic writes are retried this many times before the change is dropped.
pub const PERSIST_RETRY_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct DataGetRequest {
    data_set: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct DataGetAllRequest {
    data_set: String,
}

pub struct ScenarioDataSync {
    registry: Arc<ServerRegistry>,
    store: Arc<dyn ScenarioStore>,
    process: Arc<dyn ProcessChannel>,
    publisher: Arc<dyn ScenarioDataPublisher>,
}

impl ScenarioDataSync {
    pub fn new(
        registry: Arc<ServerRegistry>,
        store: Arc<dyn ScenarioStore>,
        process: Arc<dyn ProcessChannel>,
        publisher: Arc<dyn ScenarioDataPublisher>,
    ) -> Self {
        Self {
            registry,
            store,
            publisher,
            process,
        }
    }

    /// Applies a dataset change: persist, fan out to tracking servers, notify
    /// web observers. `source_server_id` is excluded from the fan-out so a
    /// server never receives its own change back.
    pub async fn set_data(&self, entry: ScenarioDataEntry, source_server_id: Option<&str>) {
        self.persist(&entry).await;
        self.fan_out(&entry, source_server_id).await;
        self.publisher.send_entry(&entry.data_set, &entry).await;
    }

    /// Versioned write with refetch-and-retry on conflict. `value: None`
    /// deletes the row; deleting an absent row is a no-op. After
    /// `PERSIST_RETRY_LIMIT` failed attempts the change is logged and dropped,
    /// the running servers having already converged among themselves.
    async fn persist(&self, entry: &ScenarioDataEntry) {
        for _ in 0..PERSIST_RETRY_LIMIT {
            let current = match self.store.fetch(&entry.data_set, &entry.key).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(
                        data_set = %entry.data_set, key = %entry.key,
                        "Error fetching scenario data: {}", e
                    );
                    return;
                }
            };

            let result: StoreResult<()> = match (&entry.value, current) {
                (Some(value), Some((_, version))) => {
                    self.store
                        .update(&entry.data_set, &entry.key, value, version)
                        .await
                }
                (Some(value), None) => self.store.insert(&entry.data_set, &entry.key, value).await,
                (None, Some((_, version))) => {
                    self.store.delete(&entry.data_set, &entry.key, version).await
                }
                (None, None) => return,
            };

            match result {
                Ok(()) => return,
                Err(StoreError::Conflict) | Err(StoreError::UniqueViolation) => continue,
                Err(e) => {
                    warn!(
                        data_set = %entry.data_set, key = %entry.key,
                        "Error saving scenario data: {}", e
                    );
                    return;
                }
            }
        }

        warn!(
            data_set = %entry.data_set, key = %entry.key,
            "Scenario data dropped after {} conflicting write attempts",
            PERSIST_RETRY_LIMIT
        );
    }

    async fn fan_out(&self, entry: &ScenarioDataEntry, source_server_id: Option<&str>) {
        let command = data_set_command(entry);

        for entity in self.registry.iter() {
            if Some(entity.server_id.as_str()) == source_server_id {
                continue;
            }

            // One lock at a time; release before sending to the next server.
            let tracking = {
                let state = entity.lock_state().await;
                state.status == FactorioServerStatus::Running
                    && state.tracking_data_sets.contains(&entry.data_set)
            };

            if tracking {
                self.process
                    .send_to_factorio(&entity.server_id, &command)
                    .await;
            }
        }
    }

    pub async fn get_data(&self, data_set: &str, key: &str) -> FleetResult<Option<String>> {
        self.store
            .fetch(data_set, key)
            .await
            .map(|row| row.map(|(value, _)| value))
            .map_err(|e| FleetError::Unexpected(format!("Error fetching scenario data: {}", e)))
    }

    pub async fn get_all_data(&self, data_set: &str) -> FleetResult<Vec<ScenarioDataEntry>> {
        self.store
            .entries(data_set)
            .await
            .map_err(|e| FleetError::Unexpected(format!("Error fetching scenario data: {}", e)))
    }

    pub async fn get_data_sets(&self) -> FleetResult<Vec<String>> {
        self.store
            .data_sets()
            .await
            .map_err(|e| FleetError::Unexpected(format!("Error fetching data sets: {}", e)))
    }

    /// `[DATA-SET]` handler: the payload is a JSON entry emitted by the game.
    pub async fn handle_data_set(&self, server_id: &str, payload: &str) {
        match serde_json::from_str::<ScenarioDataEntry>(payload) {
            Ok(entry) => self.set_data(entry, Some(server_id)).await,
            Err(e) => {
                warn!(server_id = %server_id, "Malformed data-set payload: {}", e);
            }
        }
    }

    /// `[DATA-GET]` handler: `<callback token> <json request>`. The response
    /// goes back to the requesting server only; a missing key responds with
    /// the value field absent so the scenario callback still fires.
    pub async fn handle_data_get(&self, server_id: &str, payload: &str) {
        let Some((callback, request)) = split_callback(payload) else {
            warn!(server_id = %server_id, "Malformed data-get payload: {}", payload);
            return;
        };
        let request: DataGetRequest = match serde_json::from_str(request) {
            Ok(request) => request,
            Err(e) => {
                warn!(server_id = %server_id, "Malformed data-get payload: {}", e);
                return;
            }
        };

        let value = match self.store.fetch(&request.data_set, &request.key).await {
            Ok(row) => row.map(|(value, _)| value),
            Err(e) => {
                warn!(
                    data_set = %request.data_set, key = %request.key,
                    "Error fetching scenario data: {}", e
                );
                return;
            }
        };

        let entry = ScenarioDataEntry {
            data_set: request.data_set,
            key: request.key,
            value,
        };
        let command = callback_command(callback, |builder| append_entry_table(builder, &entry));
        self.process.send_to_factorio(server_id, &command).await;
    }

    /// `[DATA-GET-ALL]` handler: `<callback token> <json request>`. Responds
    /// with the dataset as a key-indexed table; stored values are Lua
    /// literals and are emitted raw. An empty dataset omits the entries
    /// field entirely.
    pub async fn handle_data_get_all(&self, server_id: &str, payload: &str) {
        let Some((callback, request)) = split_callback(payload) else {
            warn!(server_id = %server_id, "Malformed data-get-all payload: {}", payload);
            return;
        };
        let request: DataGetAllRequest = match serde_json::from_str(request) {
            Ok(request) => request,
            Err(e) => {
                warn!(server_id = %server_id, "Malformed data-get-all payload: {}", e);
                return;
            }
        };

        let entries = match self.store.entries(&request.data_set).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(data_set = %request.data_set, "Error fetching scenario data: {}", e);
                return;
            }
        };

        let command = callback_command(callback, |mut builder| {
            builder = builder.add("{data_set=").add_quoted(&request.data_set);
            if entries.is_empty() {
                return builder.add("}");
            }
            builder = builder.add(",entries={");
            for entry in &entries {
                builder = builder
                    .add("[")
                    .add_quoted(&entry.key)
                    .add("]=")
                    .add(entry.value.as_deref().unwrap_or("nil"))
                    .add(",");
            }
            builder.remove_last(1).add("}}")
        });
        self.process.send_to_factorio(server_id, &command).await;
    }

    /// `[DATA-TRACKED]` handler: the payload is a JSON array of dataset names
    /// that replaces the server's tracking set. Emitted by the scenario when
    /// it starts, in response to `get_tracked_data_sets`.
    pub async fn handle_data_tracked(&self, server_id: &str, payload: &str) {
        let data_sets: Vec<String> = match serde_json::from_str(payload) {
            Ok(data_sets) => data_sets,
            Err(e) => {
                warn!(server_id = %server_id, "Malformed data-tracked payload: {}", e);
                return;
            }
        };

        if let Ok(entity) = self.registry.get(server_id) {
            let mut state = entity.lock_state().await;
            state.tracking_data_sets = data_sets.into_iter().collect();
            debug!(
                server_id = %server_id,
                "Tracking {} dataset(s)", state.tracking_data_sets.len()
            );
        }
    }
}

fn callback_command(
    callback: &str,
    append: impl FnOnce(CommandBuilder) -> CommandBuilder,
) -> String {
    let builder = CommandBuilder::server_command("raise_callback")
        .add(callback)
        .add(",");
    append(builder).build()
}

/// `/sc raise_data_set({data_set=...,key=...[,value=...]})`; a missing value
/// tells the receiving scenario to remove the key.
pub fn data_set_command(entry: &ScenarioDataEntry) -> String {
    let builder = CommandBuilder::server_command("raise_data_set");
    append_entry_table(builder, entry).build()
}

fn append_entry_table(mut builder: CommandBuilder, entry: &ScenarioDataEntry) -> CommandBuilder {
    builder = builder
        .add("{data_set=")
        .add_quoted(&entry.data_set)
        .add(",key=")
        .add_quoted(&entry.key);
    if let Some(value) = &entry.value {
        builder = builder.add(",value=").add_quoted(value);
    }
    builder.add("}")
}
