use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, info};

use factorio_fleet::channels::{ChannelHub, LoggingChatBridge, NullScenarioDataPublisher};
use factorio_fleet::datasets::ScenarioDataSync;
use factorio_fleet::errors::{FleetError, FleetResult};
use factorio_fleet::files::FileManager;
use factorio_fleet::moderation::ModerationService;
use factorio_fleet::orchestrator::ServerManager;
use factorio_fleet::registry::ServerRegistry;
use factorio_fleet::store::MemoryStore;
use factorio_fleet::FleetConfig;

/// Fleet engine - main application state
struct FleetApp {
    manager: Arc<ServerManager>,
    registry: Arc<ServerRegistry>,
}

impl FleetApp {
    fn new(config: &FleetConfig) -> Self {
        info!("Initializing fleet engine");

        let registry = Arc::new(ServerRegistry::from_config(config));
        let files = Arc::new(FileManager::new(config));
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(ChannelHub::new());

        let moderation = Arc::new(ModerationService::new(
            registry.clone(),
            store.clone(),
            hub.clone(),
        ));
        let datasets = Arc::new(ScenarioDataSync::new(
            registry.clone(),
            store.clone(),
            hub.clone(),
            Arc::new(NullScenarioDataPublisher),
        ));
        let manager = Arc::new(ServerManager::new(
            registry.clone(),
            files,
            moderation,
            datasets,
            hub.clone(),
            hub,
            Arc::new(LoggingChatBridge),
            config.wrapper.clone(),
        ));

        Self { manager, registry }
    }

    async fn run(self: Arc<Self>) -> FleetResult<()> {
        info!(
            "Managing {} server(s): {:?}",
            self.registry.len(),
            self.registry.ids()
        );

        let app = self.clone();
        let http_task = tokio::spawn(async move {
            if let Err(e) = app.start_http_server().await {
                error!("HTTP server error: {}", e);
            }
        });

        tokio::select! {
            _ = http_task => {},
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
        }

        Ok(())
    }

    async fn start_http_server(self: Arc<Self>) -> FleetResult<()> {
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/servers", get(servers_handler))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
        info!("Local HTTP server listening on 127.0.0.1:8080");

        axum::serve(listener, router)
            .await
            .map_err(|e| FleetError::Unexpected(e.to_string()))
    }
}

async fn servers_handler(State(app): State<Arc<FleetApp>>) -> Json<serde_json::Value> {
    let mut servers = Vec::new();
    for id in app.registry.ids() {
        let status = app
            .manager
            .get_status(&id)
            .await
            .map(|status| status.to_string())
            .unwrap_or_else(|_| "Unknown".to_string());
        servers.push(serde_json::json!({ "id": id, "status": status }));
    }
    Json(serde_json::json!({ "servers": servers }))
}

#[tokio::main]
async fn main() -> FleetResult<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = FleetConfig::from_file(config_path)
        .or_else(|_| FleetConfig::from_file("/etc/factorio-fleet/config.toml"))
        .or_else(|_| FleetConfig::from_env())
        .map_err(FleetError::Config)?;

    let filter = format!("factorio_fleet={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Factorio fleet engine starting");
    info!("Configuration loaded: {:?}", config);

    let app = Arc::new(FleetApp::new(&config));
    app.run().await?;

    Ok(())
}
