//! Orchestration engine for a fleet of Factorio game servers.
//!
//! Each configured server gets one entity with its own state machine and
//! lock. The orchestrator starts wrapper processes, relays worker status and
//! output reports, dispatches tagged game output, and keeps scenario data,
//! bans, and regular rosters synchronized across the fleet through a shared
//! store.

pub mod channels;
pub mod commands;
pub mod config;
pub mod datasets;
pub mod dispatch;
pub mod errors;
pub mod files;
pub mod logs;
pub mod moderation;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod settings;
pub mod store;

pub use channels::{ChannelHub, ChatBridge, ControlChannel, ProcessChannel};
pub use config::FleetConfig;
pub use datasets::ScenarioDataSync;
pub use errors::{FleetError, FleetResult};
pub use files::FileManager;
pub use moderation::ModerationService;
pub use orchestrator::{ServerManager, StartMode};
pub use registry::ServerRegistry;
pub use server::{FactorioServerStatus, MessageData, MessageType};
pub use store::MemoryStore;
