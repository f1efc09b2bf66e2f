use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;

use crate::server::{FactorioServerStatus, MessageData};
use crate::store::ScenarioDataEntry;

/// Commands delivered to a server's wrapper process group.
#[async_trait]
pub trait ProcessChannel: Send + Sync {
    async fn send_to_factorio(&self, server_id: &str, data: &str);
    async fn stop(&self, server_id: &str);
    async fn force_stop(&self, server_id: &str);
    async fn get_status(&self, server_id: &str);
}

/// Events delivered to a server's web observer group.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send_message(&self, server_id: &str, message: &MessageData);
    async fn status_changed(
        &self,
        server_id: &str,
        new_status: FactorioServerStatus,
        old_status: FactorioServerStatus,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedColor {
    Info,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEmbed {
    pub description: String,
    pub color: EmbedColor,
}

impl ChatEmbed {
    pub fn info(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            color: EmbedColor::Info,
        }
    }

    pub fn success(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            color: EmbedColor::Success,
        }
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            color: EmbedColor::Failure,
        }
    }
}

/// Outbound side of the chat-bridge contract. The bridge's own command
/// parsing and platform client are external.
#[async_trait]
pub trait ChatBridge: Send + Sync {
    async fn send_to_server_channel(&self, server_id: &str, text: &str);
    async fn send_embed_to_server_channel(&self, server_id: &str, embed: ChatEmbed);
    async fn send_to_admin_channel(&self, text: &str);
    async fn send_embed_to_admin_channel(&self, embed: ChatEmbed);
}

/// Dataset change notifications for web observers, grouped by dataset name.
#[async_trait]
pub trait ScenarioDataPublisher: Send + Sync {
    async fn send_entry(&self, data_set: &str, entry: &ScenarioDataEntry);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessSignal {
    Data(String),
    Stop,
    ForceStop,
    GetStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Message(MessageData),
    StatusChanged {
        new_status: FactorioServerStatus,
        old_status: FactorioServerStatus,
    },
}

const HUB_CHANNEL_CAPACITY: usize = 256;

/// Broadcast-based implementation of the process and control destinations.
/// One sender pair per server id, created on first use; sends with no
/// subscribers are dropped silently, matching group semantics.
#[derive(Default)]
pub struct ChannelHub {
    process: DashMap<String, broadcast::Sender<ProcessSignal>>,
    control: DashMap<String, broadcast::Sender<ControlEvent>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_process(&self, server_id: &str) -> broadcast::Receiver<ProcessSignal> {
        self.process
            .entry(server_id.to_string())
            .or_insert_with(|| broadcast::channel(HUB_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_control(&self, server_id: &str) -> broadcast::Receiver<ControlEvent> {
        self.control
            .entry(server_id.to_string())
            .or_insert_with(|| broadcast::channel(HUB_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn send_process(&self, server_id: &str, signal: ProcessSignal) {
        if let Some(sender) = self.process.get(server_id) {
            let _ = sender.send(signal);
        }
    }

    fn send_control(&self, server_id: &str, event: ControlEvent) {
        if let Some(sender) = self.control.get(server_id) {
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl ProcessChannel for ChannelHub {
    async fn send_to_factorio(&self, server_id: &str, data: &str) {
        self.send_process(server_id, ProcessSignal::Data(data.to_string()));
    }

    async fn stop(&self, server_id: &str) {
        self.send_process(server_id, ProcessSignal::Stop);
    }

    async fn force_stop(&self, server_id: &str) {
        self.send_process(server_id, ProcessSignal::ForceStop);
    }

    async fn get_status(&self, server_id: &str) {
        self.send_process(server_id, ProcessSignal::GetStatus);
    }
}

#[async_trait]
impl ControlChannel for ChannelHub {
    async fn send_message(&self, server_id: &str, message: &MessageData) {
        self.send_control(server_id, ControlEvent::Message(message.clone()));
    }

    async fn status_changed(
        &self,
        server_id: &str,
        new_status: FactorioServerStatus,
        old_status: FactorioServerStatus,
    ) {
        self.send_control(
            server_id,
            ControlEvent::StatusChanged {
                new_status,
                old_status,
            },
        );
    }
}

/// Chat bridge that only logs. Used when no bridge is connected.
pub struct LoggingChatBridge;

#[async_trait]
impl ChatBridge for LoggingChatBridge {
    async fn send_to_server_channel(&self, server_id: &str, text: &str) {
        info!("[chat:{}] {}", server_id, text);
    }

    async fn send_embed_to_server_channel(&self, server_id: &str, embed: ChatEmbed) {
        info!("[chat:{}] embed: {}", server_id, embed.description);
    }

    async fn send_to_admin_channel(&self, text: &str) {
        info!("[chat:admin] {}", text);
    }

    async fn send_embed_to_admin_channel(&self, embed: ChatEmbed) {
        info!("[chat:admin] embed: {}", embed.description);
    }
}

/// Scenario data publisher that drops notifications. Used when no web
/// observers are connected.
pub struct NullScenarioDataPublisher;

#[async_trait]
impl ScenarioDataPublisher for NullScenarioDataPublisher {
    async fn send_entry(&self, _data_set: &str, _entry: &ScenarioDataEntry) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MessageType;

    #[tokio::test]
    async fn hub_delivers_to_subscribers_of_the_same_server_only() {
        let hub = ChannelHub::new();
        let mut rx1 = hub.subscribe_process("1");
        let mut rx2 = hub.subscribe_process("2");

        hub.send_to_factorio("1", "/sc server_started()").await;
        hub.stop("2").await;

        assert_eq!(
            rx1.recv().await.unwrap(),
            ProcessSignal::Data("/sc server_started()".to_string())
        );
        assert_eq!(rx2.recv().await.unwrap(), ProcessSignal::Stop);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn hub_send_without_subscribers_is_dropped() {
        let hub = ChannelHub::new();
        // No subscription exists; must not panic or block.
        hub.force_stop("1").await;
        let message = MessageData::new(MessageType::Control, "hello");
        hub.send_message("1", &message).await;
    }
}
