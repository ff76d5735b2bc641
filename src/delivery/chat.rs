//! Chat platform seam.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use super::render::OutboundMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The platform rejected the message as too large (embed size limit).
    #[error("message exceeds the platform size limit")]
    SizeLimitExceeded,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("platform error: {0}")]
    Platform(String),
}

/// Operations the delivery pipeline needs from a chat platform. Message ids
/// are opaque strings handed back by `send`/`reply`.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn channel_exists(&self, channel_id: &str) -> bool;

    async fn send(&self, channel_id: &str, message: &OutboundMessage) -> Result<String, DeliveryError>;

    async fn reply(
        &self,
        channel_id: &str,
        parent_message_id: &str,
        message: &OutboundMessage,
    ) -> Result<String, DeliveryError>;

    async fn edit(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError>;

    /// Avatar of a guild member, if the platform knows one.
    async fn member_avatar_url(&self, user_id: &str) -> Option<String>;
}

/// Prints every outbound action as one JSON line on stdout. Used by `replay`
/// and for dry runs; message ids are a local counter.
#[derive(Debug, Default)]
pub struct ConsoleChat {
    next_id: AtomicU64,
}

impl ConsoleChat {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, action: &str, channel_id: &str, message_id: &str, parent: Option<&str>, message: &OutboundMessage) {
        let line = serde_json::json!({
            "action": action,
            "channel": channel_id,
            "messageId": message_id,
            "parent": parent,
            "message": message,
        });
        println!("{}", line);
    }

    fn allocate(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[async_trait]
impl ChatClient for ConsoleChat {
    async fn channel_exists(&self, _channel_id: &str) -> bool {
        true
    }

    async fn send(&self, channel_id: &str, message: &OutboundMessage) -> Result<String, DeliveryError> {
        let id = self.allocate();
        self.emit("send", channel_id, &id, None, message);
        Ok(id)
    }

    async fn reply(
        &self,
        channel_id: &str,
        parent_message_id: &str,
        message: &OutboundMessage,
    ) -> Result<String, DeliveryError> {
        let id = self.allocate();
        self.emit("reply", channel_id, &id, Some(parent_message_id), message);
        Ok(id)
    }

    async fn edit(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        self.emit("edit", channel_id, message_id, None, message);
        Ok(())
    }

    async fn member_avatar_url(&self, _user_id: &str) -> Option<String> {
        None
    }
}
