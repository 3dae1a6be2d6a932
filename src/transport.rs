//! Chat transport contract.
//!
//! The hub only needs two primitives from a chat client: send a message
//! (optionally threaded under another one) and edit a message it sent.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::model::{ChatId, MessageId};

/// An inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    /// Opaque callback payload returned when the button is pressed.
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub reply_to: Option<MessageId>,
    pub buttons: Vec<Button>,
}

impl OutgoingMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
            buttons: Vec::new(),
        }
    }

    pub fn reply_to(mut self, message: MessageId) -> Self {
        self.reply_to = Some(message);
        self
    }

    pub fn buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }
}

/// Send/edit primitives of the chat system.
///
/// Implementations report network trouble as `Error::TransientUpstream` so
/// the engine can defer the event instead of dropping it.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, chat: ChatId, message: &OutgoingMessage) -> Result<MessageId>;

    async fn edit(&self, chat: ChatId, message: MessageId, update: &OutgoingMessage) -> Result<()>;
}

/// Dry-run transport: logs every message and hands out sequential ids.
#[derive(Debug)]
pub struct LogTransport {
    next_id: AtomicI64,
}

impl LogTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for LogTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for LogTransport {
    async fn send(&self, chat: ChatId, message: &OutgoingMessage) -> Result<MessageId> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            %chat,
            message_id = %id,
            reply_to = ?message.reply_to,
            buttons = message.buttons.len(),
            text = %message.text,
            "chat send"
        );
        Ok(id)
    }

    async fn edit(&self, chat: ChatId, message: MessageId, update: &OutgoingMessage) -> Result<()> {
        info!(%chat, message_id = %message, text = %update.text, "chat edit");
        Ok(())
    }
}
