//! Reply routing.
//!
//! A message the hub authored may carry a [`ReplyAction`]: a stable handler
//! name plus bound arguments. When a user replies to that message, the router
//! resolves the name to a registered [`ReplyHandler`] and hands it the reply
//! and the bound arguments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::job::JobId;
use crate::model::{ChatId, MessageId, MessageRecord, ReplyAction, UserId};

/// A file the user attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

/// A user's reply to one of the hub's messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingReply {
    pub chat: ChatId,
    pub user: UserId,
    /// The user's own message.
    pub message_id: MessageId,
    /// The hub message being replied to.
    pub reply_to: MessageId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

/// What a reply handler passes to its handler.
#[derive(Debug, Clone, Copy)]
pub struct ReplyContext<'a> {
    pub reply: &'a IncomingReply,
    pub record: &'a MessageRecord,
    pub action: &'a ReplyAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The external write happened; the confirmation is this chat message.
    Confirmed(MessageId),
    /// Handed to the job queue; the outcome will be reported in the chat.
    Queued(JobId),
    /// The external write failed for good; a notice was posted in the chat.
    Failed(String),
    /// Not a reply to a hub message, or the message has no reply action.
    Ignored,
}

#[async_trait]
pub trait ReplyHandler: Send + Sync {
    async fn handle(&self, ctx: ReplyContext<'_>) -> Result<ReplyOutcome>;
}

/// Stable handler name to reply handler.
#[derive(Default, Clone)]
pub struct ReplyRouter {
    handlers: HashMap<String, Arc<dyn ReplyHandler>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ReplyHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ReplyHandler>> {
        self.handlers.get(name)
    }
}
