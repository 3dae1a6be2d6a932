//! Core data model.
//!
//! Identifiers, the record of every chat message the hub authored, and the
//! serializable reply action bound to it. Jobs and canonical events live in
//! the submodules.

pub mod event;
pub mod job;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::Button;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A chat (conversation) on the chat transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message id, assigned by the chat transport and unique within a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespaced key tying one external entity or action to a chat message.
///
/// Unique only within one chat's event space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `action_<id>`: one external action (comment, update, ...).
    pub fn action(id: impl std::fmt::Display) -> Self {
        Self(format!("action_{id}"))
    }

    /// `issue_<id>`
    pub fn issue(id: impl std::fmt::Display) -> Self {
        Self(format!("issue_{id}"))
    }

    /// `card_<id>`
    pub fn card(id: impl std::fmt::Display) -> Self {
        Self(format!("card_{id}"))
    }

    /// `note_<project>_<note>`
    pub fn note(project: impl std::fmt::Display, note: impl std::fmt::Display) -> Self {
        Self(format!("note_{project}_{note}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Message Record
// ---------------------------------------------------------------------------

/// One chat message authored by the hub.
///
/// Created by the sync engine at send time. `event_ids` is ordered by the
/// time each id was attached and only ever grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub chat: ChatId,
    pub message_id: MessageId,
    pub event_ids: Vec<EventId>,
    /// Current rendered text, kept so later events can amend it.
    pub text: String,
    /// Message this one is threaded under, if any.
    pub reply_to: Option<MessageId>,
    /// What to do when a user replies to this message.
    pub reply_action: Option<ReplyAction>,
    /// Inline keyboard currently attached; edits that rewrite the text keep it.
    pub buttons: Vec<Button>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(chat: ChatId, message_id: MessageId, text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            chat,
            message_id,
            event_ids: Vec::new(),
            text: text.into(),
            reply_to: None,
            reply_action: None,
            buttons: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this message was authored less than `window` before `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        now.signed_duration_since(self.created_at) < crate::clock::to_chrono(window)
    }

    /// Add event ids not already present, preserving order.
    pub fn tag(&mut self, ids: impl IntoIterator<Item = EventId>) {
        for id in ids {
            if !self.event_ids.contains(&id) {
                self.event_ids.push(id);
            }
        }
    }
}

/// A serializable closure: a stable handler name plus bound arguments.
///
/// Resolved through the reply router when a user replies to the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyAction {
    pub handler: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ReplyAction {
    pub fn new(handler: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            handler: handler.into(),
            args,
        }
    }
}
