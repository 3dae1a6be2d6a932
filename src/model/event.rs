//! Canonical events: what a service adapter turns a raw webhook into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EventId;
use crate::flags::NotificationFlag;

/// A normalized external event, independent of the provider's wire schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Service namespace, e.g. "trello" or "gitlab".
    pub service: String,

    /// Provider id of this action. Scope of duplicate-delivery suppression.
    pub action_id: String,

    /// Action type, e.g. "card.created", "comment.created", "card.updated".
    pub kind: String,

    /// Event id of the entity this action targets, e.g. `card_1`.
    pub entity: EventId,

    pub actor: Option<String>,

    pub occurred_at: DateTime<Utc>,

    /// Entity fields after the action.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Entity fields before the action, for "something changed" payloads.
    #[serde(default)]
    pub old: Option<serde_json::Value>,

    /// Notification filter category, if the event can be muted.
    #[serde(default)]
    pub category: Option<NotificationFlag>,

    #[serde(default)]
    pub priority: EventPriority,
}

impl CanonicalEvent {
    pub fn new(
        service: impl Into<String>,
        action_id: impl Into<String>,
        kind: impl Into<String>,
        entity: EventId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            service: service.into(),
            action_id: action_id.into(),
            kind: kind.into(),
            entity,
            actor: None,
            occurred_at,
            payload: serde_json::Value::Null,
            old: None,
            category: None,
            priority: EventPriority::Normal,
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn old(mut self, old: serde_json::Value) -> Self {
        self.old = Some(old);
        self
    }

    pub fn category(mut self, flag: NotificationFlag) -> Self {
        self.category = Some(flag);
        self
    }

    pub fn low_priority(mut self) -> Self {
        self.priority = EventPriority::Low;
        self
    }

    /// The event id of the action itself.
    pub fn action_event_id(&self) -> EventId {
        EventId::action(&self.action_id)
    }

    /// Cache key of the dedup record for this action.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.service, &self.action_id)
    }

    /// A field of the post-action payload as a string.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(|v| v.as_str())
    }
}

/// How much losing this event matters when the event index is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Risk a duplicate message rather than drop the delivery.
    Low,
    #[default]
    Normal,
}

/// Chat-scope cache key that marks `action_id` on `service` as already seen.
/// Written by the sync engine on delivery and by outbound jobs for the
/// actions the hub itself performs.
pub fn dedup_key(service: &str, action_id: &str) -> String {
    format!("action_{service}:{action_id}")
}
