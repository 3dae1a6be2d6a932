//! Service adapters: provider payload in, canonical event and rendering out.
//!
//! An adapter owns the provider-specific rules: how a raw webhook body maps to
//! a [`CanonicalEvent`] and whether an event edits the entity's message or
//! becomes a follow-up notification. The engine owns everything else.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::engine::diff::ChangeCause;
use crate::error::{Error, Result};
use crate::flags::NotificationFlag;
use crate::model::event::{CanonicalEvent, EventPriority};
use crate::model::{EventId, MessageRecord, ReplyAction};
use crate::transport::Button;

/// Reply handler bound to messages about an entity: replies become comments.
pub const COMMENT_REPLY: &str = "comment";

/// Everything an adapter may look at when rendering.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub event: &'a CanonicalEvent,
    /// The entity's message in this chat, if there is one.
    pub existing: Option<&'a MessageRecord>,
    /// Highest-priority change for update events.
    pub cause: Option<ChangeCause>,
    /// Full entity, when the adapter asked for it and the event was thin.
    pub entity: Option<&'a Value>,
}

/// A message body plus what to bind to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub text: String,
    pub buttons: Vec<Button>,
    pub reply_action: Option<ReplyAction>,
    /// Event ids to tag the message with besides the entity and action ids.
    pub extra_ids: Vec<EventId>,
}

impl Draft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
            reply_action: None,
            extra_ids: Vec::new(),
        }
    }

    pub fn reply_action(mut self, action: ReplyAction) -> Self {
        self.reply_action = Some(action);
        self
    }

    pub fn button(mut self, button: Button) -> Self {
        self.buttons.push(button);
        self
    }

    pub fn tag(mut self, id: EventId) -> Self {
        self.extra_ids.push(id);
        self
    }
}

/// How an event shows up in the chat.
#[derive(Debug, Clone, PartialEq)]
pub enum Rendering {
    /// Nothing worth showing.
    Skip,
    /// Replace the entity message's text, or create it if it does not exist yet.
    Amend(Draft),
    /// A notification about the entity: threaded under its message, or folded
    /// into that message while it is still fresh.
    FollowUp(Draft),
}

pub trait ServiceAdapter: Send + Sync {
    /// Service namespace, as used in webhook URLs and dedup keys.
    fn namespace(&self) -> &str;

    /// `Ok(None)` for deliveries the hub does not care about (pings, unknown
    /// actions). Unparseable bodies are `Error::MalformedPayload`.
    fn parse(&self, raw: &[u8]) -> Result<Option<CanonicalEvent>>;

    /// Whether `render` needs the full entity fetched from the service.
    fn needs_entity(&self, _event: &CanonicalEvent) -> bool {
        false
    }

    fn render(&self, ctx: RenderContext<'_>) -> Rendering;
}

// ---------------------------------------------------------------------------
// Generic adapter
// ---------------------------------------------------------------------------

/// Adapter for senders that already post canonical JSON:
///
/// ```json
/// {
///   "action_id": "55",
///   "kind": "comment.created",
///   "entity": "card_1",
///   "actor": "ann",
///   "occurred_at": "2024-05-01T10:00:00Z",
///   "payload": { "name": "Fix login", "text": "on it" },
///   "old": null,
///   "priority": "normal"
/// }
/// ```
#[derive(Debug, Clone)]
pub struct GenericAdapter {
    namespace: String,
}

#[derive(Debug, Deserialize)]
struct GenericBody {
    action_id: Value,
    kind: String,
    entity: String,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    old: Option<Value>,
    #[serde(default)]
    category: Option<NotificationFlag>,
    #[serde(default)]
    priority: EventPriority,
}

impl GenericAdapter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn title<'a>(ctx: &RenderContext<'a>) -> &'a str {
        let from = |v: Option<&'a Value>| {
            v.and_then(|v| v.get("name").or_else(|| v.get("title")))
                .and_then(Value::as_str)
        };
        from(ctx.entity)
            .or_else(|| from(Some(&ctx.event.payload)))
            .unwrap_or_else(|| ctx.event.entity.as_str())
    }

    /// Full entity card: title plus the state fields that edits flip.
    fn entity_text(ctx: &RenderContext<'_>) -> String {
        let fields = ctx.entity.unwrap_or(&ctx.event.payload);
        let mut text = Self::title(ctx).to_string();
        if let Some(list) = fields.get("list").and_then(Value::as_str) {
            text.push_str(&format!("\nlist: {list}"));
        }
        if let Some(due) = fields.get("due").and_then(Value::as_str) {
            text.push_str(&format!("\ndue: {due}"));
        }
        let archived = ["archived", "closed"]
            .iter()
            .any(|f| fields.get(*f).and_then(Value::as_bool).unwrap_or(false));
        if archived {
            text.push_str("\n[archived]");
        }
        if let Some(desc) = fields.get("description").and_then(Value::as_str) {
            text.push_str(&format!("\n\n{desc}"));
        }
        text
    }

    fn actor<'a>(ctx: &RenderContext<'a>) -> &'a str {
        ctx.event.actor.as_deref().unwrap_or("someone")
    }

    fn comment_action(&self, ctx: &RenderContext<'_>) -> ReplyAction {
        ReplyAction::new(
            COMMENT_REPLY,
            json!({ "service": self.namespace, "target": ctx.event.entity.as_str() }),
        )
    }
}

impl ServiceAdapter for GenericAdapter {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn parse(&self, raw: &[u8]) -> Result<Option<CanonicalEvent>> {
        let body: GenericBody =
            serde_json::from_slice(raw).map_err(|e| Error::MalformedPayload(e.to_string()))?;
        if body.kind == "ping" {
            return Ok(None);
        }
        let action_id = match body.action_id {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(Error::MalformedPayload(format!("unusable action_id: {other}")));
            }
        };
        if body.entity.is_empty() {
            return Err(Error::MalformedPayload("empty entity".to_string()));
        }

        let mut event = CanonicalEvent::new(
            &self.namespace,
            action_id,
            body.kind,
            EventId::new(body.entity),
            body.occurred_at.unwrap_or_else(Utc::now),
        )
        .payload(body.payload);
        event.actor = body.actor;
        event.old = body.old.filter(|o| !o.is_null());
        event.category = body.category;
        event.priority = body.priority;
        if event.category.is_none() && event.kind.starts_with("comment.") {
            event.category = Some(NotificationFlag::Comments);
        }
        Ok(Some(event))
    }

    /// Thin update webhooks carry no fields; re-fetch the entity to render it.
    fn needs_entity(&self, event: &CanonicalEvent) -> bool {
        event.kind.ends_with(".updated")
            && event.payload.as_object().is_none_or(|fields| fields.is_empty())
    }

    fn render(&self, ctx: RenderContext<'_>) -> Rendering {
        let kind = ctx.event.kind.as_str();
        let actor = Self::actor(&ctx);

        if kind.starts_with("comment.") {
            let Some(text) = ctx.event.field("text") else {
                return Rendering::Skip;
            };
            return Rendering::FollowUp(
                Draft::new(format!("{actor} commented: {text}")).reply_action(self.comment_action(&ctx)),
            );
        }

        if kind.ends_with(".created") {
            return Rendering::Amend(
                Draft::new(format!("{actor} created {}", Self::entity_text(&ctx)))
                    .reply_action(self.comment_action(&ctx)),
            );
        }

        if kind.ends_with(".updated") {
            let Some(cause) = ctx.cause else {
                // No recognizable change: refresh the message if there is one.
                return match ctx.existing {
                    Some(_) if ctx.entity.is_some() => Rendering::Amend(Draft::new(Self::entity_text(&ctx))),
                    _ => Rendering::Skip,
                };
            };
            let title = Self::title(&ctx);
            let after = |field: &str| {
                ctx.entity
                    .unwrap_or(&ctx.event.payload)
                    .get(field)
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_else(|| "none".to_string())
            };
            return match cause {
                // State flips edit the entity message in place.
                ChangeCause::ArchiveToggled | ChangeCause::DueChanged => {
                    Rendering::Amend(Draft::new(Self::entity_text(&ctx)))
                }
                ChangeCause::Moved => {
                    Rendering::FollowUp(Draft::new(format!("{actor} moved {title} to {}", after("list"))))
                }
                ChangeCause::Renamed => {
                    let old = ctx
                        .event
                        .old
                        .as_ref()
                        .and_then(|o| o.get("name").or_else(|| o.get("title")))
                        .and_then(Value::as_str)
                        .unwrap_or("?");
                    Rendering::FollowUp(Draft::new(format!("{actor} renamed {old} to {title}")))
                }
                ChangeCause::DescriptionChanged => Rendering::FollowUp(Draft::new(format!(
                    "{actor} changed the description of {title}"
                ))),
            };
        }

        Rendering::Skip
    }
}
