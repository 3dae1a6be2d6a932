//! Synchronization engine: decides, per canonical event, whether the chat
//! gets a new message, an edit of an existing one, or nothing.
//!
//! Two gates keep concurrent deliveries apart without a global lock:
//!
//! 1. the dedup record, written with an atomic set-if-absent before any
//!    side effect, admits one delivery per `(chat, service, action)`;
//! 2. the event index claim, which refuses to give one event id to two
//!    messages.
//!
//! Outbound writes implied by user replies never run inline; they are handed
//! to the job queue.

pub mod diff;
pub mod reply;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info, warn};

use crate::adapter::{Draft, RenderContext, Rendering, ServiceAdapter};
use crate::cache::{self, CacheScope, CacheStore};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::flags::NotificationFilter;
use crate::index::EventIndex;
use crate::jobs::{JobContext, JobHandler, JobQueue, arg};
use crate::model::event::{CanonicalEvent, EventPriority};
use crate::model::job::JobId;
use crate::model::{ChatId, MessageId, MessageRecord, UserId};
use crate::outbound::{OutboundCall, SUBSCRIBE_WEBHOOK, ServiceDirectory};
use crate::telemetry::metrics;
use crate::telemetry::sync::{record_outcome, start_sync_span};
use crate::transport::{ChatTransport, OutgoingMessage};

use diff::ChangeCause;
use reply::{IncomingReply, ReplyContext, ReplyOutcome, ReplyRouter};

/// Job handler name for events whose processing was deferred.
pub const SYNC_EVENT: &str = "sync_event";

/// Chat-scope cache key of the notification filter.
pub const FILTER_KEY: &str = "notification_filter";

/// Raw payload bytes kept in logs for a malformed delivery.
const LOGGED_PAYLOAD_BYTES: usize = 2048;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Follow-ups to a message younger than this are folded into it.
    pub recency_window: Duration,
    /// Lifetime of dedup records.
    pub dedup_ttl: Duration,
    /// Ceiling for user-facing synchronous outbound calls.
    pub sync_call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recency_window: Duration::from_secs(60),
            dedup_ttl: cache::DEDUP_TTL,
            sync_call_timeout: Duration::from_secs(20),
        }
    }
}

/// What processing one event did to the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// New message for an entity seen for the first time in this chat.
    Created { message: MessageId },
    /// The entity's message was edited.
    Amended { message: MessageId },
    /// A follow-up was appended to a still-fresh message.
    Folded { message: MessageId },
    /// A follow-up was posted as a reply under the entity's message.
    Replied { message: MessageId, parent: MessageId },
    /// This action was already processed.
    Duplicate,
    /// The chat muted this kind of event.
    Filtered,
    /// Nothing to show.
    Skipped,
    /// Another delivery already claimed the event id.
    Conflict,
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Created { .. } => "created",
            SyncOutcome::Amended { .. } => "amended",
            SyncOutcome::Folded { .. } => "folded",
            SyncOutcome::Replied { .. } => "replied",
            SyncOutcome::Duplicate => "duplicate",
            SyncOutcome::Filtered => "filtered",
            SyncOutcome::Skipped => "skipped",
            SyncOutcome::Conflict => "conflict",
        }
    }
}

/// Result of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Synced(SyncOutcome),
    /// The adapter does not care about this delivery.
    Ignored,
    /// Processing hit a retryable failure and continues as a job.
    Deferred(JobId),
    /// The body could not be parsed. Acknowledged so the provider stops retrying.
    Rejected(String),
    /// Processing failed for good. Logged and acknowledged.
    Dropped(String),
    /// No adapter for the service in the URL.
    UnknownService,
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Synced(outcome) => outcome.label(),
            IngestOutcome::Ignored => "ignored",
            IngestOutcome::Deferred(_) => "deferred",
            IngestOutcome::Rejected(_) => "rejected",
            IngestOutcome::Dropped(_) => "dropped",
            IngestOutcome::UnknownService => "unknown_service",
        }
    }
}

/// Shared collaborators of the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub index: Arc<dyn EventIndex>,
    pub cache: Arc<dyn CacheStore>,
    pub transport: Arc<dyn ChatTransport>,
    pub queue: JobQueue,
    pub services: Arc<ServiceDirectory>,
    pub clock: Arc<dyn Clock>,
}

pub struct SyncEngine {
    index: Arc<dyn EventIndex>,
    cache: Arc<dyn CacheStore>,
    transport: Arc<dyn ChatTransport>,
    queue: JobQueue,
    services: Arc<ServiceDirectory>,
    clock: Arc<dyn Clock>,
    adapters: HashMap<String, Arc<dyn ServiceAdapter>>,
    replies: ReplyRouter,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        Self {
            index: deps.index,
            cache: deps.cache,
            transport: deps.transport,
            queue: deps.queue,
            services: deps.services,
            clock: deps.clock,
            adapters: HashMap::new(),
            replies: ReplyRouter::new(),
            config,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ServiceAdapter>) -> Self {
        self.adapters.insert(adapter.namespace().to_string(), adapter);
        self
    }

    pub fn with_replies(mut self, replies: ReplyRouter) -> Self {
        self.replies = replies;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn has_adapter(&self, service: &str) -> bool {
        self.adapters.contains_key(service)
    }

    // -----------------------------------------------------------------------
    // Webhook ingestion
    // -----------------------------------------------------------------------

    /// Parse a raw webhook body with the service's adapter and process it.
    ///
    /// Only a failure to defer (job store unreachable) is returned as an
    /// error; everything else is acknowledged with an outcome.
    pub async fn ingest(&self, chat: ChatId, service: &str, raw: &[u8]) -> Result<IngestOutcome> {
        let result = self.ingest_inner(chat, service, raw).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        metrics::webhook_events().add(
            1,
            &[
                KeyValue::new("service", service.to_string()),
                KeyValue::new("result", label),
            ],
        );
        result
    }

    async fn ingest_inner(&self, chat: ChatId, service: &str, raw: &[u8]) -> Result<IngestOutcome> {
        let Some(adapter) = self.adapters.get(service) else {
            warn!(%chat, service, "webhook for unknown service");
            return Ok(IngestOutcome::UnknownService);
        };

        let event = match adapter.parse(raw) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(IngestOutcome::Ignored),
            Err(Error::MalformedPayload(reason)) => {
                let shown = &raw[..raw.len().min(LOGGED_PAYLOAD_BYTES)];
                warn!(
                    %chat,
                    service,
                    %reason,
                    payload = %String::from_utf8_lossy(shown),
                    "rejecting malformed webhook"
                );
                return Ok(IngestOutcome::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        match self.process(chat, &event).await {
            Ok(outcome) => Ok(IngestOutcome::Synced(outcome)),
            Err(e) if e.is_retryable() => self.defer(chat, &event, &e).await.map(IngestOutcome::Deferred),
            Err(e) => {
                error!(%chat, service, action_id = %event.action_id, error = %e, "dropping webhook event");
                Ok(IngestOutcome::Dropped(e.to_string()))
            }
        }
    }

    async fn defer(&self, chat: ChatId, event: &CanonicalEvent, cause: &Error) -> Result<JobId> {
        let id = self
            .queue
            .enqueue(SYNC_EVENT, vec![serde_json::to_value(chat)?, serde_json::to_value(event)?])
            .await?;
        warn!(%chat, action_id = %event.action_id, job = %id, error = %cause, "event deferred to job queue");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Event processing
    // -----------------------------------------------------------------------

    /// Project one canonical event onto the chat.
    pub async fn process(&self, chat: ChatId, event: &CanonicalEvent) -> Result<SyncOutcome> {
        let span = start_sync_span(chat.0, &event.service, &event.action_id);
        let result = self.process_gated(chat, event).instrument(span.clone()).await;
        match &result {
            Ok(outcome) => record_outcome(&span, outcome.label()),
            Err(_) => record_outcome(&span, "error"),
        }
        result
    }

    async fn process_gated(&self, chat: ChatId, event: &CanonicalEvent) -> Result<SyncOutcome> {
        let scope = CacheScope::Chat(chat);
        let key = event.dedup_key();

        let gated = match self
            .cache
            .set_if_absent(&scope, &key, Value::Bool(true), self.config.dedup_ttl)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(%chat, key, "duplicate delivery suppressed");
                return Ok(SyncOutcome::Duplicate);
            }
            Err(e) if event.priority == EventPriority::Low => {
                warn!(%chat, key, error = %e, "dedup gate unavailable, processing low-priority event ungated");
                false
            }
            Err(e) => return Err(e),
        };

        let mut touched_chat = false;
        let result = match self.apply(chat, event, &mut touched_chat).await {
            Err(e @ Error::Conflict { .. }) => {
                metrics::index_conflicts().add(1, &[]);
                warn!(%chat, error = %e, "event already claimed by another delivery");
                Ok(SyncOutcome::Conflict)
            }
            other => other,
        };

        // Nothing reached the chat: let a retry or redelivery through.
        if result.is_err() && gated && !touched_chat {
            if let Err(e) = self.cache.invalidate(&scope, &key).await {
                warn!(%chat, key, error = %e, "failed to release dedup gate");
            }
        }
        result
    }

    async fn apply(&self, chat: ChatId, event: &CanonicalEvent, touched_chat: &mut bool) -> Result<SyncOutcome> {
        let adapter = self
            .adapters
            .get(&event.service)
            .ok_or_else(|| Error::NotFound(format!("adapter for {}", event.service)))?;

        let existing = match self.index.find_message_by_event_id(chat, &event.entity).await {
            Ok(found) => found,
            Err(e @ Error::StoreUnavailable(_)) if event.priority == EventPriority::Low => {
                warn!(%chat, entity = %event.entity, error = %e, "event index unavailable, treating entity as new");
                None
            }
            Err(e) => return Err(e),
        };

        let entity = if adapter.needs_entity(event) {
            match self.fetch_entity(event).await {
                Ok(entity) => Some(entity),
                Err(Error::NotFound(what)) => {
                    debug!(%chat, what, "entity vanished upstream");
                    return Ok(SyncOutcome::Skipped);
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let cause = event
            .old
            .as_ref()
            .and_then(|old| diff::detect(old, entity.as_ref().unwrap_or(&event.payload)));

        if let Some(flag) = event.category.or(cause.map(ChangeCause::flag)) {
            if !self.filter(chat).await.is_enabled(flag) {
                debug!(%chat, %flag, "event filtered");
                return Ok(SyncOutcome::Filtered);
            }
        }

        let rendering = adapter.render(RenderContext {
            event,
            existing: existing.as_ref(),
            cause,
            entity: entity.as_ref(),
        });

        let now = self.clock.now();
        match (rendering, existing) {
            (Rendering::Skip, _) => Ok(SyncOutcome::Skipped),
            (Rendering::Amend(draft) | Rendering::FollowUp(draft), None) => {
                self.create(chat, event, draft, touched_chat).await
            }
            (Rendering::Amend(draft), Some(record)) => self.amend(record, event, draft, touched_chat).await,
            (Rendering::FollowUp(draft), Some(record)) if record.is_fresh(now, self.config.recency_window) => {
                self.fold(record, event, draft, touched_chat).await
            }
            (Rendering::FollowUp(draft), Some(record)) => self.reply(record, event, draft, touched_chat).await,
        }
    }

    /// Cache-first fetch of the full entity from its service.
    async fn fetch_entity(&self, event: &CanonicalEvent) -> Result<Value> {
        let service = self.services.get(&event.service)?;
        let entity = event.entity.clone();
        cache::cached_fetch(
            self.cache.as_ref(),
            &CacheScope::service(&event.service),
            &format!("entity:{entity}"),
            cache::ENTITY_TTL,
            || async move { service.fetch_entity(&entity).await },
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Chat writes
    // -----------------------------------------------------------------------

    async fn create(
        &self,
        chat: ChatId,
        event: &CanonicalEvent,
        draft: Draft,
        touched_chat: &mut bool,
    ) -> Result<SyncOutcome> {
        let message = OutgoingMessage::new(draft.text.clone()).buttons(draft.buttons.clone());
        let id = self.transport.send(chat, &message).await?;
        *touched_chat = true;
        metrics::chat_messages().add(1, &[KeyValue::new("operation", "send")]);

        let mut record = MessageRecord::new(chat, id, draft.text, self.clock.now());
        record.reply_action = draft.reply_action;
        record.buttons = draft.buttons;
        record.tag([event.entity.clone(), event.action_event_id()]);
        record.tag(draft.extra_ids);
        self.index.save_message(&record).await?;

        info!(%chat, message_id = %id, entity = %event.entity, "entity message created");
        Ok(SyncOutcome::Created { message: id })
    }

    async fn amend(
        &self,
        mut record: MessageRecord,
        event: &CanonicalEvent,
        draft: Draft,
        touched_chat: &mut bool,
    ) -> Result<SyncOutcome> {
        let update = OutgoingMessage::new(draft.text.clone()).buttons(draft.buttons.clone());
        self.transport.edit(record.chat, record.message_id, &update).await?;
        *touched_chat = true;
        metrics::chat_messages().add(1, &[KeyValue::new("operation", "edit")]);

        record.text = draft.text;
        record.buttons = draft.buttons;
        record.updated_at = self.clock.now();
        if draft.reply_action.is_some() {
            record.reply_action = draft.reply_action;
        }
        record.tag([event.action_event_id()]);
        record.tag(draft.extra_ids);
        self.index.save_message(&record).await?;

        debug!(chat = %record.chat, message_id = %record.message_id, "entity message amended");
        Ok(SyncOutcome::Amended {
            message: record.message_id,
        })
    }

    async fn fold(
        &self,
        mut record: MessageRecord,
        event: &CanonicalEvent,
        draft: Draft,
        touched_chat: &mut bool,
    ) -> Result<SyncOutcome> {
        // The entity message keeps its own keyboard.
        let text = format!("{}\n\n{}", record.text, draft.text);
        let update = OutgoingMessage::new(text.clone()).buttons(record.buttons.clone());
        self.transport.edit(record.chat, record.message_id, &update).await?;
        *touched_chat = true;
        metrics::chat_messages().add(1, &[KeyValue::new("operation", "edit")]);

        record.text = text;
        record.updated_at = self.clock.now();
        if record.reply_action.is_none() {
            record.reply_action = draft.reply_action;
        }
        record.tag([event.action_event_id()]);
        record.tag(draft.extra_ids);
        self.index.save_message(&record).await?;

        debug!(chat = %record.chat, message_id = %record.message_id, "follow-up folded into fresh message");
        Ok(SyncOutcome::Folded {
            message: record.message_id,
        })
    }

    async fn reply(
        &self,
        parent: MessageRecord,
        event: &CanonicalEvent,
        draft: Draft,
        touched_chat: &mut bool,
    ) -> Result<SyncOutcome> {
        let message = OutgoingMessage::new(draft.text.clone())
            .reply_to(parent.message_id)
            .buttons(draft.buttons.clone());
        let id = self.transport.send(parent.chat, &message).await?;
        *touched_chat = true;
        metrics::chat_messages().add(1, &[KeyValue::new("operation", "reply")]);

        let mut record = MessageRecord::new(parent.chat, id, draft.text, self.clock.now());
        record.reply_to = Some(parent.message_id);
        record.reply_action = draft.reply_action.or(parent.reply_action);
        record.buttons = draft.buttons;
        record.tag([event.action_event_id()]);
        record.tag(draft.extra_ids);
        self.index.save_message(&record).await?;

        debug!(chat = %parent.chat, message_id = %id, parent = %parent.message_id, "follow-up threaded");
        Ok(SyncOutcome::Replied {
            message: id,
            parent: parent.message_id,
        })
    }

    // -----------------------------------------------------------------------
    // Replies and subscriptions
    // -----------------------------------------------------------------------

    /// Route a user's reply through the reply action bound to the message it answers.
    pub async fn handle_reply(&self, reply: &IncomingReply) -> Result<ReplyOutcome> {
        let Some(record) = self.index.get_message(reply.chat, reply.reply_to).await? else {
            return Ok(ReplyOutcome::Ignored);
        };
        let Some(action) = record.reply_action.as_ref() else {
            return Ok(ReplyOutcome::Ignored);
        };
        let handler = self
            .replies
            .get(&action.handler)
            .ok_or_else(|| Error::UnknownHandler(action.handler.clone()))?;

        info!(chat = %reply.chat, user = %reply.user, handler = %action.handler, "routing reply");
        handler
            .handle(ReplyContext {
                reply,
                record: &record,
                action,
            })
            .await
    }

    /// Ask `service` to send `target`'s webhooks to this chat.
    pub async fn subscribe(
        &self,
        chat: ChatId,
        user: UserId,
        service: &str,
        target: &str,
        reply_to: Option<MessageId>,
    ) -> Result<JobId> {
        self.services.get(service)?;
        let call = OutboundCall {
            service: service.to_string(),
            user,
            chat,
            reply_to,
        };
        self.queue
            .enqueue(SUBSCRIBE_WEBHOOK, vec![serde_json::to_value(&call)?, json!(target)])
            .await
    }

    /// Store a user's credential for a service.
    pub async fn remember_token(&self, user: UserId, service: &str, token: &str) -> Result<()> {
        self.cache
            .set(
                &CacheScope::User(user),
                &cache::token_key(service),
                json!(token),
                cache::CREDENTIAL_TTL,
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Notification filters
    // -----------------------------------------------------------------------

    /// The chat's filter. An unreadable filter counts as "everything on".
    pub async fn filter(&self, chat: ChatId) -> NotificationFilter {
        match cache::get_as(self.cache.as_ref(), &CacheScope::Chat(chat), FILTER_KEY).await {
            Ok(filter) => filter.unwrap_or_default(),
            Err(e) => {
                warn!(%chat, error = %e, "notification filter unavailable, using defaults");
                NotificationFilter::default()
            }
        }
    }

    /// Flip the flag called `name`; returns its new value.
    pub async fn toggle_filter(&self, chat: ChatId, name: &str) -> Result<bool> {
        let mut filter = self.filter(chat).await;
        let enabled = filter.toggle(name)?;
        cache::set_as(
            self.cache.as_ref(),
            &CacheScope::Chat(chat),
            FILTER_KEY,
            &filter,
            cache::SETTINGS_TTL,
        )
        .await?;
        Ok(enabled)
    }
}

// ---------------------------------------------------------------------------
// Deferred processing
// ---------------------------------------------------------------------------

/// Late-bound handle to the engine, filled in once the engine exists. The
/// queue is built before the engine, so `sync_event` cannot hold it directly.
pub type EngineSlot = Arc<OnceLock<Weak<SyncEngine>>>;

/// `sync_event`: `[chat, canonical event]`, re-runs [`SyncEngine::process`].
pub struct SyncEventJob {
    engine: EngineSlot,
}

impl SyncEventJob {
    pub fn new(engine: EngineSlot) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for SyncEventJob {
    async fn run(&self, _ctx: &JobContext, args: &[Value]) -> Result<Value> {
        let chat: ChatId = arg(args, 0)?;
        let event: CanonicalEvent = arg(args, 1)?;
        let engine = self
            .engine
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::TransientUpstream("sync engine is not running".to_string()))?;
        let outcome = engine.process(chat, &event).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}
