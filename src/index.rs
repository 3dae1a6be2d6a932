//! Event index: durable mapping between event ids and the chat messages that
//! represent them.
//!
//! Conceptually two collections per chat:
//!
//! - `events(chat, event_id) -> message_id`
//! - `messages(chat, message_id) -> { event_ids[], text, reply_action, created_at }`
//!
//! An event id is claimed by at most one message per chat. A claim for a
//! different message fails with [`Error::Conflict`](crate::error::Error::Conflict)
//! and leaves the first association untouched; re-claiming for the same
//! message is a no-op. A message's event ids only ever grow.
//!
//! Backends report an unreachable store as
//! [`Error::StoreUnavailable`](crate::error::Error::StoreUnavailable).

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ChatId, EventId, MessageId, MessageRecord};

#[async_trait]
pub trait EventIndex: Send + Sync {
    /// Insert or update a message record and claim all of its event ids.
    ///
    /// Atomic: on conflict nothing is written. `created_at` of an existing
    /// record is never changed.
    async fn save_message(&self, record: &MessageRecord) -> Result<()>;

    /// Associate `event_id` with `message`. Idempotent for the same message.
    async fn record_event(&self, chat: ChatId, event_id: &EventId, message: MessageId) -> Result<()>;

    /// The message an event id belongs to, with all of its event ids.
    async fn find_message_by_event_id(
        &self,
        chat: ChatId,
        event_id: &EventId,
    ) -> Result<Option<MessageRecord>>;

    async fn get_message(&self, chat: ChatId, message: MessageId) -> Result<Option<MessageRecord>>;

    /// Attach more event ids to an existing message. Additive; atomic on conflict.
    async fn append_event_ids(&self, chat: ChatId, message: MessageId, ids: &[EventId]) -> Result<()>;

    /// Reverse lookup: event ids of a message in the order they were attached.
    async fn event_ids_for(&self, chat: ChatId, message: MessageId) -> Result<Vec<EventId>>;
}
