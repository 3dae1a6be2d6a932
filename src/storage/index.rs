//! `EventIndex` on SQLite.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use super::{Storage, from_millis, millis};
use crate::error::{Error, Result};
use crate::index::EventIndex;
use crate::model::{ChatId, EventId, MessageId, MessageRecord, ReplyAction};

#[async_trait]
impl EventIndex for Storage {
    async fn save_message(&self, record: &MessageRecord) -> Result<()> {
        let now = millis(self.now());
        self.with_transaction(|tx| {
            let reply_action = record
                .reply_action
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let buttons = serde_json::to_string(&record.buttons)?;
            tx.execute(
                "INSERT INTO messages (chat_id, message_id, text, reply_to, reply_action, buttons, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (chat_id, message_id) DO UPDATE SET
                    text = excluded.text,
                    reply_to = excluded.reply_to,
                    reply_action = excluded.reply_action,
                    buttons = excluded.buttons,
                    updated_at = excluded.updated_at",
                params![
                    record.chat.0,
                    record.message_id.0,
                    record.text,
                    record.reply_to.map(|m| m.0),
                    reply_action,
                    buttons,
                    millis(record.created_at),
                    millis(record.updated_at),
                ],
            )?;
            for id in &record.event_ids {
                claim_on(tx, record.chat, id, record.message_id, now)?;
            }
            Ok(())
        })
    }

    async fn record_event(&self, chat: ChatId, event_id: &EventId, message: MessageId) -> Result<()> {
        let now = millis(self.now());
        self.with_transaction(|tx| claim_on(tx, chat, event_id, message, now))
    }

    async fn find_message_by_event_id(
        &self,
        chat: ChatId,
        event_id: &EventId,
    ) -> Result<Option<MessageRecord>> {
        self.with_conn(|conn| {
            let message: Option<i64> = conn
                .query_row(
                    "SELECT message_id FROM events WHERE chat_id = ?1 AND event_id = ?2",
                    params![chat.0, event_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match message {
                Some(m) => load_message_on(conn, chat, MessageId(m)),
                None => Ok(None),
            }
        })
    }

    async fn get_message(&self, chat: ChatId, message: MessageId) -> Result<Option<MessageRecord>> {
        self.with_conn(|conn| load_message_on(conn, chat, message))
    }

    async fn append_event_ids(&self, chat: ChatId, message: MessageId, ids: &[EventId]) -> Result<()> {
        let now = millis(self.now());
        self.with_transaction(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE chat_id = ?1 AND message_id = ?2)",
                params![chat.0, message.0],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::NotFound(format!("message {message} in chat {chat}")));
            }
            for id in ids {
                claim_on(tx, chat, id, message, now)?;
            }
            tx.execute(
                "UPDATE messages SET updated_at = ?3 WHERE chat_id = ?1 AND message_id = ?2",
                params![chat.0, message.0, now],
            )?;
            Ok(())
        })
    }

    async fn event_ids_for(&self, chat: ChatId, message: MessageId) -> Result<Vec<EventId>> {
        self.with_conn(|conn| event_ids_on(conn, chat, message))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Claim `event_id` for `message`. Same owner is a no-op, another owner is a conflict.
fn claim_on(conn: &Connection, chat: ChatId, event_id: &EventId, message: MessageId, now: i64) -> Result<()> {
    let owner: Option<i64> = conn
        .query_row(
            "SELECT message_id FROM events WHERE chat_id = ?1 AND event_id = ?2",
            params![chat.0, event_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    match owner {
        Some(existing) if existing == message.0 => Ok(()),
        Some(existing) => Err(Error::Conflict {
            chat: chat.0,
            event_id: event_id.to_string(),
            existing,
            attempted: message.0,
        }),
        None => {
            conn.execute(
                "INSERT INTO events (chat_id, event_id, message_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![chat.0, event_id.as_str(), message.0, now],
            )?;
            Ok(())
        }
    }
}

fn event_ids_on(conn: &Connection, chat: ChatId, message: MessageId) -> Result<Vec<EventId>> {
    let mut stmt = conn.prepare(
        "SELECT event_id FROM events WHERE chat_id = ?1 AND message_id = ?2 ORDER BY seq",
    )?;
    let ids = stmt
        .query_map(params![chat.0, message.0], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().map(EventId::new).collect())
}

fn load_message_on(conn: &Connection, chat: ChatId, message: MessageId) -> Result<Option<MessageRecord>> {
    let row = conn
        .query_row(
            "SELECT text, reply_to, reply_action, buttons, created_at, updated_at
             FROM messages WHERE chat_id = ?1 AND message_id = ?2",
            params![chat.0, message.0],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    from_millis(row.get(4)?)?,
                    from_millis(row.get(5)?)?,
                ))
            },
        )
        .optional()?;

    let Some((text, reply_to, reply_action, buttons, created_at, updated_at)) = row else {
        return Ok(None);
    };
    let reply_action = reply_action
        .map(|raw| serde_json::from_str::<ReplyAction>(&raw))
        .transpose()?;

    Ok(Some(MessageRecord {
        chat,
        message_id: message,
        event_ids: event_ids_on(conn, chat, message)?,
        text,
        reply_to: reply_to.map(MessageId),
        reply_action,
        buttons: serde_json::from_str(&buttons)?,
        created_at,
        updated_at,
    }))
}
