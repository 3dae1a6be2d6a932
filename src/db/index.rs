//! `EventIndex` on Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use super::Db;
use crate::error::{Error, Result};
use crate::index::EventIndex;
use crate::model::{ChatId, EventId, MessageId, MessageRecord, ReplyAction};

#[async_trait]
impl EventIndex for Db {
    async fn save_message(&self, record: &MessageRecord) -> Result<()> {
        let reply_action = record
            .reply_action
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let buttons = serde_json::to_value(&record.buttons)?;

        // Dropping the transaction on an early return rolls everything back.
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO messages (chat_id, message_id, text, reply_to, reply_action, buttons, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (chat_id, message_id) DO UPDATE SET
                text = EXCLUDED.text,
                reply_to = EXCLUDED.reply_to,
                reply_action = EXCLUDED.reply_action,
                buttons = EXCLUDED.buttons,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(record.chat.0)
        .bind(record.message_id.0)
        .bind(&record.text)
        .bind(record.reply_to.map(|m| m.0))
        .bind(reply_action)
        .bind(buttons)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        for id in &record.event_ids {
            claim_on(&mut tx, record.chat, id, record.message_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_event(&self, chat: ChatId, event_id: &EventId, message: MessageId) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        claim_on(&mut conn, chat, event_id, message).await
    }

    async fn find_message_by_event_id(
        &self,
        chat: ChatId,
        event_id: &EventId,
    ) -> Result<Option<MessageRecord>> {
        let mut conn = self.pool().acquire().await?;
        match owner_on(&mut conn, chat, event_id).await? {
            Some(message) => load_message_on(&mut conn, chat, MessageId(message)).await,
            None => Ok(None),
        }
    }

    async fn get_message(&self, chat: ChatId, message: MessageId) -> Result<Option<MessageRecord>> {
        let mut conn = self.pool().acquire().await?;
        load_message_on(&mut conn, chat, message).await
    }

    async fn append_event_ids(&self, chat: ChatId, message: MessageId, ids: &[EventId]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let touched = sqlx::query(
            "UPDATE messages SET updated_at = $3 WHERE chat_id = $1 AND message_id = $2",
        )
        .bind(chat.0)
        .bind(message.0)
        .bind(self.now())
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(Error::NotFound(format!("message {message} in chat {chat}")));
        }
        for id in ids {
            claim_on(&mut tx, chat, id, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn event_ids_for(&self, chat: ChatId, message: MessageId) -> Result<Vec<EventId>> {
        let mut conn = self.pool().acquire().await?;
        event_ids_on(&mut conn, chat, message).await
    }
}

// ---------------------------------------------------------------------------
// Helpers. They take &mut PgConnection so a Transaction (deref) works too.
// ---------------------------------------------------------------------------

async fn owner_on(conn: &mut PgConnection, chat: ChatId, event_id: &EventId) -> Result<Option<i64>> {
    let owner: Option<(i64,)> =
        sqlx::query_as("SELECT message_id FROM events WHERE chat_id = $1 AND event_id = $2")
            .bind(chat.0)
            .bind(event_id.as_str())
            .fetch_optional(conn)
            .await?;
    Ok(owner.map(|(m,)| m))
}

/// Claim `event_id` for `message`. Same owner is a no-op, another owner is a conflict.
async fn claim_on(conn: &mut PgConnection, chat: ChatId, event_id: &EventId, message: MessageId) -> Result<()> {
    let inserted = sqlx::query(
        "INSERT INTO events (chat_id, event_id, message_id) VALUES ($1, $2, $3)
         ON CONFLICT (chat_id, event_id) DO NOTHING",
    )
    .bind(chat.0)
    .bind(event_id.as_str())
    .bind(message.0)
    .execute(&mut *conn)
    .await?;
    if inserted.rows_affected() == 1 {
        return Ok(());
    }

    match owner_on(conn, chat, event_id).await? {
        Some(existing) if existing == message.0 => Ok(()),
        Some(existing) => Err(Error::Conflict {
            chat: chat.0,
            event_id: event_id.to_string(),
            existing,
            attempted: message.0,
        }),
        // Deleted between the insert and the read; nothing owns it now.
        None => Err(Error::Other(format!("event {event_id} vanished while claiming"))),
    }
}

async fn event_ids_on(conn: &mut PgConnection, chat: ChatId, message: MessageId) -> Result<Vec<EventId>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT event_id FROM events WHERE chat_id = $1 AND message_id = $2 ORDER BY seq",
    )
    .bind(chat.0)
    .bind(message.0)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(|(id,)| EventId::new(id)).collect())
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    text: String,
    reply_to: Option<i64>,
    reply_action: Option<serde_json::Value>,
    buttons: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

async fn load_message_on(
    conn: &mut PgConnection,
    chat: ChatId,
    message: MessageId,
) -> Result<Option<MessageRecord>> {
    let row: Option<MessageRow> = sqlx::query_as(
        "SELECT text, reply_to, reply_action, buttons, created_at, updated_at
         FROM messages WHERE chat_id = $1 AND message_id = $2",
    )
    .bind(chat.0)
    .bind(message.0)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let reply_action = row
        .reply_action
        .map(serde_json::from_value::<ReplyAction>)
        .transpose()?;

    Ok(Some(MessageRecord {
        chat,
        message_id: message,
        event_ids: event_ids_on(conn, chat, message).await?,
        text: row.text,
        reply_to: row.reply_to.map(MessageId),
        reply_action,
        buttons: serde_json::from_value(row.buttons)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }))
}
