//! Reply handlers that turn chat replies into outbound jobs.
//!
//! Both expect the reply action to carry `{ "service", "target" }`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{ATTACH_FILE, OutboundCall, POST_COMMENT};
use crate::engine::reply::{Attachment, ReplyContext, ReplyHandler, ReplyOutcome};
use crate::error::{Error, Result};
use crate::jobs::JobQueue;
use crate::model::job::JobId;
use crate::transport::{ChatTransport, OutgoingMessage};

/// Reply handler name for attaching files to the entity.
pub const ATTACH_REPLY: &str = "attach";

#[derive(Debug, Deserialize)]
struct TargetArgs {
    service: String,
    target: String,
}

fn target_args(ctx: &ReplyContext<'_>) -> Result<TargetArgs> {
    serde_json::from_value(ctx.action.args.clone())
        .map_err(|e| Error::MalformedPayload(format!("reply action {}: {e}", ctx.action.handler)))
}

fn call_for(ctx: &ReplyContext<'_>, service: String) -> OutboundCall {
    OutboundCall {
        service,
        user: ctx.reply.user,
        chat: ctx.reply.chat,
        reply_to: Some(ctx.reply.message_id),
    }
}

async fn queue_attachment(queue: &JobQueue, ctx: &ReplyContext<'_>, attachment: &Attachment) -> Result<ReplyOutcome> {
    let TargetArgs { service, target } = target_args(ctx)?;
    let call = call_for(ctx, service);
    let id = queue
        .enqueue(
            ATTACH_FILE,
            vec![
                serde_json::to_value(&call)?,
                json!(target),
                json!(attachment.name),
                json!(attachment.url),
            ],
        )
        .await?;
    info!(%id, chat = %ctx.reply.chat, "attachment queued");
    Ok(ReplyOutcome::Queued(id))
}

/// Posts the reply text as a comment and waits for the outcome, so the user
/// only sees a confirmation once the comment exists. A reply carrying a file
/// is an attachment instead.
pub struct CommentReply {
    pub queue: JobQueue,
    pub transport: Arc<dyn ChatTransport>,
    /// How long a user-facing reply may wait for the comment to post.
    pub timeout: Duration,
}

#[async_trait]
impl ReplyHandler for CommentReply {
    async fn handle(&self, ctx: ReplyContext<'_>) -> Result<ReplyOutcome> {
        if let Some(attachment) = &ctx.reply.attachment {
            return queue_attachment(&self.queue, &ctx, attachment).await;
        }
        if ctx.reply.text.trim().is_empty() {
            return Ok(ReplyOutcome::Ignored);
        }
        let TargetArgs { service, target } = target_args(&ctx)?;
        let call = call_for(&ctx, service);
        let args = vec![
            serde_json::to_value(&call)?,
            json!(target),
            json!(ctx.reply.text),
        ];

        match self.queue.do_sync(POST_COMMENT, args, self.timeout).await {
            Ok(_) => {
                let confirmation = OutgoingMessage::new("Comment posted.").reply_to(ctx.reply.message_id);
                let id = self.transport.send(ctx.reply.chat, &confirmation).await?;
                Ok(ReplyOutcome::Confirmed(id))
            }
            Err(Error::DeadlineExceeded(_, job)) => {
                let notice = OutgoingMessage::new(
                    "Still posting your comment. I will let you know here if it fails.",
                )
                .reply_to(ctx.reply.message_id);
                if let Err(e) = self.transport.send(ctx.reply.chat, &notice).await {
                    warn!(chat = %ctx.reply.chat, error = %e, "failed to send delay notice");
                }
                let id = job
                    .parse::<JobId>()
                    .map_err(|e| Error::Other(format!("invalid job id {job}: {e}")))?;
                Ok(ReplyOutcome::Queued(id))
            }
            // The job already posted a failure notice in the chat.
            Err(e) => Ok(ReplyOutcome::Failed(e.to_string())),
        }
    }
}

/// Uploads the reply's attachment in the background. The attach job sends
/// the confirmation when it finishes.
pub struct AttachReply {
    pub queue: JobQueue,
}

#[async_trait]
impl ReplyHandler for AttachReply {
    async fn handle(&self, ctx: ReplyContext<'_>) -> Result<ReplyOutcome> {
        match &ctx.reply.attachment {
            Some(attachment) => queue_attachment(&self.queue, &ctx, attachment).await,
            None => Ok(ReplyOutcome::Ignored),
        }
    }
}
