//! Job handlers for outbound writes.
//!
//! Arguments are positional: `[OutboundCall, target, ...]`. Credentials come
//! from the acting user's cache scope. A rejected credential is forgotten and
//! the user is asked to reconnect; any other terminal failure is reported as
//! a notice threaded under the user's message.
//!
//! Writes that the service will echo back as a webhook (comments,
//! attachments) leave a dedup record for the created action in the chat, so
//! the echo is dropped by the sync engine instead of being posted again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{ExternalService, OutboundCall, ServiceDirectory};
use crate::cache::{self, CacheScope, CacheStore};
use crate::error::{Error, Result};
use crate::jobs::{JobContext, JobHandler, arg};
use crate::model::event::dedup_key;
use crate::transport::{Button, ChatTransport, OutgoingMessage};

pub const POST_COMMENT: &str = "post_comment";
pub const ATTACH_FILE: &str = "attach_file";
pub const SUBSCRIBE_WEBHOOK: &str = "subscribe_webhook";

/// Shared dependencies of the outbound handlers.
#[derive(Clone)]
pub struct Outbound {
    pub services: Arc<ServiceDirectory>,
    pub cache: Arc<dyn CacheStore>,
    pub transport: Arc<dyn ChatTransport>,
    /// Base URL the hub is reachable at, for webhook callbacks.
    pub public_url: String,
    /// Lifetime of the dedup record left for the hub's own writes.
    pub dedup_ttl: Duration,
}

impl Outbound {
    async fn token(&self, call: &OutboundCall) -> Result<String> {
        let scope = CacheScope::User(call.user);
        match cache::get_as::<String>(self.cache.as_ref(), &scope, &cache::token_key(&call.service)).await? {
            Some(token) => Ok(token),
            None => Err(Error::AuthInvalid {
                service: call.service.clone(),
                message: format!("user {} has not connected {}", call.user, call.service),
            }),
        }
    }

    /// Run `op` with the user's credential, forgetting the credential if the
    /// service rejects it.
    async fn with_token<F, Fut>(&self, call: &OutboundCall, op: F) -> Result<Value>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        let token = self.token(call).await?;
        let result = op(token).await;
        if let Err(Error::AuthInvalid { .. }) = &result {
            let scope = CacheScope::User(call.user);
            if let Err(e) = self.cache.invalidate(&scope, &cache::token_key(&call.service)).await {
                warn!(user = %call.user, service = %call.service, error = %e, "failed to drop rejected credential");
            }
        }
        result
    }

    /// Mark the action created by a successful write as seen in the calling
    /// chat. Best-effort: a miss only costs one echoed notification.
    async fn suppress_echo(&self, call: &OutboundCall, service: &dyn ExternalService, response: &Value) {
        let Some(action_id) = service.action_id(response) else {
            debug!(service = %call.service, "write response carries no action id");
            return;
        };
        let key = dedup_key(&call.service, &action_id);
        if let Err(e) = self
            .cache
            .set_if_absent(&CacheScope::Chat(call.chat), &key, Value::Bool(true), self.dedup_ttl)
            .await
        {
            warn!(chat = %call.chat, key, error = %e, "failed to record own action");
        }
    }

    /// Best-effort message to the chat the call came from.
    async fn tell(&self, call: &OutboundCall, message: OutgoingMessage) {
        let message = match call.reply_to {
            Some(reply_to) => message.reply_to(reply_to),
            None => message,
        };
        if let Err(e) = self.transport.send(call.chat, &message).await {
            warn!(chat = %call.chat, error = %e, "failed to deliver chat notice");
        }
    }

    async fn report_failure(&self, call: &OutboundCall, what: &str, error: &Error) {
        let message = match error {
            Error::AuthInvalid { service, .. } => OutgoingMessage::new(format!(
                "Your {service} authorization has expired, so I could not {what}. Please reconnect and try again."
            ))
            .buttons(vec![Button::new(format!("Reconnect {service}"), format!("reauth:{service}"))]),
            Error::NotFound(_) => OutgoingMessage::new(format!("Could not {what}: it no longer exists.")),
            other => OutgoingMessage::new(format!("Could not {what}: {other}")),
        };
        self.tell(call, message).await;
    }
}

// ---------------------------------------------------------------------------
// post_comment: [call, target, text]
// ---------------------------------------------------------------------------

pub struct PostComment(pub Outbound);

#[async_trait]
impl JobHandler for PostComment {
    async fn run(&self, _ctx: &JobContext, args: &[Value]) -> Result<Value> {
        let call: OutboundCall = arg(args, 0)?;
        let target: String = arg(args, 1)?;
        let text: String = arg(args, 2)?;
        let service = self.0.services.get(&call.service)?;

        let response = self
            .0
            .with_token(&call, |token| {
                let service = service.clone();
                async move { service.post_comment(&token, &target, &text).await }
            })
            .await?;
        self.0.suppress_echo(&call, service.as_ref(), &response).await;
        info!(service = %call.service, user = %call.user, "comment posted");
        Ok(response)
    }

    async fn on_failure(&self, _ctx: &JobContext, args: &[Value], error: &Error) {
        if let Ok(call) = arg::<OutboundCall>(args, 0) {
            self.0.report_failure(&call, "post your comment", error).await;
        }
    }
}

// ---------------------------------------------------------------------------
// attach_file: [call, target, name, url]
// ---------------------------------------------------------------------------

pub struct AttachFile(pub Outbound);

#[async_trait]
impl JobHandler for AttachFile {
    async fn run(&self, _ctx: &JobContext, args: &[Value]) -> Result<Value> {
        let call: OutboundCall = arg(args, 0)?;
        let target: String = arg(args, 1)?;
        let name: String = arg(args, 2)?;
        let url: String = arg(args, 3)?;
        let service = self.0.services.get(&call.service)?;

        let response = self
            .0
            .with_token(&call, |token| {
                let service = service.clone();
                let (target, name, url) = (target.clone(), name.clone(), url.clone());
                async move { service.attach_file(&token, &target, &name, &url).await }
            })
            .await?;
        self.0.suppress_echo(&call, service.as_ref(), &response).await;

        // Confirm only once the upload is done.
        self.0
            .tell(&call, OutgoingMessage::new(format!("Attached {name} to {target}.")))
            .await;
        Ok(response)
    }

    async fn on_failure(&self, _ctx: &JobContext, args: &[Value], error: &Error) {
        if let Ok(call) = arg::<OutboundCall>(args, 0) {
            self.0.report_failure(&call, "attach your file", error).await;
        }
    }
}

// ---------------------------------------------------------------------------
// subscribe_webhook: [call, target]
// ---------------------------------------------------------------------------

pub struct SubscribeWebhook(pub Outbound);

impl SubscribeWebhook {
    fn callback_url(&self, call: &OutboundCall) -> String {
        format!(
            "{}/webhook/{}/{}",
            self.0.public_url.trim_end_matches('/'),
            call.service,
            call.chat
        )
    }
}

#[async_trait]
impl JobHandler for SubscribeWebhook {
    async fn run(&self, _ctx: &JobContext, args: &[Value]) -> Result<Value> {
        let call: OutboundCall = arg(args, 0)?;
        let target: String = arg(args, 1)?;
        let service = self.0.services.get(&call.service)?;
        let callback = self.callback_url(&call);

        let response = self
            .0
            .with_token(&call, |token| {
                let (target, callback) = (target.clone(), callback.clone());
                async move { service.subscribe_webhook(&token, &target, &callback).await }
            })
            .await?;

        info!(service = %call.service, chat = %call.chat, %target, "webhook subscribed");
        self.0
            .tell(
                &call,
                OutgoingMessage::new(format!("This chat now receives {} updates for {target}.", call.service)),
            )
            .await;
        Ok(json!({ "callback_url": callback, "response": response }))
    }

    async fn on_failure(&self, _ctx: &JobContext, args: &[Value], error: &Error) {
        if let Ok(call) = arg::<OutboundCall>(args, 0) {
            self.0.report_failure(&call, "subscribe to updates", error).await;
        }
    }
}
