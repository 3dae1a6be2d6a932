//! Outbound actions against external services.
//!
//! Every write the hub makes on a user's behalf (comments, attachments,
//! webhook subscriptions) goes through the job queue as one of the handlers
//! in [`handlers`]. The services themselves sit behind [`ExternalService`].

pub mod handlers;
pub mod http;
pub mod replies;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ChatId, EventId, MessageId, UserId};

pub use handlers::{ATTACH_FILE, POST_COMMENT, SUBSCRIBE_WEBHOOK};
pub use http::HttpService;

/// Authenticated API of one external service.
///
/// Implementations classify failures: network trouble, 408, 429 and 5xx are
/// `TransientUpstream`; rejected credentials are `AuthInvalid`; a missing
/// target is `NotFound`; any other rejection is `Upstream`.
#[async_trait]
pub trait ExternalService: Send + Sync {
    fn name(&self) -> &str;

    /// Current state of an entity, for rendering thin webhooks.
    async fn fetch_entity(&self, entity: &EventId) -> Result<Value>;

    async fn post_comment(&self, token: &str, target: &str, text: &str) -> Result<Value>;

    async fn attach_file(&self, token: &str, target: &str, name: &str, url: &str) -> Result<Value>;

    async fn subscribe_webhook(&self, token: &str, target: &str, callback_url: &str) -> Result<Value>;

    /// Id of the action a successful write created, as the service will
    /// report it in the webhook that echoes the write back. Defaults to the
    /// response's top-level `id`, string or number.
    fn action_id(&self, response: &Value) -> Option<String> {
        match response.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

/// Service name to client.
#[derive(Default, Clone)]
pub struct ServiceDirectory {
    services: HashMap<String, Arc<dyn ExternalService>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: Arc<dyn ExternalService>) -> &mut Self {
        self.services.insert(service.name().to_string(), service);
        self
    }

    /// `Error::NotFound` for services that are not configured.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ExternalService>> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Who an outbound job acts for and where to report back. First argument of
/// every outbound job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCall {
    pub service: String,
    pub user: UserId,
    pub chat: ChatId,
    /// The user's message to thread confirmations and notices under.
    pub reply_to: Option<MessageId>,
}
