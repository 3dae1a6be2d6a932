//! `ExternalService` over a plain REST API.
//!
//! Endpoint shape, relative to the service's base URL:
//!
//! - `GET  /entities/{id}` (service token)
//! - `POST /entities/{id}/comments`     `{ "text" }`
//! - `POST /entities/{id}/attachments`  `{ "name", "url" }`
//! - `POST /webhooks`                   `{ "target", "callback_url" }`
//!
//! User writes authenticate with the user's bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use super::ExternalService;
use crate::error::{Error, Result};
use crate::model::EventId;

const USER_AGENT: &str = concat!("hubsync/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct HttpService {
    name: String,
    http: reqwest::Client,
    api_base: String,
    service_token: Option<SecretString>,
}

impl HttpService {
    pub fn new(
        name: impl Into<String>,
        api_base: &str,
        service_token: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create http client: {e}")))?;
        Ok(Self {
            name: name.into(),
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            service_token,
        })
    }

    async fn request_json(&self, operation: &str, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await.map_err(|e| {
            Error::TransientUpstream(format!("{} {operation}: {e}", self.name))
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::TransientUpstream(format!("{} {operation}: reading body: {e}", self.name))
        })?;
        debug!(service = %self.name, operation, status = status.as_u16(), "upstream response");

        if !status.is_success() {
            return Err(classify(&self.name, operation, status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| {
            Error::MalformedPayload(format!(
                "{} {operation}: invalid json response: {e}: {}",
                self.name,
                truncate_for_error(&body, 200)
            ))
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }
}

/// Map a non-success status to the error taxonomy.
pub fn classify(service: &str, operation: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{operation}: {}", truncate_for_error(body, 200));
    match status.as_u16() {
        401 | 403 => Error::AuthInvalid {
            service: service.to_string(),
            message,
        },
        404 => Error::NotFound(format!("{service} {message}")),
        408 | 429 => Error::TransientUpstream(format!("{service} HTTP {status}: {message}")),
        s if status.is_server_error() => Error::TransientUpstream(format!("{service} HTTP {s}: {message}")),
        s => Error::Upstream { status: s, message },
    }
}

fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut out: String = body.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[async_trait]
impl ExternalService for HttpService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_entity(&self, entity: &EventId) -> Result<Value> {
        let mut request = self.http.get(self.url(&format!("/entities/{entity}")));
        if let Some(token) = &self.service_token {
            request = request.bearer_auth(token.expose_secret());
        }
        self.request_json("fetch entity", request).await
    }

    async fn post_comment(&self, token: &str, target: &str, text: &str) -> Result<Value> {
        let request = self
            .http
            .post(self.url(&format!("/entities/{target}/comments")))
            .bearer_auth(token)
            .json(&json!({ "text": text }));
        self.request_json("post comment", request).await
    }

    async fn attach_file(&self, token: &str, target: &str, name: &str, url: &str) -> Result<Value> {
        let request = self
            .http
            .post(self.url(&format!("/entities/{target}/attachments")))
            .bearer_auth(token)
            .json(&json!({ "name": name, "url": url }));
        self.request_json("attach file", request).await
    }

    async fn subscribe_webhook(&self, token: &str, target: &str, callback_url: &str) -> Result<Value> {
        let request = self
            .http
            .post(self.url("/webhooks"))
            .bearer_auth(token)
            .json(&json!({ "target": target, "callback_url": callback_url }));
        self.request_json("subscribe webhook", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let c = |s: u16| classify("trello", "op", StatusCode::from_u16(s).unwrap(), "");
        assert!(matches!(c(401), Error::AuthInvalid { .. }));
        assert!(matches!(c(403), Error::AuthInvalid { .. }));
        assert!(matches!(c(404), Error::NotFound(_)));
        assert!(c(429).is_retryable());
        assert!(c(503).is_retryable());
        assert!(matches!(c(422), Error::Upstream { status: 422, .. }));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(500);
        assert_eq!(truncate_for_error(&body, 10), "xxxxxxxxxx...");
    }
}
