//! TTL key/value cache with per-user, per-chat and per-service scopes.
//!
//! Used for dedup markers, memoized upstream responses and short-lived
//! conversational state. Best effort: reads of expired keys are misses and
//! are evicted lazily, writes always win, and there is no cross-key
//! atomicity. Losing the whole cache costs redundant upstream calls, never
//! correctness.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Result;
use crate::model::{ChatId, UserId};
use crate::telemetry::metrics;

/// Dedup records live about an hour.
pub const DEDUP_TTL: Duration = Duration::from_secs(60 * 60);
/// Upstream entities (cards, issues) are stable enough to keep for a month.
pub const ENTITY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Users' service credentials. Dropped early when a service rejects them.
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// Per-chat settings; refreshed on every write.
pub const SETTINGS_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Namespace a cache key belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    User(UserId),
    Chat(ChatId),
    Service(String),
}

impl CacheScope {
    pub fn service(name: impl Into<String>) -> Self {
        CacheScope::Service(name.into())
    }

    /// Stable textual form used as the storage key prefix.
    pub fn namespace(&self) -> String {
        match self {
            CacheScope::User(id) => format!("user:{id}"),
            CacheScope::Chat(id) => format!("chat:{id}"),
            CacheScope::Service(name) => format!("service:{name}"),
        }
    }
}

impl std::fmt::Display for CacheScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.namespace())
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `None` when the key is absent or expired.
    async fn get(&self, scope: &CacheScope, key: &str) -> Result<Option<serde_json::Value>>;

    /// Overwrite unconditionally.
    async fn set(
        &self,
        scope: &CacheScope,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<()>;

    /// Write only if the key is absent or expired, as one atomic step.
    /// Returns whether this call wrote the value.
    async fn set_if_absent(
        &self,
        scope: &CacheScope,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool>;

    async fn invalidate(&self, scope: &CacheScope, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Read and decode a cached value. Entries that no longer decode count as misses.
pub async fn get_as<T: DeserializeOwned>(
    cache: &dyn CacheStore,
    scope: &CacheScope,
    key: &str,
) -> Result<Option<T>> {
    let Some(value) = cache.get(scope, key).await? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(e) => {
            debug!(%scope, key, error = %e, "discarding undecodable cache entry");
            Ok(None)
        }
    }
}

pub async fn set_as<T: Serialize>(
    cache: &dyn CacheStore,
    scope: &CacheScope,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    cache
        .set(scope, key, serde_json::to_value(value)?, ttl)
        .await
}

/// Cache-first fetch: return the cached value, or run `fetch` and remember its result.
///
/// A cache that cannot be read or written is treated as empty; the upstream
/// result is returned either way.
pub async fn cached_fetch<T, F, Fut>(
    cache: &dyn CacheStore,
    scope: &CacheScope,
    key: &str,
    ttl: Duration,
    fetch: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match get_as::<T>(cache, scope, key).await {
        Ok(Some(hit)) => {
            metrics::cache_lookups().add(1, &[KeyValue::new("result", "hit")]);
            return Ok(hit);
        }
        Ok(None) => {}
        Err(e) => debug!(%scope, key, error = %e, "cache read failed, fetching upstream"),
    }
    metrics::cache_lookups().add(1, &[KeyValue::new("result", "miss")]);

    let fresh = fetch().await?;
    if let Err(e) = set_as(cache, scope, key, &fresh, ttl).await {
        debug!(%scope, key, error = %e, "cache write failed");
    }
    Ok(fresh)
}

/// Cache key of a user's credential for one service.
pub fn token_key(service: &str) -> String {
    format!("oauth_token:{service}")
}
