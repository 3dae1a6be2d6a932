//! Job handler registry.
//!
//! Each handler is registered under a stable name together with the worker
//! pool it runs in and its retry policy. Pool sizes and policies can be
//! overridden per handler from a TOML file:
//!
//! ```toml
//! [handlers.post_comment]
//! pool_size = 5
//! policy = "fibonacci"
//! max_attempts = 8
//! base_delay_ms = 500
//! max_delay_ms = 60000
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use super::policy::RetryPolicy;
use crate::error::{Error, Result};
use crate::model::job::JobId;

/// Default pool size for handlers that talk to third-party APIs.
pub const DEFAULT_POOL_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub handler: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A named unit of deferred work.
///
/// Handlers classify their own failures: retryable errors (see
/// [`Error::is_retryable`]) are retried under the handler's policy, all
/// others fail the job immediately. Execution is at-least-once, so handlers
/// must tolerate running more than once with the same arguments.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext, args: &[Value]) -> Result<Value>;

    /// Called once after the job reached `Failed`.
    async fn on_failure(&self, _ctx: &JobContext, _args: &[Value], _error: &Error) {}
}

/// Pool and policy a handler is registered with.
#[derive(Debug, Clone)]
pub struct HandlerSpec {
    pub pool: Option<String>,
    pub pool_size: usize,
    pub policy: RetryPolicy,
}

impl Default for HandlerSpec {
    fn default() -> Self {
        Self {
            pool: None,
            pool_size: DEFAULT_POOL_SIZE,
            policy: RetryPolicy::default(),
        }
    }
}

impl HandlerSpec {
    /// Share a named pool with other handlers instead of a private one.
    pub fn pool(mut self, name: impl Into<String>) -> Self {
        self.pool = Some(name.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

// ---------------------------------------------------------------------------
// TOML overrides
// ---------------------------------------------------------------------------

/// Top-level TOML wrapper.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub handlers: HashMap<String, HandlerOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Fibonacci,
    Fixed,
    None,
}

/// Per-handler override. Unset fields keep the registered value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerOverride {
    pub pool_size: Option<usize>,
    pub policy: Option<PolicyKind>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl JobsConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad jobs config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read jobs config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }
}

impl HandlerOverride {
    fn apply(&self, mut spec: HandlerSpec) -> HandlerSpec {
        if let Some(size) = self.pool_size {
            spec.pool_size = size;
        }

        let (kind, attempts, base, max_delay) = match spec.policy {
            RetryPolicy::NoRetry => (PolicyKind::None, 1, Duration::from_secs(1), Duration::from_secs(300)),
            RetryPolicy::Fixed { attempts, delay } => (PolicyKind::Fixed, attempts, delay, delay),
            RetryPolicy::Fibonacci {
                attempts,
                base,
                max_delay,
            } => (PolicyKind::Fibonacci, attempts, base, max_delay),
        };
        let kind = self.policy.unwrap_or(kind);
        let attempts = self.max_attempts.unwrap_or(attempts);
        let base = self.base_delay_ms.map(Duration::from_millis).unwrap_or(base);
        let max_delay = self.max_delay_ms.map(Duration::from_millis).unwrap_or(max_delay);

        spec.policy = match kind {
            PolicyKind::None => RetryPolicy::NoRetry,
            PolicyKind::Fixed => RetryPolicy::Fixed {
                attempts,
                delay: base,
            },
            PolicyKind::Fibonacci => RetryPolicy::Fibonacci {
                attempts,
                base,
                max_delay: max_delay.max(base),
            },
        };
        spec
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A registered handler with its resolved pool and policy.
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn JobHandler>,
    pub pool: String,
    pub policy: RetryPolicy,
}

struct Pool {
    size: usize,
    permits: Arc<Semaphore>,
}

/// Registry of job handlers, indexed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
    pools: HashMap<String, Pool>,
    overrides: JobsConfig,
}

impl HandlerRegistry {
    /// Create an empty registry with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose registrations are adjusted by `overrides`.
    pub fn with_overrides(overrides: JobsConfig) -> Self {
        Self {
            overrides,
            ..Self::default()
        }
    }

    /// Register `handler` under `name`. A second registration replaces the first.
    ///
    /// The first handler to name a shared pool fixes its size.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        spec: HandlerSpec,
    ) -> &mut Self {
        let name = name.into();
        let spec = match self.overrides.handlers.get(&name) {
            Some(o) => o.apply(spec),
            None => spec,
        };
        let pool = spec.pool.clone().unwrap_or_else(|| name.clone());
        let size = spec.pool_size.max(1);

        self.pools.entry(pool.clone()).or_insert_with(|| Pool {
            size,
            permits: Arc::new(Semaphore::new(size)),
        });
        debug!(handler = %name, %pool, pool_size = size, policy = ?spec.policy, "registered job handler");

        self.handlers.insert(
            name,
            Registration {
                handler,
                pool,
                policy: spec.policy,
            },
        );
        self
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.handlers.get(name)
    }

    pub fn permits(&self, pool: &str) -> Option<Arc<Semaphore>> {
        self.pools.get(pool).map(|p| Arc::clone(&p.permits))
    }

    pub fn pool_size(&self, pool: &str) -> Option<usize> {
        self.pools.get(pool).map(|p| p.size)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
