//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::cache::DEDUP_TTL;
use crate::engine::EngineConfig;
use crate::error::{Error, Result};

/// One external service the hub talks to.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub api_base: String,
    /// App-level token for reads (`HUB_<NAME>_TOKEN`). Writes use the acting user's credential.
    pub token: Option<SecretString>,
}

#[derive(Debug)]
pub struct Config {
    /// Base URL the hub is reachable at; webhook callbacks point here.
    pub public_url: String,
    /// Postgres when set, SQLite otherwise.
    pub database_url: Option<SecretString>,
    pub sqlite_path: PathBuf,
    pub listen_addr: String,
    pub recency_window: Duration,
    pub dedup_ttl: Duration,
    pub sync_call_timeout: Duration,
    pub jobs_config: Option<PathBuf>,
    pub services: Vec<ServiceConfig>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = EngineConfig::default();
        Ok(Self {
            public_url: required_var("HUB_PUBLIC_URL")?,
            database_url: optional_var("HUB_DATABASE_URL").map(SecretString::from),
            sqlite_path: optional_var("HUB_SQLITE_PATH")
                .unwrap_or_else(|| "hubsync.db".to_string())
                .into(),
            listen_addr: optional_var("HUB_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            recency_window: secs_var("HUB_RECENCY_WINDOW_SECS", defaults.recency_window)?,
            dedup_ttl: secs_var("HUB_DEDUP_TTL_SECS", DEDUP_TTL)?,
            sync_call_timeout: secs_var("HUB_SYNC_CALL_TIMEOUT_SECS", defaults.sync_call_timeout)?,
            jobs_config: optional_var("HUB_JOBS_CONFIG").map(PathBuf::from),
            services: match optional_var("HUB_SERVICES") {
                Some(raw) => parse_services(&raw)?,
                None => Vec::new(),
            },
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            recency_window: self.recency_window,
            dedup_ttl: self.dedup_ttl,
            sync_call_timeout: self.sync_call_timeout,
        }
    }
}

/// Parse `name=base_url[,name=base_url...]`. Each service may carry a
/// `HUB_<NAME>_TOKEN` read-only token.
pub fn parse_services(raw: &str) -> Result<Vec<ServiceConfig>> {
    let mut services: Vec<ServiceConfig> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, api_base) = entry
            .split_once('=')
            .map(|(n, u)| (n.trim(), u.trim()))
            .filter(|(n, u)| !n.is_empty() && !u.is_empty())
            .ok_or_else(|| Error::Config(format!("HUB_SERVICES entry {entry:?} is not name=base_url")))?;
        if services.iter().any(|s| s.name == name) {
            return Err(Error::Config(format!("service {name} configured twice")));
        }
        let token_var = format!("HUB_{}_TOKEN", name.to_ascii_uppercase().replace('-', "_"));
        services.push(ServiceConfig {
            name: name.to_string(),
            api_base: api_base.to_string(),
            token: optional_var(&token_var).map(SecretString::from),
        });
    }
    Ok(services)
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are the same.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{name} must be a whole number of seconds, got {raw:?}"))),
        None => Ok(default),
    }
}
