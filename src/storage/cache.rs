//! `CacheStore` on SQLite. Expired rows are evicted when read.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use super::{Storage, millis};
use crate::cache::{CacheScope, CacheStore};
use crate::clock;
use crate::error::Result;

#[async_trait]
impl CacheStore for Storage {
    async fn get(&self, scope: &CacheScope, key: &str) -> Result<Option<serde_json::Value>> {
        let now = millis(self.now());
        let namespace = scope.namespace();
        self.with_conn(|conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache WHERE scope = ?1 AND key = ?2",
                    params![namespace, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((value, expires_at)) if expires_at > now => Ok(Some(serde_json::from_str(&value)?)),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM cache WHERE scope = ?1 AND key = ?2 AND expires_at <= ?3",
                        params![namespace, key, now],
                    )?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    async fn set(
        &self,
        scope: &CacheScope,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = millis(clock::after(self.now(), ttl));
        let raw = serde_json::to_string(&value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache (scope, key, value, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (scope, key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at",
                params![scope.namespace(), key, raw, expires_at],
            )?;
            Ok(())
        })
    }

    async fn set_if_absent(
        &self,
        scope: &CacheScope,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.now();
        let expires_at = millis(clock::after(now, ttl));
        let raw = serde_json::to_string(&value)?;
        self.with_conn(|conn| {
            // An expired row is as good as absent: the upsert only overwrites those.
            let written = conn.execute(
                "INSERT INTO cache (scope, key, value, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (scope, key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at
                 WHERE cache.expires_at <= ?5",
                params![scope.namespace(), key, raw, expires_at, millis(now)],
            )?;
            Ok(written == 1)
        })
    }

    async fn invalidate(&self, scope: &CacheScope, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache WHERE scope = ?1 AND key = ?2",
                params![scope.namespace(), key],
            )?;
            Ok(())
        })
    }
}
