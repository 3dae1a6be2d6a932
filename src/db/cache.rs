//! `CacheStore` on Postgres.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Db;
use crate::cache::{CacheScope, CacheStore};
use crate::clock;
use crate::error::Result;

#[async_trait]
impl CacheStore for Db {
    async fn get(&self, scope: &CacheScope, key: &str) -> Result<Option<serde_json::Value>> {
        let now = self.now();
        let namespace = scope.namespace();
        let row: Option<(serde_json::Value, DateTime<Utc>)> =
            sqlx::query_as("SELECT value, expires_at FROM cache WHERE scope = $1 AND key = $2")
                .bind(&namespace)
                .bind(key)
                .fetch_optional(self.pool())
                .await?;

        match row {
            Some((value, expires_at)) if expires_at > now => Ok(Some(value)),
            Some(_) => {
                sqlx::query("DELETE FROM cache WHERE scope = $1 AND key = $2 AND expires_at <= $3")
                    .bind(&namespace)
                    .bind(key)
                    .bind(now)
                    .execute(self.pool())
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        scope: &CacheScope,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache (scope, key, value, expires_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (scope, key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at",
        )
        .bind(scope.namespace())
        .bind(key)
        .bind(value)
        .bind(clock::after(self.now(), ttl))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        scope: &CacheScope,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.now();
        let written = sqlx::query(
            "INSERT INTO cache (scope, key, value, expires_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (scope, key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
             WHERE cache.expires_at <= $5",
        )
        .bind(scope.namespace())
        .bind(key)
        .bind(value)
        .bind(clock::after(now, ttl))
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(written.rows_affected() == 1)
    }

    async fn invalidate(&self, scope: &CacheScope, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache WHERE scope = $1 AND key = $2")
            .bind(scope.namespace())
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
