//! Durable cache tier backed by PostgreSQL.
//!
//! Entries survive restarts and are visible to every gateway instance
//! sharing the database. TTL is enforced in SQL so a stale row can never
//! be served, even before the periodic purge removes it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::tier::{CacheTier, TierEntry};

const ENSURE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS gateway_cache (
    storage_key TEXT PRIMARY KEY,
    payload     BYTEA NOT NULL,
    cost_micros BIGINT NOT NULL,
    owner       TEXT,
    created_at  TIMESTAMPTZ NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL,
    hits        BIGINT NOT NULL DEFAULT 0
)
"#;

const ENSURE_EXPIRY_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_gateway_cache_expires_at ON gateway_cache (expires_at)";

#[derive(Debug, FromRow)]
struct CacheRow {
    payload: Vec<u8>,
    cost_micros: i64,
    owner: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    hits: i64,
}

impl CacheRow {
    fn into_entry(self) -> TierEntry {
        TierEntry {
            payload: self.payload,
            cost_micros: self.cost_micros.max(0) as u64,
            owner: self.owner,
            created_at: self.created_at,
            expires_at: self.expires_at,
            hits: self.hits.max(0) as u64,
        }
    }
}

pub struct PostgresTier {
    pool: PgPool,
}

impl PostgresTier {
    /// Create the tier, creating the backing table if it does not exist.
    pub async fn new(pool: PgPool) -> anyhow::Result<Self> {
        sqlx::query(ENSURE_SCHEMA_SQL).execute(&pool).await?;
        sqlx::query(ENSURE_EXPIRY_INDEX_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CacheTier for PostgresTier {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<TierEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT payload, cost_micros, owner, created_at, expires_at, hits
            FROM gateway_cache
            WHERE storage_key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheRow::into_entry))
    }

    async fn put(&self, key: &str, entry: TierEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gateway_cache
                (storage_key, payload, cost_micros, owner, created_at, expires_at, hits)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (storage_key) DO UPDATE SET
                payload = EXCLUDED.payload,
                cost_micros = EXCLUDED.cost_micros,
                owner = EXCLUDED.owner,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                hits = EXCLUDED.hits
            "#,
        )
        .bind(key)
        .bind(&entry.payload)
        .bind(entry.cost_micros as i64)
        .bind(&entry.owner)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .bind(entry.hits as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_hit(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE gateway_cache SET hits = hits + 1 WHERE storage_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM gateway_cache WHERE storage_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM gateway_cache WHERE expires_at > NOW()")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    async fn purge_expired(&self) -> anyhow::Result<usize> {
        let result = sqlx::query("DELETE FROM gateway_cache WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
