//! Append-only usage ledger.
//!
//! Every admitted request produces exactly one immutable usage record.
//! The append and the running aggregates update under one lock, so a
//! reader can never observe a record without its contribution to the
//! totals or vice versa. A bounded channel feeds an optional Postgres
//! sink for durable history; sink pressure drops are counted, never
//! blocking the request path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::UsageConfig;
use crate::core::metrics::try_get_metrics;

/// One immutable ledger entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub request_id: String,
    pub identity: String,
    pub action: String,
    pub provider: Option<String>,
    pub cache_hit: bool,
    pub cost_micros: u64,
    pub savings_micros: u64,
    pub fee_micros: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Fields the controller supplies for a new record.
#[derive(Debug, Clone)]
pub struct UsageDraft {
    pub request_id: String,
    pub identity: String,
    pub action: String,
    pub provider: Option<String>,
    pub cache_hit: bool,
    pub cost_micros: u64,
    pub savings_micros: u64,
    pub fee_micros: u64,
}

/// Running totals for one identity.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityUsage {
    pub requests: u64,
    pub cache_hits: u64,
    pub cost_micros: u64,
    pub savings_micros: u64,
    pub fee_micros: u64,
}

/// Totals across all identities.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalUsage {
    pub requests: u64,
    pub cache_hits: u64,
    pub cost_micros: u64,
    pub savings_micros: u64,
    pub fee_micros: u64,
    pub identities: usize,
}

struct LedgerInner {
    log: VecDeque<UsageRecord>,
    identities: HashMap<String, IdentityUsage>,
    global: GlobalUsage,
}

pub struct UsageRecorder {
    inner: Mutex<LedgerInner>,
    sink: Option<UsageSink>,
    history_limit: usize,
    recent_limit: usize,
}

impl UsageRecorder {
    pub fn new(config: &UsageConfig, sink: Option<UsageSink>) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                log: VecDeque::with_capacity(config.history_limit.min(1024)),
                identities: HashMap::new(),
                global: GlobalUsage::default(),
            }),
            sink,
            history_limit: config.history_limit.max(1),
            recent_limit: config.recent_limit.max(1),
        }
    }

    /// Append a record and fold it into the aggregates. Returns the
    /// record id.
    pub fn record(&self, draft: UsageDraft) -> Uuid {
        let record = UsageRecord {
            id: Uuid::new_v4(),
            request_id: draft.request_id,
            identity: draft.identity,
            action: draft.action,
            provider: draft.provider,
            cache_hit: draft.cache_hit,
            cost_micros: draft.cost_micros,
            savings_micros: draft.savings_micros,
            fee_micros: draft.fee_micros,
            recorded_at: Utc::now(),
        };
        let id = record.id;

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.log.push_back(record.clone());
            while inner.log.len() > self.history_limit {
                inner.log.pop_front();
            }

            let totals = inner.identities.entry(record.identity.clone()).or_default();
            totals.requests += 1;
            if record.cache_hit {
                totals.cache_hits += 1;
            }
            totals.cost_micros += record.cost_micros;
            totals.savings_micros += record.savings_micros;
            totals.fee_micros += record.fee_micros;

            inner.global.requests += 1;
            if record.cache_hit {
                inner.global.cache_hits += 1;
            }
            inner.global.cost_micros += record.cost_micros;
            inner.global.savings_micros += record.savings_micros;
            inner.global.fee_micros += record.fee_micros;
            inner.global.identities = inner.identities.len();
        }

        if let Some(metrics) = try_get_metrics() {
            metrics
                .usage_micro_usd
                .with_label_values(&["cost"])
                .inc_by(record.cost_micros);
            metrics
                .usage_micro_usd
                .with_label_values(&["savings"])
                .inc_by(record.savings_micros);
            metrics
                .usage_micro_usd
                .with_label_values(&["fee"])
                .inc_by(record.fee_micros);
        }

        if let Some(sink) = &self.sink {
            sink.submit(record);
        }
        id
    }

    pub fn identity_usage(&self, identity: &str) -> IdentityUsage {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.identities.get(identity).copied().unwrap_or_default()
    }

    pub fn global_usage(&self) -> GlobalUsage {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.global
    }

    /// Total cost for an identity. `window = None` reads the running
    /// totals; a window derives the sum from the retained log.
    pub fn sum_cost_micros(&self, identity: &str, window: Option<Duration>) -> u64 {
        match window {
            None => self.identity_usage(identity).cost_micros,
            Some(window) => self.windowed_sum(identity, window, |r| r.cost_micros),
        }
    }

    /// Total savings for an identity, with the same window semantics as
    /// [`Self::sum_cost_micros`].
    pub fn sum_savings_micros(&self, identity: &str, window: Option<Duration>) -> u64 {
        match window {
            None => self.identity_usage(identity).savings_micros,
            Some(window) => self.windowed_sum(identity, window, |r| r.savings_micros),
        }
    }

    /// Most recent records, newest first, optionally filtered to one
    /// identity.
    pub fn recent(&self, identity: Option<&str>) -> Vec<UsageRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .log
            .iter()
            .rev()
            .filter(|r| identity.map_or(true, |id| r.identity == id))
            .take(self.recent_limit)
            .cloned()
            .collect()
    }

    /// Drain the durable sink, if one is attached.
    pub async fn shutdown(&self) {
        if let Some(sink) = &self.sink {
            sink.shutdown().await;
        }
    }

    fn windowed_sum(
        &self,
        identity: &str,
        window: Duration,
        amount: fn(&UsageRecord) -> u64,
    ) -> u64 {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .log
            .iter()
            .filter(|r| r.identity == identity && r.recorded_at >= cutoff)
            .map(amount)
            .sum()
    }
}

const USAGE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS gateway_usage (
    id             TEXT PRIMARY KEY,
    request_id     TEXT NOT NULL,
    identity       TEXT NOT NULL,
    action         TEXT NOT NULL,
    provider       TEXT,
    cache_hit      BOOLEAN NOT NULL,
    cost_micros    BIGINT NOT NULL,
    savings_micros BIGINT NOT NULL,
    fee_micros     BIGINT NOT NULL,
    recorded_at    TIMESTAMPTZ NOT NULL
)
"#;

const USAGE_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS idx_gateway_usage_identity_recorded \
     ON gateway_usage (identity, recorded_at)";

/// Durable sink: bounded queue into a batching Postgres writer.
pub struct UsageSink {
    tx: Mutex<Option<mpsc::Sender<UsageRecord>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl UsageSink {
    pub fn new(pool: PgPool, config: &UsageConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(Self::writer_task(
            rx,
            pool,
            config.flush_batch_size.max(1),
            Duration::from_secs(config.flush_interval_secs.max(1)),
            done_tx,
        ));
        Self {
            tx: Mutex::new(Some(tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    fn submit(&self, record: UsageRecord) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => {
                if tx.try_send(record).is_err() {
                    warn!("usage sink queue full, dropping record");
                    Self::count_drop("queue_full", 1);
                }
            }
            None => Self::count_drop("closed", 1),
        }
    }

    /// Drop the sender so the writer flushes its buffer and exits, then
    /// wait for it to finish.
    pub async fn shutdown(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(tx);

        let done_rx = self
            .done_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(done_rx) = done_rx {
            if tokio::time::timeout(Duration::from_secs(5), done_rx)
                .await
                .is_err()
            {
                warn!("usage sink writer did not stop within 5s");
            }
        }
    }

    async fn writer_task(
        mut rx: mpsc::Receiver<UsageRecord>,
        pool: PgPool,
        batch_size: usize,
        flush_interval: Duration,
        done_tx: oneshot::Sender<()>,
    ) {
        if let Err(e) = Self::ensure_schema(&pool).await {
            error!("failed to prepare usage table: {e}");
        }

        let mut buffer: Vec<UsageRecord> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                maybe_record = rx.recv() => {
                    match maybe_record {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= batch_size {
                                Self::flush(&pool, &mut buffer).await;
                            }
                        }
                        None => {
                            Self::flush(&pool, &mut buffer).await;
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        Self::flush(&pool, &mut buffer).await;
                    }
                }
            }
        }

        info!("usage sink writer stopped");
        let _ = done_tx.send(());
    }

    async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query(USAGE_SCHEMA_SQL).execute(pool).await?;
        sqlx::query(USAGE_INDEX_SQL).execute(pool).await?;
        Ok(())
    }

    async fn flush(pool: &PgPool, buffer: &mut Vec<UsageRecord>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len();
        let cols = 10;
        let mut sql = String::from(
            "INSERT INTO gateway_usage (\
             id, request_id, identity, action, provider, cache_hit, \
             cost_micros, savings_micros, fee_micros, recorded_at\
             ) VALUES ",
        );

        for i in 0..count {
            if i > 0 {
                sql.push_str(", ");
            }
            let base = i * cols + 1;
            sql.push('(');
            for j in 0..cols {
                if j > 0 {
                    sql.push_str(", ");
                }
                sql.push('$');
                sql.push_str(&(base + j).to_string());
            }
            sql.push(')');
        }
        sql.push_str(" ON CONFLICT (id) DO NOTHING");

        let mut query = sqlx::query(&sql);
        for record in buffer.drain(..) {
            query = query
                .bind(record.id.to_string())
                .bind(record.request_id)
                .bind(record.identity)
                .bind(record.action)
                .bind(record.provider)
                .bind(record.cache_hit)
                .bind(record.cost_micros as i64)
                .bind(record.savings_micros as i64)
                .bind(record.fee_micros as i64)
                .bind(record.recorded_at);
        }

        if let Err(e) = query.execute(pool).await {
            error!("failed to flush usage records to database: {e}");
            Self::count_drop("db_error", count as u64);
        }
    }

    fn count_drop(reason: &str, amount: u64) {
        if let Some(metrics) = try_get_metrics() {
            metrics
                .usage_sink_dropped
                .with_label_values(&[reason])
                .inc_by(amount);
        }
    }
}
