//! PostgreSQL implementation of WarmingQueue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_core::config::QueuePolicy;
use ember_core::ids::QueueItemId;
use ember_core::ports::WarmingQueue;
use ember_core::queue::{
    ClaimFilter, EnqueueOutcome, EnqueueRequest, FailOutcome, Priority, QueueStats, QueueStatus,
    WarmingQueueItem,
};
use ember_core::{Error, Result};
use sqlx::{PgPool, Row};

const ITEM_COLUMNS: &str = "id, contract_address, network, cache_type, priority, status, retry_count, scheduled_at, claimed_at, completed_at, last_error, last_failed_at, created_at";

/// PostgreSQL implementation of WarmingQueue.
pub struct PgWarmingQueue {
    pool: PgPool,
    policy: QueuePolicy,
}

impl PgWarmingQueue {
    /// Create a new PgWarmingQueue with the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            policy: QueuePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn row_to_item(&self, r: &sqlx::postgres::PgRow) -> Result<WarmingQueueItem> {
        let cache_type: String = r.get("cache_type");
        let status: String = r.get("status");

        Ok(WarmingQueueItem {
            id: QueueItemId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            contract_address: r.get("contract_address"),
            network: r.get("network"),
            cache_type: cache_type.parse()?,
            priority: Priority::from_rank(r.get::<i16, _>("priority")),
            status: status.parse()?,
            retry_count: r.get::<i32, _>("retry_count") as u32,
            scheduled_at: r.get("scheduled_at"),
            claimed_at: r.get("claimed_at"),
            completed_at: r.get("completed_at"),
            last_error: r.get("last_error"),
            last_failed_at: r.get("last_failed_at"),
            created_at: r.get("created_at"),
        })
    }

    /// Explain why a conditional update on `id` matched nothing.
    async fn transition_error(&self, id: QueueItemId, to: QueueStatus) -> Error {
        match self.get(id).await {
            Ok(Some(item)) => Error::InvalidTransition {
                id: id.to_string(),
                from: item.status.to_string(),
                to: to.to_string(),
            },
            Ok(None) => Error::QueueItemNotFound(id.to_string()),
            Err(e) => e,
        }
    }

    async fn record_failure(&self, id: QueueItemId, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM warming_queue WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::QueueItemNotFound(id.to_string()))?;

        let mut item = self.row_to_item(&row)?;
        if item.status != QueueStatus::Processing {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: item.status.to_string(),
                to: QueueStatus::Failed.to_string(),
            });
        }

        let outcome = item.record_failure(error, retryable, &self.policy, Utc::now());

        sqlx::query(
            r#"UPDATE warming_queue
               SET status = $2, retry_count = $3, scheduled_at = $4, claimed_at = $5,
                   completed_at = $6, last_error = $7, last_failed_at = $8
               WHERE id = $1"#,
        )
        .bind(id.as_uuid())
        .bind(item.status.as_str())
        .bind(item.retry_count as i32)
        .bind(item.scheduled_at)
        .bind(item.claimed_at)
        .bind(item.completed_at)
        .bind(&item.last_error)
        .bind(item.last_failed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(outcome)
    }
}

#[async_trait]
impl WarmingQueue for PgWarmingQueue {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome> {
        let address = ember_core::normalize_address(&request.contract_address);

        // The active item may finish between the insert and the lookup; one
        // more insert then succeeds.
        for _ in 0..2 {
            let item = WarmingQueueItem::from_request(request, Utc::now());
            let inserted = sqlx::query(
                r#"INSERT INTO warming_queue
                       (id, contract_address, network, cache_type, priority, status, retry_count, scheduled_at, created_at)
                   VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7)
                   ON CONFLICT (contract_address, network, cache_type)
                       WHERE status IN ('pending', 'processing')
                       DO NOTHING
                   RETURNING id"#,
            )
            .bind(item.id.as_uuid())
            .bind(&address)
            .bind(&item.network)
            .bind(item.cache_type.as_str())
            .bind(item.priority.rank())
            .bind(item.scheduled_at)
            .bind(item.created_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            if inserted.is_some() {
                return Ok(EnqueueOutcome {
                    id: item.id,
                    deduped: false,
                });
            }

            let existing = sqlx::query(
                r#"SELECT id FROM warming_queue
                   WHERE contract_address = $1 AND network = $2 AND cache_type = $3
                     AND status IN ('pending', 'processing')"#,
            )
            .bind(&address)
            .bind(&item.network)
            .bind(item.cache_type.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            if let Some(r) = existing {
                return Ok(EnqueueOutcome {
                    id: QueueItemId::from_uuid(r.get::<uuid::Uuid, _>("id")),
                    deduped: true,
                });
            }
        }

        Err(Error::Internal(format!(
            "enqueue of {address} on {} kept conflicting",
            request.network
        )))
    }

    async fn claim_batch(&self, limit: usize, filter: &ClaimFilter) -> Result<Vec<WarmingQueueItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"UPDATE warming_queue SET status = 'processing', claimed_at = $1
               WHERE status = 'pending' AND id IN (
                   SELECT id FROM warming_queue
                   WHERE status = 'pending'
                     AND scheduled_at <= $1
                     AND ($2::text IS NULL OR network = $2)
                     AND ($3::smallint IS NULL OR priority = $3)
                     AND NOT COALESCE((SELECT paused FROM warming_queue_control WHERE id), FALSE)
                   ORDER BY priority DESC, scheduled_at ASC
                   LIMIT $4
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING {ITEM_COLUMNS}"#
        ))
        .bind(Utc::now())
        .bind(filter.network.as_deref())
        .bind(filter.priority.map(|p| p.rank()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut items = rows
            .iter()
            .map(|r| self.row_to_item(r))
            .collect::<Result<Vec<_>>>()?;
        items.sort_by(|a, b| a.claim_order(b));

        if !items.is_empty() {
            tracing::debug!(claimed = items.len(), "claimed warming queue items");
        }
        Ok(items)
    }

    async fn complete(&self, id: QueueItemId) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE warming_queue SET status = 'completed', completed_at = $2 WHERE id = $1 AND status = 'processing'",
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, QueueStatus::Completed).await);
        }
        Ok(())
    }

    async fn fail(&self, id: QueueItemId, error: &str) -> Result<FailOutcome> {
        self.record_failure(id, error, true).await
    }

    async fn fail_permanently(&self, id: QueueItemId, error: &str) -> Result<FailOutcome> {
        self.record_failure(id, error, false).await
    }

    async fn release(&self, id: QueueItemId) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE warming_queue SET status = 'pending', claimed_at = NULL WHERE id = $1 AND status = 'processing'",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, QueueStatus::Pending).await);
        }
        Ok(())
    }

    async fn reset_stuck(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.policy.processing_timeout();
        let updated = sqlx::query(
            "UPDATE warming_queue SET status = 'pending', claimed_at = NULL WHERE status = 'processing' AND claimed_at <= $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let count = updated.rows_affected();
        if count > 0 {
            tracing::warn!(count, "reset stuck warming queue items");
        }
        Ok(count)
    }

    async fn pause(&self) -> Result<()> {
        set_paused(&self.pool, true).await?;
        tracing::info!("warming queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        set_paused(&self.pool, false).await?;
        tracing::info!("warming queue resumed");
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COALESCE((SELECT paused FROM warming_queue_control WHERE id), FALSE) AS paused",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get("paused"))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM warming_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        for r in &rows {
            let status: String = r.get("status");
            let count = r.get::<i64, _>("count") as u64;
            stats.total += count;
            match status.parse::<QueueStatus>()? {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Completed => stats.completed = count,
                QueueStatus::Failed => stats.failed = count,
            }
        }

        let rows = sqlx::query(
            "SELECT priority, COUNT(*) AS count FROM warming_queue WHERE status = 'pending' GROUP BY priority",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        for r in &rows {
            let priority = Priority::from_rank(r.get::<i16, _>("priority"));
            stats
                .by_priority
                .insert(priority.to_string(), r.get::<i64, _>("count") as u64);
        }

        let rows = sqlx::query(
            "SELECT network, COUNT(*) AS count FROM warming_queue WHERE status = 'pending' GROUP BY network",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        for r in &rows {
            stats
                .by_network
                .insert(r.get("network"), r.get::<i64, _>("count") as u64);
        }

        let row = sqlx::query(
            r#"SELECT AVG(EXTRACT(EPOCH FROM (completed_at - claimed_at)))::float8 AS avg_seconds
               FROM warming_queue
               WHERE status = 'completed' AND claimed_at IS NOT NULL AND completed_at IS NOT NULL"#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        let avg_seconds: Option<f64> = row.get("avg_seconds");

        stats.paused = self.is_paused().await?;
        Ok(stats.finish(avg_seconds))
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<WarmingQueueItem>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM warming_queue WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_item(&r)?)),
            None => Ok(None),
        }
    }

    async fn recent_failures(
        &self,
        network: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT contract_address, MAX(last_failed_at) AS last_failed
               FROM warming_queue
               WHERE network = $1 AND last_failed_at >= $2
               GROUP BY contract_address
               ORDER BY last_failed DESC
               LIMIT $3"#,
        )
        .bind(network)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("contract_address")).collect())
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            r#"DELETE FROM warming_queue
               WHERE status IN ('completed', 'failed')
                 AND COALESCE(completed_at, created_at) < $1"#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(deleted.rows_affected())
    }
}

async fn set_paused(pool: &PgPool, paused: bool) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO warming_queue_control (id, paused, updated_at) VALUES (TRUE, $1, NOW())
           ON CONFLICT (id) DO UPDATE SET paused = EXCLUDED.paused, updated_at = NOW()"#,
    )
    .bind(paused)
    .execute(pool)
    .await
    .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}
