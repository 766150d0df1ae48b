//! PostgreSQL implementation of UsageLog.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_core::ids::{ReservationId, UsageEventId};
use ember_core::ports::UsageLog;
use ember_core::quota::{QuotaReservation, UsageCounts, UsageEvent, grantable, start_of_day, window_bounds};
use ember_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of UsageLog.
pub struct PgUsageLog {
    pool: PgPool,
}

impl PgUsageLog {
    /// Create a new PgUsageLog.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLog for PgUsageLog {
    async fn append(&self, event: &UsageEvent) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO api_usage_events
                   (id, network, provider, success, contract_address, response_time_ms, error_kind,
                    reservation_id, occurred_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(UsageEventId::new().as_uuid())
        .bind(&event.network)
        .bind(&event.provider)
        .bind(event.success)
        .bind(&event.contract_address)
        .bind(event.response_time_ms.map(|ms| ms as i64))
        .bind(event.error_kind.map(|k| k.as_str()))
        .bind(event.reservation_id.map(|id| *id.as_uuid()))
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn counts(&self, network: &str, provider: &str, now: DateTime<Utc>) -> Result<UsageCounts> {
        let (minute, hour, day) = window_bounds(now);

        let row = sqlx::query(
            r#"SELECT
                   COUNT(*) FILTER (WHERE occurred_at >= $3) AS last_minute,
                   COUNT(*) FILTER (WHERE occurred_at >= $4) AS last_hour,
                   COUNT(*) FILTER (WHERE occurred_at >= $4 AND NOT success) AS errors_last_hour,
                   COUNT(*) FILTER (WHERE occurred_at >= $5) AS today
               FROM api_usage_events
               WHERE network = $1 AND provider = $2
                 AND occurred_at >= LEAST($4, $5) AND occurred_at <= $6"#,
        )
        .bind(network)
        .bind(provider)
        .bind(minute)
        .bind(hour)
        .bind(day)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(UsageCounts {
            requests_last_minute: row.get::<i64, _>("last_minute") as u64,
            requests_last_hour: row.get::<i64, _>("last_hour") as u64,
            errors_last_hour: row.get::<i64, _>("errors_last_hour") as u64,
            used_today: row.get::<i64, _>("today") as u64,
        })
    }

    async fn active_pairs(&self, since: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT network, provider FROM api_usage_events WHERE occurred_at >= $1 ORDER BY network, provider",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| (r.get("network"), r.get("provider")))
            .collect())
    }

    async fn recent_addresses(
        &self,
        network: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT contract_address, MAX(occurred_at) AS last_seen
               FROM api_usage_events
               WHERE network = $1 AND occurred_at >= $2 AND contract_address IS NOT NULL
               GROUP BY contract_address
               ORDER BY last_seen DESC
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

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = cutoff.min(start_of_day(Utc::now()));
        let deleted = sqlx::query("DELETE FROM api_usage_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(deleted.rows_affected())
    }

    async fn reserve(
        &self,
        network: &str,
        provider: &str,
        requested: u64,
        budget: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<QuotaReservation> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // Serializes reservations per pair; appends are not blocked.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::TEXT || '/' || $2::TEXT))")
            .bind(network)
            .bind(provider)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"SELECT
                   (SELECT COUNT(*) FROM api_usage_events
                     WHERE network = $1 AND provider = $2 AND occurred_at >= $3) AS used_today,
                   (SELECT COALESCE(SUM(GREATEST(r.granted - (
                               SELECT COUNT(*) FROM api_usage_events u WHERE u.reservation_id = r.id
                           ), 0)), 0)::BIGINT
                      FROM quota_reservations r
                     WHERE r.network = $1 AND r.provider = $2 AND r.expires_at > $4) AS held"#,
        )
        .bind(network)
        .bind(provider)
        .bind(start_of_day(now))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let used_today = row.get::<i64, _>("used_today") as u64;
        let held = row.get::<i64, _>("held") as u64;
        let reservation = QuotaReservation {
            id: ReservationId::new(),
            network: network.to_string(),
            provider: provider.to_string(),
            granted: grantable(requested, budget, used_today, held),
            expires_at,
        };

        if reservation.granted > 0 {
            sqlx::query(
                r#"INSERT INTO quota_reservations (id, network, provider, granted, expires_at)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(reservation.id.as_uuid())
            .bind(network)
            .bind(provider)
            .bind(reservation.granted.min(i64::MAX as u64) as i64)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| Error::Database(e.to_string()))?;
        tracing::debug!(
            network,
            provider,
            requested,
            granted = reservation.granted,
            used_today,
            held,
            "quota reserved"
        );
        Ok(reservation)
    }

    async fn release(&self, id: ReservationId) -> Result<()> {
        sqlx::query("DELETE FROM quota_reservations WHERE id = $1 OR expires_at <= NOW()")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
