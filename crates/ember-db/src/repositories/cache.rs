//! PostgreSQL implementation of CacheStore.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ember_core::cache::{
    CacheEntry, CacheRead, CacheStats, CacheType, CleanupReport, CleanupRule, StatsFilter,
};
use ember_core::config::CachePolicy;
use ember_core::ports::CacheStore;
use ember_core::{Error, Result};
use sqlx::{PgPool, Row};

const ENTRY_COLUMNS: &str = "network, address, cache_type, payload, fetched_at, ttl_hours, quality_score, verified, hit_count, api_calls_saved, size_bytes";

/// PostgreSQL implementation of CacheStore.
pub struct PgCacheStore {
    pool: PgPool,
    policy: CachePolicy,
}

impl PgCacheStore {
    /// Create a new PgCacheStore with the default cache policy.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            policy: CachePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn row_to_entry(&self, r: &sqlx::postgres::PgRow) -> Result<CacheEntry> {
        let cache_type: String = r.get("cache_type");

        Ok(CacheEntry {
            network: r.get("network"),
            address: r.get("address"),
            cache_type: cache_type.parse()?,
            payload: r.get("payload"),
            fetched_at: r.get("fetched_at"),
            ttl_hours: r.get("ttl_hours"),
            quality_score: r.get("quality_score"),
            verified: r.get("verified"),
            hit_count: r.get::<i64, _>("hit_count") as u64,
            api_calls_saved: r.get::<i64, _>("api_calls_saved") as u64,
            size_bytes: r.get::<i64, _>("size_bytes") as u64,
        })
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn get(
        &self,
        network: &str,
        address: &str,
        cache_type: CacheType,
        read: CacheRead,
    ) -> Result<Option<CacheEntry>> {
        let address = ember_core::normalize_address(address);
        let sql = match read {
            CacheRead::Peek => format!(
                "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE network = $1 AND address = $2 AND cache_type = $3"
            ),
            CacheRead::Hit => format!(
                r#"UPDATE cache_entries
                   SET hit_count = hit_count + 1, api_calls_saved = api_calls_saved + 1, updated_at = NOW()
                   WHERE network = $1 AND address = $2 AND cache_type = $3
                   RETURNING {ENTRY_COLUMNS}"#
            ),
        };

        let row = sqlx::query(&sql)
            .bind(network)
            .bind(&address)
            .bind(cache_type.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_entry(&r)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let result = sqlx::query(
            r#"INSERT INTO cache_entries
                   (network, address, cache_type, payload, fetched_at, ttl_hours, expires_at,
                    quality_score, verified, hit_count, api_calls_saved, size_bytes, low_quality_since)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                       CASE WHEN $8 < $13 THEN $5 ELSE NULL END)
               ON CONFLICT (network, address, cache_type) DO UPDATE SET
                   payload = EXCLUDED.payload,
                   fetched_at = EXCLUDED.fetched_at,
                   ttl_hours = EXCLUDED.ttl_hours,
                   expires_at = EXCLUDED.expires_at,
                   quality_score = EXCLUDED.quality_score,
                   verified = EXCLUDED.verified,
                   hit_count = GREATEST(cache_entries.hit_count, EXCLUDED.hit_count),
                   api_calls_saved = GREATEST(cache_entries.api_calls_saved, EXCLUDED.api_calls_saved),
                   size_bytes = EXCLUDED.size_bytes,
                   low_quality_since = CASE
                       WHEN EXCLUDED.quality_score >= $13 THEN NULL
                       ELSE COALESCE(cache_entries.low_quality_since, EXCLUDED.low_quality_since)
                   END,
                   updated_at = NOW()
               WHERE cache_entries.fetched_at <= EXCLUDED.fetched_at"#,
        )
        .bind(&entry.network)
        .bind(ember_core::normalize_address(&entry.address))
        .bind(entry.cache_type.as_str())
        .bind(&entry.payload)
        .bind(entry.fetched_at)
        .bind(entry.ttl_hours)
        .bind(entry.expires_at())
        .bind(ember_core::cache::clamp_score(entry.quality_score))
        .bind(entry.verified)
        .bind(entry.hit_count as i64)
        .bind(entry.api_calls_saved as i64)
        .bind(entry.size_bytes as i64)
        .bind(self.policy.low_quality_floor)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                network = %entry.network,
                address = %entry.address,
                cache_type = %entry.cache_type,
                "stored entry is newer, write ignored"
            );
        }

        Ok(())
    }

    async fn stats(&self, filter: &StatsFilter) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"SELECT
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE expires_at > $3) AS active,
                   COUNT(*) FILTER (WHERE expires_at <= $3) AS expired,
                   COUNT(*) FILTER (WHERE quality_score < $4) AS low_quality,
                   COALESCE(AVG(quality_score), 0)::float8 AS avg_quality,
                   COALESCE(SUM(hit_count), 0)::bigint AS total_hits,
                   COALESCE(SUM(api_calls_saved), 0)::bigint AS total_saved,
                   COALESCE(SUM(size_bytes), 0)::bigint AS total_size
               FROM cache_entries
               WHERE ($1::text IS NULL OR network = $1)
                 AND ($2::text IS NULL OR cache_type = $2)"#,
        )
        .bind(filter.network.as_deref())
        .bind(filter.cache_type.map(|t| t.as_str()))
        .bind(Utc::now())
        .bind(self.policy.low_quality_floor)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(CacheStats {
            total_entries: row.get::<i64, _>("total") as u64,
            active_entries: row.get::<i64, _>("active") as u64,
            expired_entries: row.get::<i64, _>("expired") as u64,
            low_quality_entries: row.get::<i64, _>("low_quality") as u64,
            avg_quality: row.get("avg_quality"),
            total_hits: row.get::<i64, _>("total_hits") as u64,
            total_api_calls_saved: row.get::<i64, _>("total_saved") as u64,
            total_size_bytes: row.get::<i64, _>("total_size") as u64,
        })
    }

    async fn cleanup(&self, aggressive: bool) -> Result<CleanupReport> {
        let rule = CleanupRule::new(&self.policy, aggressive, Utc::now());

        let row = sqlx::query(
            r#"WITH deleted AS (
                   DELETE FROM cache_entries
                   WHERE expires_at < $1
                      OR (quality_score < $2
                          AND ($4 OR (low_quality_since IS NOT NULL AND low_quality_since < $3)))
                   RETURNING size_bytes
               )
               SELECT COUNT(*) AS deleted, COALESCE(SUM(size_bytes), 0)::bigint AS bytes_freed
               FROM deleted"#,
        )
        .bind(rule.expired_before)
        .bind(rule.low_quality_floor)
        .bind(rule.low_quality_before)
        .bind(rule.aggressive)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let report = CleanupReport {
            deleted: row.get::<i64, _>("deleted") as u64,
            bytes_freed: row.get::<i64, _>("bytes_freed") as u64,
        };
        tracing::info!(
            deleted = report.deleted,
            bytes_freed = report.bytes_freed,
            aggressive,
            "cache cleanup finished"
        );
        Ok(report)
    }

    async fn expiring_within(
        &self,
        network: &str,
        cache_type: CacheType,
        within: Duration,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {ENTRY_COLUMNS} FROM cache_entries
               WHERE network = $1 AND cache_type = $2 AND expires_at < $3
               ORDER BY expires_at ASC
               LIMIT $4"#
        ))
        .bind(network)
        .bind(cache_type.as_str())
        .bind(Utc::now() + within)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_entry(r)).collect()
    }

    async fn hit_count_percentile(
        &self,
        network: &str,
        cache_type: CacheType,
        percentile: f64,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"SELECT COALESCE(percentile_disc($3) WITHIN GROUP (ORDER BY hit_count), 0)::bigint AS threshold
               FROM cache_entries WHERE network = $1 AND cache_type = $2"#,
        )
        .bind(network)
        .bind(cache_type.as_str())
        .bind(percentile.clamp(0.0, 1.0))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("threshold") as u64)
    }

    async fn most_accessed(
        &self,
        network: &str,
        cache_type: CacheType,
        min_hits: u64,
        expiring_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {ENTRY_COLUMNS} FROM cache_entries
               WHERE network = $1 AND cache_type = $2
                 AND hit_count >= $3 AND hit_count > 0 AND expires_at < $4
               ORDER BY hit_count DESC, expires_at ASC
               LIMIT $5"#
        ))
        .bind(network)
        .bind(cache_type.as_str())
        .bind(min_hits as i64)
        .bind(expiring_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_entry(r)).collect()
    }
}
