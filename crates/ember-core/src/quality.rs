//! Cache quality scoring.
//!
//! A score is a weighted average of three components, each in `[0, 1]`:
//!
//! - **completeness**: share of the required payload fields that are present
//!   and non-empty for the cache type,
//! - **freshness**: `1 - age / ttl`, floored at zero,
//! - **verification**: 1 when the explorer reports verified source, else 0.
//!
//! The weights come from configuration so scoring can be tuned per deployment.

use crate::cache::{CacheType, clamp_score};
use crate::fetch::FetchMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub completeness: f64,
    pub freshness: f64,
    pub verification: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.5,
            freshness: 0.2,
            verification: 0.3,
        }
    }
}

impl QualityWeights {
    /// Score a payload. Pure: the same inputs always give the same score.
    pub fn score(
        &self,
        cache_type: CacheType,
        payload: &Value,
        meta: &FetchMeta,
        ttl_hours: i64,
        now: DateTime<Utc>,
    ) -> f64 {
        let total = self.completeness.max(0.0) + self.freshness.max(0.0) + self.verification.max(0.0);
        if total <= 0.0 {
            return 0.0;
        }

        let verification = if meta.verified { 1.0 } else { 0.0 };
        let weighted = self.completeness.max(0.0) * completeness(cache_type, payload)
            + self.freshness.max(0.0) * freshness(meta.fetched_at, ttl_hours, now)
            + self.verification.max(0.0) * verification;

        clamp_score(weighted / total)
    }
}

/// Payload fields a complete entry of each type carries.
pub fn required_fields(cache_type: CacheType) -> &'static [&'static str] {
    match cache_type {
        CacheType::Source => &["source_code", "abi", "compiler_version", "contract_name"],
        CacheType::Abi => &["abi"],
        CacheType::Creation => &["creator_address", "creation_tx_hash"],
    }
}

/// Share of required fields present and non-empty.
pub fn completeness(cache_type: CacheType, payload: &Value) -> f64 {
    let fields = required_fields(cache_type);
    let present = fields
        .iter()
        .filter(|field| payload.get(**field).is_some_and(is_present))
        .count();
    present as f64 / fields.len() as f64
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// `1 - age / ttl`, floored at zero. A non-positive TTL is never fresh.
pub fn freshness(fetched_at: DateTime<Utc>, ttl_hours: i64, now: DateTime<Utc>) -> f64 {
    if ttl_hours <= 0 {
        return 0.0;
    }
    let age_secs = (now - fetched_at).num_seconds().max(0) as f64;
    let ttl_secs = crate::config::bounded_hours(ttl_hours).num_seconds() as f64;
    (1.0 - age_secs / ttl_secs).max(0.0)
}
