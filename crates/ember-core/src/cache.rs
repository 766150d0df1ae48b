//! Cache entry types.

use crate::config::{CachePolicy, bounded_hours};
use crate::error::Error;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of explorer data cached for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    #[default]
    Source,
    Abi,
    Creation,
}

impl CacheType {
    pub const ALL: [CacheType; 3] = [CacheType::Source, CacheType::Abi, CacheType::Creation];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Source => "source",
            CacheType::Abi => "abi",
            CacheType::Creation => "creation",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(CacheType::Source),
            "abi" => Ok(CacheType::Abi),
            "creation" => Ok(CacheType::Creation),
            other => Err(Error::InvalidCacheType(other.to_string())),
        }
    }
}

/// A cached payload for one `(network, address, cache_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub network: String,
    pub address: String,
    pub cache_type: CacheType,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub ttl_hours: i64,
    pub quality_score: f64,
    pub verified: bool,
    pub hit_count: u64,
    pub api_calls_saved: u64,
    pub size_bytes: u64,
}

impl CacheEntry {
    /// Build a freshly fetched entry. Counters start at zero and the score
    /// is clamped to `[0, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: impl Into<String>,
        address: &str,
        cache_type: CacheType,
        payload: serde_json::Value,
        fetched_at: DateTime<Utc>,
        ttl_hours: i64,
        quality_score: f64,
        verified: bool,
    ) -> Self {
        let size_bytes = serde_json::to_vec(&payload)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);

        Self {
            network: network.into(),
            address: crate::ids::normalize_address(address),
            cache_type,
            payload,
            fetched_at,
            ttl_hours,
            quality_score: clamp_score(quality_score),
            verified,
            hit_count: 0,
            api_calls_saved: 0,
            size_bytes,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.fetched_at
            .checked_add_signed(bounded_hours(self.ttl_hours))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Fresh means unexpired and at or above the quality floor.
    pub fn is_fresh(&self, now: DateTime<Utc>, freshness_floor: f64) -> bool {
        now < self.expires_at() && self.quality_score >= freshness_floor
    }

    /// Time left before expiry; negative once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at() - now
    }
}

/// Clamp a score into `[0, 1]`, mapping NaN to zero.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// How a cache read should be accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRead {
    /// Inspect the entry without touching counters.
    Peek,
    /// The caller served this entry instead of calling the explorer API;
    /// bumps `hit_count` and `api_calls_saved` once each.
    Hit,
}

/// Narrows `CacheStore::stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFilter {
    pub network: Option<String>,
    pub cache_type: Option<CacheType>,
}

impl StatsFilter {
    pub fn network(network: impl Into<String>) -> Self {
        Self {
            network: Some(network.into()),
            cache_type: None,
        }
    }

    pub fn matches(&self, entry: &CacheEntry) -> bool {
        self.network.as_ref().is_none_or(|n| *n == entry.network)
            && self.cache_type.is_none_or(|t| t == entry.cache_type)
    }
}

/// Aggregate view of the cache. Counts may lag concurrent writers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub active_entries: u64,
    pub expired_entries: u64,
    pub low_quality_entries: u64,
    pub avg_quality: f64,
    pub total_hits: u64,
    pub total_api_calls_saved: u64,
    pub total_size_bytes: u64,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted: u64,
    pub bytes_freed: u64,
}

/// When an entry started scoring below the low-quality floor, given the
/// marker stored for the previous version of the entry.
pub fn low_quality_since(
    entry: &CacheEntry,
    previous: Option<DateTime<Utc>>,
    low_quality_floor: f64,
) -> Option<DateTime<Utc>> {
    if entry.quality_score >= low_quality_floor {
        None
    } else {
        Some(previous.unwrap_or(entry.fetched_at))
    }
}

/// Which entries a cleanup pass deletes, resolved against a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanupRule {
    /// Entries that expired before this are deleted.
    pub expired_before: DateTime<Utc>,
    pub low_quality_floor: f64,
    /// Entries low-quality since before this are deleted.
    pub low_quality_before: DateTime<Utc>,
    /// Delete every low-quality entry regardless of age.
    pub aggressive: bool,
}

impl CleanupRule {
    pub fn new(policy: &CachePolicy, aggressive: bool, now: DateTime<Utc>) -> Self {
        Self {
            expired_before: now - policy.expired_grace(),
            low_quality_floor: policy.low_quality_floor,
            low_quality_before: now - policy.low_quality_retention(),
            aggressive,
        }
    }

    pub fn should_delete(&self, entry: &CacheEntry, low_quality_since: Option<DateTime<Utc>>) -> bool {
        if entry.expires_at() < self.expired_before {
            return true;
        }
        if entry.quality_score >= self.low_quality_floor {
            return false;
        }
        self.aggressive || low_quality_since.is_some_and(|since| since < self.low_quality_before)
    }
}
