//! Test fixtures for creating sample data.

use chrono::{Duration, Utc};
use ember_core::cache::{CacheEntry, CacheType};
use ember_core::queue::{EnqueueRequest, Priority};
use serde_json::{Value, json};

/// A well-formed address derived from `i`.
pub fn address(i: usize) -> String {
    format!("0x{i:040x}")
}

pub fn addresses(n: usize) -> Vec<String> {
    (0..n).map(address).collect()
}

/// A payload with every field a source entry needs.
pub fn complete_source(address: &str) -> Value {
    json!({
        "source_code": format!("// {address}\ncontract Token {{}}"),
        "abi": [{"type": "function", "name": "totalSupply"}],
        "compiler_version": "v0.8.19+commit.7dd6d404",
        "contract_name": "Token"
    })
}

/// Factory for cache entries.
pub struct CacheEntryFixture;

impl CacheEntryFixture {
    /// A verified entry fetched `age_hours` ago with a 168 hour TTL.
    pub fn aged(network: &str, address: &str, age_hours: i64, quality_score: f64) -> CacheEntry {
        CacheEntry::new(
            network,
            address,
            CacheType::Source,
            complete_source(address),
            Utc::now() - Duration::hours(age_hours),
            168,
            quality_score,
            true,
        )
    }

    pub fn fresh(network: &str, address: &str) -> CacheEntry {
        Self::aged(network, address, 0, 0.95)
    }

    /// Expired long enough ago to be past any cleanup grace period.
    pub fn long_expired(network: &str, address: &str) -> CacheEntry {
        Self::aged(network, address, 24 * 30, 0.9)
    }

    pub fn low_quality(network: &str, address: &str) -> CacheEntry {
        Self::aged(network, address, 0, 0.1)
    }
}

/// Factory for enqueue requests.
pub struct EnqueueFixture;

impl EnqueueFixture {
    pub fn source(network: &str, address: &str, priority: Priority) -> EnqueueRequest {
        EnqueueRequest::new(network, address, CacheType::Source).with_priority(priority)
    }
}
