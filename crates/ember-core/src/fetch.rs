//! Types exchanged with the explorer fetch collaborator.

use crate::cache::CacheType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub network: String,
    pub address: String,
    pub cache_type: CacheType,
}

impl FetchRequest {
    pub fn new(network: impl Into<String>, address: &str, cache_type: CacheType) -> Self {
        Self {
            network: network.into(),
            address: crate::ids::normalize_address(address),
            cache_type,
        }
    }
}

/// Facts about a fetch that feed the quality score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchMeta {
    pub provider: String,
    pub verified: bool,
    pub fetched_at: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
}

/// A successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedSource {
    pub payload: serde_json::Value,
    pub meta: FetchMeta,
}
