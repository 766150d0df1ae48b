//! Warming requests and results.

use crate::cache::CacheType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a warming run should fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmingRequest {
    pub network: String,
    /// Named strategies to resolve candidates with. Ignored when
    /// `addresses` is non-empty.
    pub strategies: Vec<String>,
    /// Explicit candidates.
    pub addresses: Vec<String>,
    pub cache_type: CacheType,
    /// Upper bound on external calls for this run.
    pub api_call_budget: u64,
}

impl WarmingRequest {
    pub fn strategies(
        network: impl Into<String>,
        strategies: impl IntoIterator<Item = impl Into<String>>,
        api_call_budget: u64,
    ) -> Self {
        Self {
            network: network.into(),
            strategies: strategies.into_iter().map(Into::into).collect(),
            addresses: Vec::new(),
            cache_type: CacheType::Source,
            api_call_budget,
        }
    }

    pub fn addresses(
        network: impl Into<String>,
        addresses: impl IntoIterator<Item = impl Into<String>>,
        api_call_budget: u64,
    ) -> Self {
        Self {
            network: network.into(),
            strategies: Vec::new(),
            addresses: addresses.into_iter().map(Into::into).collect(),
            cache_type: CacheType::Source,
            api_call_budget,
        }
    }

    pub fn with_cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }
}

/// Outcome counts for one candidate source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyCounts {
    pub candidates: u64,
    pub successful: u64,
    pub failed: u64,
    pub already_cached: u64,
    pub skipped_quota: u64,
    pub skipped_deadline: u64,
}

/// A per-address failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmingError {
    pub address: String,
    pub message: String,
}

/// Full breakdown of a warming run. Returned even when some items failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmingResult {
    /// Candidates for which an external call was attempted.
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub already_cached: u64,
    pub skipped_quota: u64,
    /// Candidates left untouched because the run hit its deadline.
    pub skipped_deadline: u64,
    pub api_calls_used: u64,
    pub allowance: u64,
    pub time_taken_seconds: f64,
    pub strategies_executed: BTreeMap<String, StrategyCounts>,
    pub errors: Vec<WarmingError>,
}

impl WarmingResult {
    pub fn candidates(&self) -> u64 {
        self.processed + self.already_cached + self.skipped_quota + self.skipped_deadline
    }
}

/// Outcome of a bulk enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub enqueued: u64,
    pub deduped: u64,
}
