//! Engine configuration.
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! file only needs to name the values it overrides.

use crate::cache::CacheType;
use crate::error::{Error, Result};
use crate::quality::QualityWeights;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest interval any policy value may express.
pub const MAX_INTERVAL_DAYS: i64 = 3650;

const MAX_INTERVAL_SECS: u64 = MAX_INTERVAL_DAYS as u64 * 86_400;

/// `hours` as a duration, clamped to `0..=MAX_INTERVAL_DAYS` days.
pub fn bounded_hours(hours: i64) -> Duration {
    Duration::hours(hours.clamp(0, MAX_INTERVAL_DAYS * 24))
}

/// `days` as a duration, clamped to `0..=MAX_INTERVAL_DAYS`.
pub fn bounded_days(days: i64) -> Duration {
    Duration::days(days.clamp(0, MAX_INTERVAL_DAYS))
}

/// `secs` as a duration, clamped to `MAX_INTERVAL_DAYS`.
pub fn bounded_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_INTERVAL_SECS) as i64)
}

/// Aggregate configuration for the warming engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CachePolicy,
    pub queue: QueuePolicy,
    pub quota: QuotaPolicy,
    pub warmer: WarmerConfig,
}

impl EngineConfig {
    /// Reject values outside the ranges the engine can act on.
    pub fn validate(&self) -> Result<()> {
        let hours = [
            ("cache.expired_grace_hours", self.cache.expired_grace_hours),
            ("warmer.expiring_window_hours", self.warmer.expiring_window_hours),
            ("warmer.high_access_horizon_hours", self.warmer.high_access_horizon_hours),
            ("warmer.predictive_lookback_hours", self.warmer.predictive_lookback_hours),
        ];
        for (name, value) in hours {
            check_range(name, value, 0, MAX_INTERVAL_DAYS * 24)?;
        }
        for (name, value) in [
            ("cache.ttl_hours.source", self.cache.ttl_hours.source),
            ("cache.ttl_hours.abi", self.cache.ttl_hours.abi),
            ("cache.ttl_hours.creation", self.cache.ttl_hours.creation),
        ] {
            check_range(name, value, 1, MAX_INTERVAL_DAYS * 24)?;
        }

        let days = [
            ("cache.low_quality_retention_days", self.cache.low_quality_retention_days),
            ("queue.finished_retention_days", self.queue.finished_retention_days),
            ("quota.usage_retention_days", self.quota.usage_retention_days),
        ];
        for (name, value) in days {
            check_range(name, value, 0, MAX_INTERVAL_DAYS)?;
        }

        let secs = [
            ("queue.processing_timeout_secs", self.queue.processing_timeout_secs),
            ("queue.retry_backoff_secs", self.queue.retry_backoff_secs),
            ("warmer.fetch_timeout_secs", self.warmer.fetch_timeout_secs),
            ("warmer.max_runtime_secs", self.warmer.max_runtime_secs),
        ];
        for (name, value) in secs {
            if value > MAX_INTERVAL_SECS {
                return Err(Error::Config(format!(
                    "{name} must be at most {MAX_INTERVAL_SECS}, got {value}"
                )));
            }
        }

        let ratios = [
            ("cache.freshness_floor", self.cache.freshness_floor),
            ("cache.low_quality_floor", self.cache.low_quality_floor),
            ("quota.reserve_ratio", self.quota.reserve_ratio),
            ("warmer.high_access_percentile", self.warmer.high_access_percentile),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be within 0..=1, got {value}")));
            }
        }
        Ok(())
    }
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be within {min}..={max}, got {value}")))
    }
}

/// Freshness, retention and scoring rules for cache entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Minimum quality score for an unexpired entry to count as fresh.
    pub freshness_floor: f64,
    /// Entries scoring below this are eligible for low-quality cleanup.
    pub low_quality_floor: f64,
    /// How long an entry may stay below the low-quality floor.
    pub low_quality_retention_days: i64,
    /// How long an expired entry is kept before cleanup deletes it.
    pub expired_grace_hours: i64,
    /// Default TTL per cache type.
    pub ttl_hours: TtlHours,
    pub quality_weights: QualityWeights,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            freshness_floor: 0.7,
            low_quality_floor: 0.3,
            low_quality_retention_days: 30,
            expired_grace_hours: 24,
            ttl_hours: TtlHours::default(),
            quality_weights: QualityWeights::default(),
        }
    }
}

impl CachePolicy {
    pub fn ttl_for(&self, cache_type: CacheType) -> i64 {
        match cache_type {
            CacheType::Source => self.ttl_hours.source,
            CacheType::Abi => self.ttl_hours.abi,
            CacheType::Creation => self.ttl_hours.creation,
        }
    }

    pub fn expired_grace(&self) -> Duration {
        bounded_hours(self.expired_grace_hours)
    }

    pub fn low_quality_retention(&self) -> Duration {
        bounded_days(self.low_quality_retention_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlHours {
    pub source: i64,
    pub abi: i64,
    pub creation: i64,
}

impl Default for TtlHours {
    fn default() -> Self {
        Self {
            source: 168,
            abi: 168,
            creation: 720,
        }
    }
}

/// Retry and recovery rules for the warming queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    /// Failures tolerated before an item becomes terminal.
    pub max_retries: u32,
    /// Claims older than this are treated as stuck.
    pub processing_timeout_secs: u64,
    /// Base delay for retry backoff; zero requeues immediately.
    pub retry_backoff_secs: u64,
    /// Completed and failed items older than this are purged.
    pub finished_retention_days: i64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            processing_timeout_secs: 600,
            retry_backoff_secs: 300,
            finished_retention_days: 7,
        }
    }
}

impl QueuePolicy {
    pub fn processing_timeout(&self) -> Duration {
        bounded_secs(self.processing_timeout_secs)
    }

    /// Delay before the `retry_count`-th retry becomes claimable.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(6);
        bounded_secs(self.retry_backoff_secs.saturating_mul(1 << exponent))
    }

    pub fn finished_retention(&self) -> Duration {
        bounded_days(self.finished_retention_days)
    }
}

/// Daily API budget for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimit {
    pub provider: String,
    pub daily_limit: u64,
}

/// Provider limits and usage-log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    /// Limits keyed by network name.
    pub networks: BTreeMap<String, ProviderLimit>,
    /// Daily limit applied to networks with no explicit entry.
    pub fallback_daily_limit: u64,
    pub fallback_provider: String,
    /// Fraction of the daily limit withheld from warming.
    pub reserve_ratio: f64,
    pub usage_retention_days: i64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        let networks = [
            ("ethereum", "etherscan", 100_000),
            ("bsc", "bscscan", 10_000),
            ("polygon", "polygonscan", 5_000),
        ]
        .into_iter()
        .map(|(network, provider, daily_limit)| {
            (
                network.to_string(),
                ProviderLimit {
                    provider: provider.to_string(),
                    daily_limit,
                },
            )
        })
        .collect();

        Self {
            networks,
            fallback_daily_limit: 1_000,
            fallback_provider: "explorer".to_string(),
            reserve_ratio: 0.0,
            usage_retention_days: 30,
        }
    }
}

impl QuotaPolicy {
    pub fn limit_for(&self, network: &str) -> ProviderLimit {
        self.networks
            .get(network)
            .cloned()
            .unwrap_or_else(|| ProviderLimit {
                provider: self.fallback_provider.clone(),
                daily_limit: self.fallback_daily_limit,
            })
    }

    pub fn provider_for(&self, network: &str) -> String {
        self.limit_for(network).provider
    }

    /// Daily limit minus the configured reserve.
    pub fn warming_limit(&self, daily_limit: u64) -> u64 {
        let reserve = (daily_limit as f64 * self.reserve_ratio.clamp(0.0, 1.0)).ceil() as u64;
        daily_limit.saturating_sub(reserve)
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    pub fetch_timeout_secs: u64,
    pub max_runtime_secs: u64,
    pub default_cache_type: CacheType,
    /// `expiring_soon` looks this far ahead.
    pub expiring_window_hours: i64,
    /// `high_access` keeps entries above this hit-count percentile.
    pub high_access_percentile: f64,
    /// `high_access` only considers entries expiring within this horizon.
    pub high_access_horizon_hours: i64,
    /// `predictive` looks back this far for failures and uncached lookups.
    pub predictive_lookback_hours: i64,
    /// Re-enqueue addresses whose strategy-driven fetch failed.
    pub requeue_failures: bool,
    pub strategy_limits: BTreeMap<String, usize>,
    /// Well-known contracts per network for the `popular_tokens` strategy.
    pub popular_tokens: BTreeMap<String, Vec<String>>,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        let strategy_limits = [
            ("expiring_soon", 100),
            ("high_access", 50),
            ("predictive", 30),
            ("popular_tokens", 20),
        ]
        .into_iter()
        .map(|(name, limit)| (name.to_string(), limit))
        .collect();

        let mut popular_tokens = BTreeMap::new();
        popular_tokens.insert(
            "ethereum".to_string(),
            vec![
                "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
                "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string(),
                "0x6b175474e89094c44da98b954eedeac495271d0f".to_string(),
            ],
        );
        popular_tokens.insert(
            "bsc".to_string(),
            vec![
                "0x55d398326f99059ff775485246999027b3197955".to_string(),
                "0x8ac76a51cc950d9822d68b83fe1ad97b32cd580d".to_string(),
            ],
        );

        Self {
            fetch_timeout_secs: 30,
            max_runtime_secs: 300,
            default_cache_type: CacheType::Source,
            expiring_window_hours: 24,
            high_access_percentile: 0.9,
            high_access_horizon_hours: 48,
            predictive_lookback_hours: 48,
            requeue_failures: true,
            strategy_limits,
            popular_tokens,
        }
    }
}

impl WarmerConfig {
    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn max_runtime(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_runtime_secs)
    }

    pub fn strategy_limit(&self, strategy: &str) -> usize {
        self.strategy_limits.get(strategy).copied().unwrap_or(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.freshness_floor, 0.7);
        assert_eq!(config.cache.low_quality_floor, 0.3);
        assert_eq!(config.cache.low_quality_retention_days, 30);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.processing_timeout_secs, 600);
        assert_eq!(config.quota.limit_for("ethereum").daily_limit, 100_000);
    }

    #[test]
    fn test_unknown_network_falls_back() {
        let policy = QuotaPolicy::default();
        let limit = policy.limit_for("gnosis");
        assert_eq!(limit.daily_limit, 1_000);
        assert_eq!(limit.provider, "explorer");
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = QueuePolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::minutes(5));
        assert_eq!(policy.backoff_for(2), Duration::minutes(10));
        assert_eq!(policy.backoff_for(3), Duration::minutes(20));
    }

    #[test]
    fn test_extreme_intervals_are_clamped() {
        let policy = QueuePolicy {
            retry_backoff_secs: u64::MAX,
            processing_timeout_secs: u64::MAX,
            finished_retention_days: i64::MAX,
            ..Default::default()
        };
        let ceiling = Duration::days(MAX_INTERVAL_DAYS);
        assert_eq!(policy.backoff_for(7), ceiling);
        assert_eq!(policy.processing_timeout(), ceiling);
        assert_eq!(policy.finished_retention(), ceiling);
        assert_eq!(bounded_hours(i64::MIN), Duration::zero());
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::default().validate().is_ok());

        let mut config = EngineConfig::default();
        config.cache.ttl_hours.source = i64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("ttl_hours.source")));

        let mut config = EngineConfig::default();
        config.cache.ttl_hours.abi = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.queue.retry_backoff_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.quota.reserve_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warming_limit_reserve() {
        let mut policy = QuotaPolicy::default();
        assert_eq!(policy.warming_limit(1_000), 1_000);
        policy.reserve_ratio = 0.1;
        assert_eq!(policy.warming_limit(1_000), 900);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "cache:\n  freshness_floor: 0.8\nqueue:\n  max_retries: 5\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache.freshness_floor, 0.8);
        assert_eq!(config.cache.low_quality_floor, 0.3);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.warmer.strategy_limit("expiring_soon"), 100);
    }
}
