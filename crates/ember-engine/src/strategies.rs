//! Candidate selection strategies.
//!
//! A strategy turns a network and cache type into an ordered list of
//! addresses worth warming. Strategies are looked up by name through
//! [`StrategyRegistry`], so new ones can be registered without touching the
//! warmer.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ember_core::cache::{CacheRead, CacheType};
use ember_core::config::{WarmerConfig, bounded_hours};
use ember_core::ports::{CacheStore, UsageLog, WarmingQueue};
use ember_core::{Error, Result, normalize_address};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Strategies run when a warm request names none.
pub const DEFAULT_STRATEGIES: [&str; 3] = ["expiring_soon", "high_access", "predictive"];

/// Selects addresses to warm.
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    /// Registry name of this strategy.
    fn name(&self) -> &str;

    /// At most `limit` candidate addresses, best first.
    async fn select(&self, network: &str, cache_type: CacheType, limit: usize) -> Result<Vec<String>>;
}

/// Entries whose remaining TTL is below a window.
pub struct ExpiringSoon {
    cache: Arc<dyn CacheStore>,
    window: Duration,
}

impl ExpiringSoon {
    pub fn new(cache: Arc<dyn CacheStore>, window: Duration) -> Self {
        Self { cache, window }
    }
}

#[async_trait]
impl CandidateSelector for ExpiringSoon {
    fn name(&self) -> &str {
        "expiring_soon"
    }

    async fn select(&self, network: &str, cache_type: CacheType, limit: usize) -> Result<Vec<String>> {
        let entries = self
            .cache
            .expiring_within(network, cache_type, self.window, limit)
            .await?;
        Ok(entries.into_iter().map(|e| e.address).collect())
    }
}

/// Frequently read entries that will expire within a horizon.
pub struct HighAccess {
    cache: Arc<dyn CacheStore>,
    percentile: f64,
    horizon: Duration,
}

impl HighAccess {
    pub fn new(cache: Arc<dyn CacheStore>, percentile: f64, horizon: Duration) -> Self {
        Self {
            cache,
            percentile,
            horizon,
        }
    }
}

#[async_trait]
impl CandidateSelector for HighAccess {
    fn name(&self) -> &str {
        "high_access"
    }

    async fn select(&self, network: &str, cache_type: CacheType, limit: usize) -> Result<Vec<String>> {
        let threshold = self
            .cache
            .hit_count_percentile(network, cache_type, self.percentile)
            .await?;
        let entries = self
            .cache
            .most_accessed(network, cache_type, threshold, Utc::now() + self.horizon, limit)
            .await?;

        tracing::debug!(network, threshold, selected = entries.len(), "high access candidates");
        Ok(entries.into_iter().map(|e| e.address).collect())
    }
}

/// Addresses that failed recently, then addresses looked up recently that
/// have no cache entry yet.
pub struct Predictive {
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn WarmingQueue>,
    usage: Arc<dyn UsageLog>,
    lookback: Duration,
}

impl Predictive {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn WarmingQueue>,
        usage: Arc<dyn UsageLog>,
        lookback: Duration,
    ) -> Self {
        Self {
            cache,
            queue,
            usage,
            lookback,
        }
    }
}

#[async_trait]
impl CandidateSelector for Predictive {
    fn name(&self) -> &str {
        "predictive"
    }

    async fn select(&self, network: &str, cache_type: CacheType, limit: usize) -> Result<Vec<String>> {
        let since = Utc::now() - self.lookback;
        let mut seen = HashSet::new();
        let mut selected = Vec::new();

        for address in self.queue.recent_failures(network, since, limit).await? {
            if selected.len() >= limit {
                break;
            }
            if seen.insert(address.clone()) {
                selected.push(address);
            }
        }

        // Look further back than `limit` since cached addresses are dropped.
        let looked_up = self
            .usage
            .recent_addresses(network, since, limit.saturating_mul(4))
            .await?;
        for address in looked_up {
            if selected.len() >= limit {
                break;
            }
            if seen.contains(&address) {
                continue;
            }
            let cached = self
                .cache
                .get(network, &address, cache_type, CacheRead::Peek)
                .await?;
            if cached.is_none() {
                seen.insert(address.clone());
                selected.push(address);
            }
        }

        Ok(selected)
    }
}

/// A configured list of well-known contracts per network.
pub struct PopularTokens {
    tokens: BTreeMap<String, Vec<String>>,
}

impl PopularTokens {
    pub fn new(tokens: BTreeMap<String, Vec<String>>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl CandidateSelector for PopularTokens {
    fn name(&self) -> &str {
        "popular_tokens"
    }

    async fn select(&self, network: &str, _cache_type: CacheType, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .tokens
            .get(network)
            .map(|tokens| tokens.iter().take(limit).map(|t| normalize_address(t)).collect())
            .unwrap_or_default())
    }
}

/// Maps strategy names to selectors.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    selectors: BTreeMap<String, Arc<dyn CandidateSelector>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in strategies wired to the given stores.
    pub fn with_defaults(
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn WarmingQueue>,
        usage: Arc<dyn UsageLog>,
        config: &WarmerConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExpiringSoon::new(
            cache.clone(),
            bounded_hours(config.expiring_window_hours),
        )));
        registry.register(Arc::new(HighAccess::new(
            cache.clone(),
            config.high_access_percentile,
            bounded_hours(config.high_access_horizon_hours),
        )));
        registry.register(Arc::new(Predictive::new(
            cache,
            queue,
            usage,
            bounded_hours(config.predictive_lookback_hours),
        )));
        registry.register(Arc::new(PopularTokens::new(config.popular_tokens.clone())));
        registry
    }

    /// Register a selector under its own name, replacing any previous one.
    pub fn register(&mut self, selector: Arc<dyn CandidateSelector>) {
        self.selectors.insert(selector.name().to_string(), selector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CandidateSelector>> {
        self.selectors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.selectors.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCacheStore, MemoryUsageLog, MemoryWarmingQueue};
    use ember_core::cache::CacheEntry;
    use ember_core::queue::{ClaimFilter, EnqueueRequest};
    use ember_core::quota::UsageEvent;
    use serde_json::json;

    async fn seed(cache: &MemoryCacheStore, address: &str, age_hours: i64, hits: u64) {
        let entry = CacheEntry::new(
            "ethereum",
            address,
            CacheType::Source,
            json!({"source_code": "contract A {}"}),
            Utc::now() - Duration::hours(age_hours),
            24,
            0.9,
            true,
        );
        cache.put(&entry).await.unwrap();
        for _ in 0..hits {
            cache
                .get("ethereum", address, CacheType::Source, CacheRead::Hit)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_expiring_soon_orders_by_expiry() {
        let cache = Arc::new(MemoryCacheStore::new());
        seed(&cache, "0x01", 10, 0).await;
        seed(&cache, "0x02", 20, 0).await;
        seed(&cache, "0x03", 0, 0).await;

        let strategy = ExpiringSoon::new(cache, Duration::hours(20));
        let selected = strategy.select("ethereum", CacheType::Source, 10).await.unwrap();
        assert_eq!(selected, vec!["0x02", "0x01"]);
    }

    #[tokio::test]
    async fn test_high_access_keeps_top_entries() {
        let cache = Arc::new(MemoryCacheStore::new());
        for (i, hits) in [0u64, 1, 2, 3, 4, 5, 6, 7, 8, 40].into_iter().enumerate() {
            seed(&cache, &format!("0x{i:02}"), 1, hits).await;
        }

        let strategy = HighAccess::new(cache, 0.8, Duration::hours(48));
        let selected = strategy.select("ethereum", CacheType::Source, 10).await.unwrap();
        assert_eq!(selected, vec!["0x09", "0x08", "0x07"]);
    }

    #[tokio::test]
    async fn test_predictive_prefers_failures_then_uncached() {
        let cache = Arc::new(MemoryCacheStore::new());
        let queue = Arc::new(MemoryWarmingQueue::new());
        let usage = Arc::new(MemoryUsageLog::new());

        let outcome = queue
            .enqueue(&EnqueueRequest::new("ethereum", "0xfa", CacheType::Source))
            .await
            .unwrap();
        queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();
        queue.fail(outcome.id, "502").await.unwrap();

        seed(&cache, "0xc1", 0, 0).await;
        for address in ["0xc1", "0xn1", "0xfa", "0xn2"] {
            usage
                .append(&UsageEvent::new("ethereum", "etherscan", true).with_address(address))
                .await
                .unwrap();
        }

        let strategy = Predictive::new(cache, queue, usage, Duration::hours(48));
        let selected = strategy.select("ethereum", CacheType::Source, 10).await.unwrap();
        assert_eq!(selected[0], "0xfa");
        assert_eq!(selected.len(), 3);
        assert!(selected.contains(&"0xn1".to_string()));
        assert!(selected.contains(&"0xn2".to_string()));
        assert!(!selected.contains(&"0xc1".to_string()));

        let capped = strategy.select("ethereum", CacheType::Source, 1).await.unwrap();
        assert_eq!(capped, vec!["0xfa"]);
    }

    #[tokio::test]
    async fn test_popular_tokens_per_network() {
        let strategy = PopularTokens::new(WarmerConfig::default().popular_tokens);
        let eth = strategy.select("ethereum", CacheType::Source, 2).await.unwrap();
        assert_eq!(eth.len(), 2);
        assert!(strategy.select("fantom", CacheType::Source, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = StrategyRegistry::with_defaults(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(MemoryWarmingQueue::new()),
            Arc::new(MemoryUsageLog::new()),
            &WarmerConfig::default(),
        );
        assert_eq!(
            registry.names(),
            vec!["expiring_soon", "high_access", "popular_tokens", "predictive"]
        );
        assert!(matches!(
            registry.get("random_walk"),
            Err(Error::UnknownStrategy(name)) if name == "random_walk"
        ));
    }
}
