//! Operational control surface.
//!
//! [`ControlPlane`] bundles the stores, the quota tracker and the warmer
//! behind the operations an operator runs: warm, inspect, clean up and
//! steer the queue. Every operation returns a serializable value so the
//! caller can render it as a table or JSON.

use crate::quota::QuotaTracker;
use crate::strategies::StrategyRegistry;
use crate::warmer::IntelligentWarmer;
use chrono::Utc;
use ember_core::Result;
use ember_core::cache::{CacheStats, CacheType, CleanupReport, StatsFilter};
use ember_core::config::EngineConfig;
use ember_core::ports::{CacheStore, SourceFetcher, UsageLog, WarmingQueue};
use ember_core::queue::{Priority, QueueStats};
use ember_core::quota::{QuotaStatus, QuotaWindow};
use ember_core::warming::{ScheduleResult, WarmingRequest, WarmingResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Pending items above which a backlog recommendation is raised.
const LARGE_QUEUE_THRESHOLD: u64 = 100;
/// Saved calls below which a low-savings recommendation is raised.
const LOW_SAVINGS_THRESHOLD: u64 = 100;

/// Combined view returned by [`ControlPlane::stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cache: CacheStats,
    pub queue: QueueStats,
    pub quota: Vec<QuotaWindow>,
    pub recommendations: Vec<String>,
}

/// Everything removed by one [`ControlPlane::cleanup`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub cache: CleanupReport,
    pub stuck_reset: u64,
    pub queue_purged: u64,
    pub usage_purged: u64,
}

#[derive(Clone)]
pub struct ControlPlane {
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn WarmingQueue>,
    quota: Arc<QuotaTracker>,
    warmer: Arc<IntelligentWarmer>,
    config: EngineConfig,
}

impl ControlPlane {
    /// Wire the stores and fetcher together with the built-in strategies.
    pub fn new(
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn WarmingQueue>,
        usage: Arc<dyn UsageLog>,
        fetcher: Arc<dyn SourceFetcher>,
        config: EngineConfig,
    ) -> Self {
        let quota = Arc::new(QuotaTracker::new(usage.clone(), config.quota.clone()));
        let strategies =
            StrategyRegistry::with_defaults(cache.clone(), queue.clone(), usage, &config.warmer);
        let warmer = Arc::new(IntelligentWarmer::new(
            cache.clone(),
            queue.clone(),
            quota.clone(),
            fetcher,
            strategies,
            &config,
        ));

        Self {
            cache,
            queue,
            quota,
            warmer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn warmer(&self) -> &IntelligentWarmer {
        &self.warmer
    }

    /// Run a warming pass. An empty strategy list runs the defaults.
    pub async fn warm(&self, request: &WarmingRequest) -> Result<WarmingResult> {
        self.warmer.execute_warming(request).await
    }

    /// Cache, queue and quota figures with operator recommendations.
    pub async fn stats(&self, network: Option<&str>) -> Result<SystemStats> {
        let filter = StatsFilter {
            network: network.map(String::from),
            cache_type: None,
        };
        let cache = self.cache.stats(&filter).await?;
        let queue = self.queue.stats().await?;
        let quota = self.quota.windows(network).await?;
        let recommendations = recommendations(&cache, &queue, &quota);

        Ok(SystemStats {
            cache,
            queue,
            quota,
            recommendations,
        })
    }

    pub async fn quota(&self, network: Option<&str>) -> Result<Vec<QuotaWindow>> {
        self.quota.windows(network).await
    }

    /// Delete stale cache entries, recover stuck queue items and purge
    /// finished queue items and old usage events.
    pub async fn cleanup(&self, aggressive: bool) -> Result<MaintenanceReport> {
        let cache = self.cache.cleanup(aggressive).await?;
        let stuck_reset = self.queue.reset_stuck().await?;
        let queue_purged = self
            .queue
            .purge_finished(Utc::now() - self.config.queue.finished_retention())
            .await?;
        let usage_purged = self.quota.purge_expired().await?;

        let report = MaintenanceReport {
            cache,
            stuck_reset,
            queue_purged,
            usage_purged,
        };
        tracing::info!(
            aggressive,
            deleted = report.cache.deleted,
            bytes_freed = report.cache.bytes_freed,
            stuck_reset,
            queue_purged,
            usage_purged,
            "cleanup finished"
        );
        Ok(report)
    }

    pub async fn pause_queue(&self) -> Result<()> {
        self.queue.pause().await
    }

    pub async fn resume_queue(&self) -> Result<()> {
        self.queue.resume().await
    }

    pub async fn reset_stuck(&self) -> Result<u64> {
        self.queue.reset_stuck().await
    }

    pub async fn queue_status(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    pub async fn enqueue(
        &self,
        addresses: &[String],
        network: &str,
        cache_type: CacheType,
        priority: Priority,
    ) -> Result<ScheduleResult> {
        self.warmer
            .schedule(addresses, network, cache_type, priority)
            .await
    }

    pub async fn process_queue(
        &self,
        network: &str,
        batch_size: usize,
        priority: Option<Priority>,
    ) -> Result<WarmingResult> {
        self.warmer.process_queue(network, batch_size, priority).await
    }
}

fn recommendations(cache: &CacheStats, queue: &QueueStats, quota: &[QuotaWindow]) -> Vec<String> {
    let mut out = Vec::new();

    if queue.paused {
        out.push("Warming queue is paused; resume it to continue processing".to_string());
    }
    if queue.pending > LARGE_QUEUE_THRESHOLD {
        out.push(format!(
            "Large warming queue detected ({} pending); process the queue more often or raise the batch size",
            queue.pending
        ));
    }
    if cache.total_api_calls_saved < LOW_SAVINGS_THRESHOLD {
        out.push(format!(
            "Low API call savings ({} calls saved); warm more frequently accessed contracts",
            cache.total_api_calls_saved
        ));
    }
    for window in quota {
        if matches!(window.status, QuotaStatus::Warning | QuotaStatus::Critical) {
            out.push(format!(
                "{} quota is {} at {:.1}% used; warming will be throttled",
                window.network, window.status, window.percent_used
            ));
        }
    }

    out
}
