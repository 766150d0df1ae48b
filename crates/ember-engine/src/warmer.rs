//! Quota-aware warming orchestration.

use crate::quota::{Allowance, QuotaTracker};
use crate::strategies::{DEFAULT_STRATEGIES, StrategyRegistry};
use chrono::Utc;
use ember_core::cache::{CacheEntry, CacheRead, CacheType};
use ember_core::config::{CachePolicy, EngineConfig, WarmerConfig};
use ember_core::fetch::{FetchRequest, FetchedSource};
use ember_core::ports::{CacheStore, SourceFetcher, WarmingQueue};
use ember_core::queue::{ClaimFilter, EnqueueRequest, FailOutcome, Priority};
use ember_core::quota::UsageEvent;
use ember_core::warming::{ScheduleResult, StrategyCounts, WarmingError, WarmingRequest, WarmingResult};
use ember_core::{Error, FetchErrorKind, Result, normalize_address};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

/// Label for caller-supplied addresses in the per-strategy breakdown.
pub const EXPLICIT_SOURCE: &str = "explicit";
/// Label for queue-driven runs in the per-strategy breakdown.
pub const QUEUE_SOURCE: &str = "queue";

/// Turns warming requests into a bounded set of external fetches.
///
/// The warmer owns no state. Every run reserves its calls with
/// [`QuotaTracker::reserve`] first, records each external call with
/// [`QuotaTracker::record_call`] exactly once, and releases the reservation
/// when it ends.
pub struct IntelligentWarmer {
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn WarmingQueue>,
    quota: Arc<QuotaTracker>,
    fetcher: Arc<dyn SourceFetcher>,
    strategies: StrategyRegistry,
    cache_policy: CachePolicy,
    config: WarmerConfig,
}

struct Candidate {
    address: String,
    source: String,
}

enum Attempt {
    Stored,
    Failed { kind: FetchErrorKind, message: String },
}

#[derive(Clone, Copy)]
enum Tally {
    Successful,
    Failed,
    AlreadyCached,
    SkippedQuota,
    SkippedDeadline,
}

fn tally(result: &mut WarmingResult, source: &str, outcome: Tally) {
    let counts: &mut StrategyCounts = result.strategies_executed.entry(source.to_string()).or_default();
    match outcome {
        Tally::Successful => {
            counts.successful += 1;
            result.successful += 1;
        }
        Tally::Failed => {
            counts.failed += 1;
            result.failed += 1;
        }
        Tally::AlreadyCached => {
            counts.already_cached += 1;
            result.already_cached += 1;
        }
        Tally::SkippedQuota => {
            counts.skipped_quota += 1;
            result.skipped_quota += 1;
        }
        Tally::SkippedDeadline => {
            counts.skipped_deadline += 1;
            result.skipped_deadline += 1;
        }
    }
}

impl IntelligentWarmer {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn WarmingQueue>,
        quota: Arc<QuotaTracker>,
        fetcher: Arc<dyn SourceFetcher>,
        strategies: StrategyRegistry,
        config: &EngineConfig,
    ) -> Self {
        Self {
            cache,
            queue,
            quota,
            fetcher,
            strategies,
            cache_policy: config.cache.clone(),
            config: config.warmer.clone(),
        }
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    /// How long a run may hold its quota reservation.
    fn hold(&self) -> std::time::Duration {
        self.config.max_runtime() + self.config.fetch_timeout()
    }

    /// Warm the request's candidates, spending at most the quota allowance.
    ///
    /// Per-address fetch failures are counted and never abort the run;
    /// storage failures do.
    pub async fn execute_warming(&self, request: &WarmingRequest) -> Result<WarmingResult> {
        let started = Instant::now();
        let deadline = started + self.config.max_runtime();
        let network = request.network.as_str();
        let mut result = WarmingResult::default();

        let candidates = self.resolve_candidates(request, &mut result).await?;
        let provider = self.quota.provider_for(network);
        let allowance = self
            .quota
            .reserve(network, &provider, request.api_call_budget, self.hold())
            .await;
        result.allowance = allowance.granted;

        tracing::info!(
            network,
            cache_type = %request.cache_type,
            candidates = candidates.len(),
            budget = request.api_call_budget,
            allowance = allowance.granted,
            "starting warming run"
        );

        let outcome = self
            .warm_candidates(request, &provider, &allowance, candidates, deadline, &mut result)
            .await;
        self.quota.release(&allowance).await;
        outcome?;

        if result.skipped_deadline > 0 {
            tracing::warn!(
                network,
                skipped = result.skipped_deadline,
                "warming run hit its deadline"
            );
        }

        result.time_taken_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            network,
            processed = result.processed,
            successful = result.successful,
            failed = result.failed,
            already_cached = result.already_cached,
            skipped_quota = result.skipped_quota,
            api_calls_used = result.api_calls_used,
            "warming run finished"
        );
        Ok(result)
    }

    /// Claim due queue items for `network` and warm them. At most the quota
    /// allowance is claimed; items left when the deadline passes are
    /// released untouched.
    pub async fn process_queue(
        &self,
        network: &str,
        batch_size: usize,
        priority: Option<Priority>,
    ) -> Result<WarmingResult> {
        let started = Instant::now();
        let deadline = started + self.config.max_runtime();
        let mut result = WarmingResult::default();

        let provider = self.quota.provider_for(network);
        let allowance = self
            .quota
            .reserve(network, &provider, batch_size as u64, self.hold())
            .await;
        result.allowance = allowance.granted;

        if allowance.granted == 0 {
            tracing::info!(network, "no api allowance left, queue left untouched");
            result.time_taken_seconds = started.elapsed().as_secs_f64();
            return Ok(result);
        }

        let filter = ClaimFilter {
            network: Some(network.to_string()),
            priority,
        };
        let outcome = self
            .drain_claimed(network, &provider, &allowance, &filter, deadline, &mut result)
            .await;
        self.quota.release(&allowance).await;
        outcome?;

        result.time_taken_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            network,
            processed = result.processed,
            successful = result.successful,
            failed = result.failed,
            released = result.skipped_deadline,
            "queue batch finished"
        );
        Ok(result)
    }

    /// Enqueue addresses for later warming.
    pub async fn schedule(
        &self,
        addresses: &[String],
        network: &str,
        cache_type: CacheType,
        priority: Priority,
    ) -> Result<ScheduleResult> {
        let mut result = ScheduleResult::default();
        for address in addresses {
            let request = EnqueueRequest::new(network, address, cache_type).with_priority(priority);
            if request.contract_address.is_empty() {
                return Err(Error::InvalidInput("empty contract address".to_string()));
            }
            if self.queue.enqueue(&request).await?.deduped {
                result.deduped += 1;
            } else {
                result.enqueued += 1;
            }
        }

        tracing::info!(
            network,
            enqueued = result.enqueued,
            deduped = result.deduped,
            priority = %priority,
            "scheduled addresses for warming"
        );
        Ok(result)
    }

    async fn drain_claimed(
        &self,
        network: &str,
        provider: &str,
        allowance: &Allowance,
        filter: &ClaimFilter,
        deadline: Instant,
        result: &mut WarmingResult,
    ) -> Result<()> {
        let items = self.queue.claim_batch(allowance.granted as usize, filter).await?;
        result
            .strategies_executed
            .entry(QUEUE_SOURCE.to_string())
            .or_default()
            .candidates = items.len() as u64;

        for item in items {
            if Instant::now() >= deadline {
                self.queue.release(item.id).await?;
                tally(result, QUEUE_SOURCE, Tally::SkippedDeadline);
                continue;
            }

            if self.is_fresh(network, &item.contract_address, item.cache_type).await? {
                self.queue.complete(item.id).await?;
                tally(result, QUEUE_SOURCE, Tally::AlreadyCached);
                continue;
            }

            result.processed += 1;
            result.api_calls_used += 1;

            match self
                .attempt(network, provider, allowance, &item.contract_address, item.cache_type)
                .await?
            {
                Attempt::Stored => {
                    self.queue.complete(item.id).await?;
                    tally(result, QUEUE_SOURCE, Tally::Successful);
                }
                Attempt::Failed { kind, message } => {
                    let outcome = if kind.is_retryable() {
                        self.queue.fail(item.id, &message).await?
                    } else {
                        self.queue.fail_permanently(item.id, &message).await?
                    };
                    if let FailOutcome::Terminal { retry_count } = outcome {
                        tracing::warn!(
                            item_id = %item.id,
                            address = %item.contract_address,
                            retry_count,
                            "warming item failed for good"
                        );
                    }
                    tally(result, QUEUE_SOURCE, Tally::Failed);
                    result.errors.push(WarmingError {
                        address: item.contract_address.clone(),
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    async fn warm_candidates(
        &self,
        request: &WarmingRequest,
        provider: &str,
        allowance: &Allowance,
        candidates: Vec<Candidate>,
        deadline: Instant,
        result: &mut WarmingResult,
    ) -> Result<()> {
        let network = request.network.as_str();
        for candidate in candidates {
            if Instant::now() >= deadline {
                tally(result, &candidate.source, Tally::SkippedDeadline);
                continue;
            }

            if self.is_fresh(network, &candidate.address, request.cache_type).await? {
                tally(result, &candidate.source, Tally::AlreadyCached);
                continue;
            }

            if result.api_calls_used >= allowance.granted {
                tally(result, &candidate.source, Tally::SkippedQuota);
                continue;
            }

            result.processed += 1;
            result.api_calls_used += 1;

            match self
                .attempt(network, provider, allowance, &candidate.address, request.cache_type)
                .await?
            {
                Attempt::Stored => tally(result, &candidate.source, Tally::Successful),
                Attempt::Failed { kind, message } => {
                    tally(result, &candidate.source, Tally::Failed);
                    result.errors.push(WarmingError {
                        address: candidate.address.clone(),
                        message,
                    });

                    if self.config.requeue_failures && kind.is_retryable() {
                        let retry = EnqueueRequest::new(network, &candidate.address, request.cache_type)
                            .with_priority(Priority::Low);
                        self.queue.enqueue(&retry).await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn resolve_candidates(
        &self,
        request: &WarmingRequest,
        result: &mut WarmingResult,
    ) -> Result<Vec<Candidate>> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        if !request.addresses.is_empty() {
            for address in &request.addresses {
                let address = normalize_address(address);
                if !address.is_empty() && seen.insert(address.clone()) {
                    candidates.push(Candidate {
                        address,
                        source: EXPLICIT_SOURCE.to_string(),
                    });
                }
            }
            result
                .strategies_executed
                .entry(EXPLICIT_SOURCE.to_string())
                .or_default()
                .candidates = candidates.len() as u64;
            return Ok(candidates);
        }

        let names: Vec<String> = if request.strategies.is_empty() {
            DEFAULT_STRATEGIES.iter().map(|s| s.to_string()).collect()
        } else {
            request.strategies.clone()
        };
        // Resolve every name up front so a typo fails before any work.
        let selectors = names
            .iter()
            .map(|name| self.strategies.get(name))
            .collect::<Result<Vec<_>>>()?;

        for selector in selectors {
            let name = selector.name().to_string();
            let limit = self.config.strategy_limit(&name);
            let selected = selector
                .select(&request.network, request.cache_type, limit)
                .await?;

            let counts = result.strategies_executed.entry(name.clone()).or_default();
            for address in selected {
                let address = normalize_address(&address);
                if seen.insert(address.clone()) {
                    counts.candidates += 1;
                    candidates.push(Candidate {
                        address,
                        source: name.clone(),
                    });
                }
            }
            tracing::debug!(strategy = %name, candidates = counts.candidates, "strategy resolved");
        }

        Ok(candidates)
    }

    async fn is_fresh(&self, network: &str, address: &str, cache_type: CacheType) -> Result<bool> {
        let entry = self
            .cache
            .get(network, address, cache_type, CacheRead::Peek)
            .await?;
        Ok(entry.is_some_and(|e| e.is_fresh(Utc::now(), self.cache_policy.freshness_floor)))
    }

    /// One external call: fetch with a timeout, record usage, then store the
    /// result. Only storage errors are returned as `Err`.
    async fn attempt(
        &self,
        network: &str,
        provider: &str,
        allowance: &Allowance,
        address: &str,
        cache_type: CacheType,
    ) -> Result<Attempt> {
        let request = FetchRequest::new(network, address, cache_type);
        let started = Instant::now();
        let fetched = match tokio::time::timeout(self.config.fetch_timeout(), self.fetcher.fetch(&request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "no response within {}s",
                self.config.fetch_timeout_secs
            ))),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut event = UsageEvent::new(network, provider, fetched.is_ok())
            .with_address(address)
            .with_response_time(elapsed_ms)
            .under(allowance.reservation());
        if let Err(e) = &fetched {
            event = event.with_error_kind(e.fetch_kind().unwrap_or(FetchErrorKind::Transient));
        }
        self.quota.record_call(&event).await?;

        match fetched {
            Ok(source) => {
                self.store(network, address, cache_type, source).await?;
                Ok(Attempt::Stored)
            }
            Err(e) => {
                let kind = e.fetch_kind().unwrap_or(FetchErrorKind::Transient);
                tracing::warn!(
                    network,
                    address,
                    cache_type = %cache_type,
                    kind = %kind,
                    error = %e,
                    "fetch failed"
                );
                Ok(Attempt::Failed {
                    kind,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn store(
        &self,
        network: &str,
        address: &str,
        cache_type: CacheType,
        source: FetchedSource,
    ) -> Result<()> {
        let ttl_hours = self.cache_policy.ttl_for(cache_type);
        let score = self.cache_policy.quality_weights.score(
            cache_type,
            &source.payload,
            &source.meta,
            ttl_hours,
            Utc::now(),
        );

        let entry = CacheEntry::new(
            network,
            address,
            cache_type,
            source.payload,
            source.meta.fetched_at,
            ttl_hours,
            score,
            source.meta.verified,
        );
        self.cache.put(&entry).await?;

        tracing::debug!(
            network,
            address,
            cache_type = %cache_type,
            quality_score = entry.quality_score,
            size_bytes = entry.size_bytes,
            "cache entry stored"
        );
        Ok(())
    }
}
