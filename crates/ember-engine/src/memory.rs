//! In-memory adapters for the storage ports.
//!
//! Each adapter keeps its state behind a single lock, so every operation is
//! atomic with respect to other callers in the same process. They back the
//! engine tests and single-process runs; multi-process deployments use the
//! PostgreSQL adapters.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ember_core::cache::{
    CacheEntry, CacheRead, CacheStats, CacheType, CleanupReport, CleanupRule, StatsFilter,
    low_quality_since,
};
use ember_core::config::{CachePolicy, QueuePolicy};
use ember_core::ids::{QueueItemId, ReservationId};
use ember_core::ports::{CacheStore, UsageLog, WarmingQueue};
use ember_core::queue::{
    ClaimFilter, EnqueueOutcome, EnqueueRequest, FailOutcome, Priority, QueueStats, QueueStatus,
    WarmingQueueItem,
};
use ember_core::quota::{QuotaReservation, UsageCounts, UsageEvent, grantable, start_of_day, window_bounds};
use ember_core::{Error, Result, normalize_address};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::{Mutex, RwLock};

type CacheKey = (String, String, CacheType);

struct StoredEntry {
    entry: CacheEntry,
    low_quality_since: Option<DateTime<Utc>>,
}

/// In-memory implementation of CacheStore.
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<CacheKey, StoredEntry>>,
    policy: CachePolicy,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::with_policy(CachePolicy::default())
    }

    pub fn with_policy(policy: CachePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    fn key(network: &str, address: &str, cache_type: CacheType) -> CacheKey {
        (network.to_string(), normalize_address(address), cache_type)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(
        &self,
        network: &str,
        address: &str,
        cache_type: CacheType,
        read: CacheRead,
    ) -> Result<Option<CacheEntry>> {
        let key = Self::key(network, address, cache_type);
        match read {
            CacheRead::Peek => Ok(self
                .entries
                .read()
                .await
                .get(&key)
                .map(|stored| stored.entry.clone())),
            CacheRead::Hit => {
                let mut entries = self.entries.write().await;
                Ok(entries.get_mut(&key).map(|stored| {
                    stored.entry.hit_count += 1;
                    stored.entry.api_calls_saved += 1;
                    stored.entry.clone()
                }))
            }
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let key = Self::key(&entry.network, &entry.address, entry.cache_type);
        let mut entries = self.entries.write().await;

        let mut next = entry.clone();
        next.address = key.1.clone();
        next.quality_score = ember_core::cache::clamp_score(next.quality_score);

        let previous_since = match entries.get(&key) {
            Some(existing) if existing.entry.fetched_at > entry.fetched_at => {
                tracing::debug!(
                    network = %entry.network,
                    address = %entry.address,
                    cache_type = %entry.cache_type,
                    "stored entry is newer, write ignored"
                );
                return Ok(());
            }
            Some(existing) => {
                next.hit_count = next.hit_count.max(existing.entry.hit_count);
                next.api_calls_saved = next.api_calls_saved.max(existing.entry.api_calls_saved);
                existing.low_quality_since
            }
            None => None,
        };

        let since = low_quality_since(&next, previous_since, self.policy.low_quality_floor);
        entries.insert(
            key,
            StoredEntry {
                entry: next,
                low_quality_since: since,
            },
        );
        Ok(())
    }

    async fn stats(&self, filter: &StatsFilter) -> Result<CacheStats> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let mut stats = CacheStats::default();
        let mut quality_sum = 0.0;

        for stored in entries.values().filter(|s| filter.matches(&s.entry)) {
            let entry = &stored.entry;
            stats.total_entries += 1;
            if entry.is_expired(now) {
                stats.expired_entries += 1;
            } else {
                stats.active_entries += 1;
            }
            if entry.quality_score < self.policy.low_quality_floor {
                stats.low_quality_entries += 1;
            }
            quality_sum += entry.quality_score;
            stats.total_hits += entry.hit_count;
            stats.total_api_calls_saved += entry.api_calls_saved;
            stats.total_size_bytes += entry.size_bytes;
        }

        if stats.total_entries > 0 {
            stats.avg_quality = quality_sum / stats.total_entries as f64;
        }
        Ok(stats)
    }

    async fn cleanup(&self, aggressive: bool) -> Result<CleanupReport> {
        let rule = CleanupRule::new(&self.policy, aggressive, Utc::now());
        let mut entries = self.entries.write().await;
        let mut report = CleanupReport::default();

        entries.retain(|_, stored| {
            if rule.should_delete(&stored.entry, stored.low_quality_since) {
                report.deleted += 1;
                report.bytes_freed += stored.entry.size_bytes;
                false
            } else {
                true
            }
        });

        Ok(report)
    }

    async fn expiring_within(
        &self,
        network: &str,
        cache_type: CacheType,
        within: Duration,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let horizon = Utc::now() + within;
        let entries = self.entries.read().await;

        let mut matching: Vec<CacheEntry> = entries
            .values()
            .map(|s| &s.entry)
            .filter(|e| e.network == network && e.cache_type == cache_type && e.expires_at() < horizon)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.expires_at());
        matching.truncate(limit);
        Ok(matching)
    }

    async fn hit_count_percentile(
        &self,
        network: &str,
        cache_type: CacheType,
        percentile: f64,
    ) -> Result<u64> {
        let entries = self.entries.read().await;
        let mut hits: Vec<u64> = entries
            .values()
            .map(|s| &s.entry)
            .filter(|e| e.network == network && e.cache_type == cache_type)
            .map(|e| e.hit_count)
            .collect();

        if hits.is_empty() {
            return Ok(0);
        }
        hits.sort_unstable();

        let rank = (percentile.clamp(0.0, 1.0) * hits.len() as f64).ceil() as usize;
        Ok(hits[rank.max(1) - 1])
    }

    async fn most_accessed(
        &self,
        network: &str,
        cache_type: CacheType,
        min_hits: u64,
        expiring_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let entries = self.entries.read().await;
        let mut matching: Vec<CacheEntry> = entries
            .values()
            .map(|s| &s.entry)
            .filter(|e| {
                e.network == network
                    && e.cache_type == cache_type
                    && e.hit_count >= min_hits
                    && e.hit_count > 0
                    && e.expires_at() < expiring_before
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| a.expires_at().cmp(&b.expires_at()))
        });
        matching.truncate(limit);
        Ok(matching)
    }
}

#[derive(Default)]
struct QueueState {
    items: BTreeMap<QueueItemId, WarmingQueueItem>,
    paused: bool,
}

/// In-memory implementation of WarmingQueue.
pub struct MemoryWarmingQueue {
    state: Mutex<QueueState>,
    policy: QueuePolicy,
}

impl MemoryWarmingQueue {
    pub fn new() -> Self {
        Self::with_policy(QueuePolicy::default())
    }

    pub fn with_policy(policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
        }
    }

    async fn record_failure(&self, id: QueueItemId, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::QueueItemNotFound(id.to_string()))?;
        ensure_processing(item, QueueStatus::Failed)?;
        Ok(item.record_failure(error, retryable, &self.policy, Utc::now()))
    }
}

impl Default for MemoryWarmingQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_processing(item: &WarmingQueueItem, to: QueueStatus) -> Result<()> {
    if item.status == QueueStatus::Processing {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            id: item.id.to_string(),
            from: item.status.to_string(),
            to: to.to_string(),
        })
    }
}

#[async_trait]
impl WarmingQueue for MemoryWarmingQueue {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome> {
        let mut request = request.clone();
        request.contract_address = normalize_address(&request.contract_address);

        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .items
            .values()
            .find(|item| item.is_active() && item.same_target(&request))
        {
            return Ok(EnqueueOutcome {
                id: existing.id,
                deduped: true,
            });
        }

        let item = WarmingQueueItem::from_request(&request, Utc::now());
        let id = item.id;
        state.items.insert(id, item);
        Ok(EnqueueOutcome { id, deduped: false })
    }

    async fn claim_batch(&self, limit: usize, filter: &ClaimFilter) -> Result<Vec<WarmingQueueItem>> {
        let mut state = self.state.lock().await;
        if state.paused || limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut ready: Vec<&WarmingQueueItem> = state
            .items
            .values()
            .filter(|item| {
                item.status == QueueStatus::Pending && item.scheduled_at <= now && filter.matches(item)
            })
            .collect();
        ready.sort_by(|a, b| a.claim_order(b));
        let ids: Vec<QueueItemId> = ready.iter().take(limit).map(|item| item.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = state.items.get_mut(&id) {
                item.status = QueueStatus::Processing;
                item.claimed_at = Some(now);
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: QueueItemId) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::QueueItemNotFound(id.to_string()))?;
        ensure_processing(item, QueueStatus::Completed)?;
        item.status = QueueStatus::Completed;
        item.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(&self, id: QueueItemId, error: &str) -> Result<FailOutcome> {
        self.record_failure(id, error, true).await
    }

    async fn fail_permanently(&self, id: QueueItemId, error: &str) -> Result<FailOutcome> {
        self.record_failure(id, error, false).await
    }

    async fn release(&self, id: QueueItemId) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::QueueItemNotFound(id.to_string()))?;
        ensure_processing(item, QueueStatus::Pending)?;
        item.status = QueueStatus::Pending;
        item.claimed_at = None;
        Ok(())
    }

    async fn reset_stuck(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.policy.processing_timeout();
        let mut state = self.state.lock().await;
        let mut count = 0;

        for item in state.items.values_mut() {
            if item.status == QueueStatus::Processing && item.claimed_at.is_some_and(|at| at <= cutoff) {
                item.status = QueueStatus::Pending;
                item.claimed_at = None;
                count += 1;
            }
        }

        if count > 0 {
            tracing::warn!(count, "reset stuck warming queue items");
        }
        Ok(count)
    }

    async fn pause(&self) -> Result<()> {
        self.state.lock().await.paused = true;
        tracing::info!("warming queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.state.lock().await.paused = false;
        tracing::info!("warming queue resumed");
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.state.lock().await.paused)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            paused: state.paused,
            ..Default::default()
        };
        let mut processing_secs = Vec::new();

        for item in state.items.values() {
            stats.total += 1;
            match item.status {
                QueueStatus::Pending => {
                    stats.pending += 1;
                    *stats.by_priority.entry(item.priority.to_string()).or_insert(0) += 1;
                    *stats.by_network.entry(item.network.clone()).or_insert(0) += 1;
                }
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => {
                    stats.completed += 1;
                    if let (Some(claimed), Some(done)) = (item.claimed_at, item.completed_at) {
                        processing_secs.push((done - claimed).num_milliseconds() as f64 / 1000.0);
                    }
                }
                QueueStatus::Failed => stats.failed += 1,
            }
        }

        let avg = if processing_secs.is_empty() {
            None
        } else {
            Some(processing_secs.iter().sum::<f64>() / processing_secs.len() as f64)
        };
        Ok(stats.finish(avg))
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<WarmingQueueItem>> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn recent_failures(
        &self,
        network: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut latest: HashMap<&str, DateTime<Utc>> = HashMap::new();

        for item in state.items.values().filter(|i| i.network == network) {
            if let Some(failed_at) = item.last_failed_at.filter(|at| *at >= since) {
                let slot = latest.entry(item.contract_address.as_str()).or_insert(failed_at);
                *slot = (*slot).max(failed_at);
            }
        }

        Ok(most_recent_first(latest, limit))
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|_, item| {
            !(item.status.is_terminal() && item.completed_at.unwrap_or(item.created_at) < older_than)
        });
        Ok((before - state.items.len()) as u64)
    }
}

/// In-memory implementation of UsageLog.
#[derive(Default)]
pub struct MemoryUsageLog {
    events: RwLock<Vec<UsageEvent>>,
    reservations: Mutex<HashMap<ReservationId, QuotaReservation>>,
}

/// Calls still held by live reservations for `(network, provider)`.
fn held_calls(
    reservations: &HashMap<ReservationId, QuotaReservation>,
    events: &[UsageEvent],
    network: &str,
    provider: &str,
    now: DateTime<Utc>,
) -> u64 {
    reservations
        .values()
        .filter(|r| r.network == network && r.provider == provider && r.expires_at > now)
        .map(|r| {
            let consumed = events.iter().filter(|e| e.reservation_id == Some(r.id)).count() as u64;
            r.granted.saturating_sub(consumed)
        })
        .sum()
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl UsageLog for MemoryUsageLog {
    async fn append(&self, event: &UsageEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn counts(&self, network: &str, provider: &str, now: DateTime<Utc>) -> Result<UsageCounts> {
        let (minute, hour, day) = window_bounds(now);
        let events = self.events.read().await;
        let mut counts = UsageCounts::default();

        for event in events
            .iter()
            .filter(|e| e.network == network && e.provider == provider && e.occurred_at <= now)
        {
            if event.occurred_at >= minute {
                counts.requests_last_minute += 1;
            }
            if event.occurred_at >= hour {
                counts.requests_last_hour += 1;
                if !event.success {
                    counts.errors_last_hour += 1;
                }
            }
            if event.occurred_at >= day {
                counts.used_today += 1;
            }
        }
        Ok(counts)
    }

    async fn active_pairs(&self, since: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let events = self.events.read().await;
        let pairs: BTreeSet<(String, String)> = events
            .iter()
            .filter(|e| e.occurred_at >= since)
            .map(|e| (e.network.clone(), e.provider.clone()))
            .collect();
        Ok(pairs.into_iter().collect())
    }

    async fn recent_addresses(
        &self,
        network: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let events = self.events.read().await;
        let mut latest: HashMap<&str, DateTime<Utc>> = HashMap::new();

        for event in events.iter().filter(|e| e.network == network && e.occurred_at >= since) {
            if let Some(address) = event.contract_address.as_deref() {
                let slot = latest.entry(address).or_insert(event.occurred_at);
                *slot = (*slot).max(event.occurred_at);
            }
        }

        Ok(most_recent_first(latest, limit))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = cutoff.min(start_of_day(Utc::now()));
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.occurred_at >= cutoff);
        Ok((before - events.len()) as u64)
    }

    async fn reserve(
        &self,
        network: &str,
        provider: &str,
        requested: u64,
        budget: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<QuotaReservation> {
        let now = Utc::now();
        let mut reservations = self.reservations.lock().await;
        reservations.retain(|_, r| r.expires_at > now);

        let events = self.events.read().await;
        let day = start_of_day(now);
        let used_today = events
            .iter()
            .filter(|e| e.network == network && e.provider == provider && e.occurred_at >= day)
            .count() as u64;
        let held = held_calls(&reservations, &events, network, provider, now);

        let reservation = QuotaReservation {
            id: ReservationId::new(),
            network: network.to_string(),
            provider: provider.to_string(),
            granted: grantable(requested, budget, used_today, held),
            expires_at,
        };
        if reservation.granted > 0 {
            reservations.insert(reservation.id, reservation.clone());
        }
        Ok(reservation)
    }

    async fn release(&self, id: ReservationId) -> Result<()> {
        self.reservations.lock().await.remove(&id);
        Ok(())
    }
}

fn most_recent_first(latest: HashMap<&str, DateTime<Utc>>, limit: usize) -> Vec<String> {
    let mut ordered: Vec<(&str, DateTime<Utc>)> = latest.into_iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ordered
        .into_iter()
        .take(limit)
        .map(|(address, _)| address.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(address: &str, fetched_at: DateTime<Utc>, ttl_hours: i64, score: f64) -> CacheEntry {
        CacheEntry::new(
            "ethereum",
            address,
            CacheType::Source,
            json!({"source_code": "contract A {}"}),
            fetched_at,
            ttl_hours,
            score,
            true,
        )
    }

    fn fast_policy() -> QueuePolicy {
        QueuePolicy {
            retry_backoff_secs: 0,
            processing_timeout_secs: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_hit_read_bumps_counters_once() {
        let store = MemoryCacheStore::new();
        store.put(&entry("0xAA", Utc::now(), 24, 0.9)).await.unwrap();

        let peek = store
            .get("ethereum", "0xaa", CacheType::Source, CacheRead::Peek)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peek.hit_count, 0);

        let hit = store
            .get("ethereum", "0xAA", CacheType::Source, CacheRead::Hit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.hit_count, 1);
        assert_eq!(hit.api_calls_saved, 1);

        let missing = store
            .get("ethereum", "0xbb", CacheType::Source, CacheRead::Hit)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_put_keeps_counters_and_last_write_wins() {
        let store = MemoryCacheStore::new();
        let now = Utc::now();
        store.put(&entry("0xaa", now - Duration::hours(2), 24, 0.5)).await.unwrap();
        store
            .get("ethereum", "0xaa", CacheType::Source, CacheRead::Hit)
            .await
            .unwrap();

        // Refresh overwrites payload metadata but keeps the counters.
        store.put(&entry("0xaa", now, 24, 0.9)).await.unwrap();
        let current = store
            .get("ethereum", "0xaa", CacheType::Source, CacheRead::Peek)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.quality_score, 0.9);
        assert_eq!(current.hit_count, 1);

        // An older fetch does not replace a newer one.
        store.put(&entry("0xaa", now - Duration::hours(5), 24, 0.1)).await.unwrap();
        let current = store
            .get("ethereum", "0xaa", CacheType::Source, CacheRead::Peek)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.quality_score, 0.9);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let store = MemoryCacheStore::new();
        let now = Utc::now();
        store.put(&entry("0x01", now - Duration::days(10), 24, 0.9)).await.unwrap();
        store.put(&entry("0x02", now - Duration::days(40), 24 * 60, 0.1)).await.unwrap();
        store.put(&entry("0x03", now, 24, 0.1)).await.unwrap();
        store.put(&entry("0x04", now, 24, 0.9)).await.unwrap();

        let first = store.cleanup(false).await.unwrap();
        assert_eq!(first.deleted, 2);
        assert!(first.bytes_freed > 0);

        let second = store.cleanup(false).await.unwrap();
        assert_eq!(second, CleanupReport::default());

        let aggressive = store.cleanup(true).await.unwrap();
        assert_eq!(aggressive.deleted, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let store = MemoryCacheStore::new();
        let now = Utc::now();
        store.put(&entry("0x01", now - Duration::hours(30), 24, 0.8)).await.unwrap();
        store.put(&entry("0x02", now, 24, 0.2)).await.unwrap();
        store
            .get("ethereum", "0x02", CacheType::Source, CacheRead::Hit)
            .await
            .unwrap();

        let stats = store.stats(&StatsFilter::default()).await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.low_quality_entries, 1);
        assert!((stats.avg_quality - 0.5).abs() < 1e-9);
        assert_eq!(stats.total_api_calls_saved, 1);

        let other = store.stats(&StatsFilter::network("bsc")).await.unwrap();
        assert_eq!(other.total_entries, 0);
        assert_eq!(other.avg_quality, 0.0);
    }

    #[tokio::test]
    async fn test_candidate_queries() {
        let store = MemoryCacheStore::new();
        let now = Utc::now();
        // Expires in 2h, 10h and 100h.
        store.put(&entry("0x01", now - Duration::hours(22), 24, 0.9)).await.unwrap();
        store.put(&entry("0x02", now - Duration::hours(14), 24, 0.9)).await.unwrap();
        store.put(&entry("0x03", now, 100, 0.9)).await.unwrap();
        for _ in 0..5 {
            store.get("ethereum", "0x02", CacheType::Source, CacheRead::Hit).await.unwrap();
        }
        store.get("ethereum", "0x01", CacheType::Source, CacheRead::Hit).await.unwrap();

        let expiring = store
            .expiring_within("ethereum", CacheType::Source, Duration::hours(24), 10)
            .await
            .unwrap();
        let addresses: Vec<_> = expiring.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addresses, vec!["0x01", "0x02"]);

        assert_eq!(
            store.hit_count_percentile("ethereum", CacheType::Source, 0.9).await.unwrap(),
            5
        );
        assert_eq!(
            store.hit_count_percentile("ethereum", CacheType::Source, 0.5).await.unwrap(),
            1
        );
        assert_eq!(
            store.hit_count_percentile("ethereum", CacheType::Abi, 0.9).await.unwrap(),
            0
        );

        let hot = store
            .most_accessed("ethereum", CacheType::Source, 1, now + Duration::hours(48), 10)
            .await
            .unwrap();
        let addresses: Vec<_> = hot.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addresses, vec!["0x02", "0x01"]);
    }

    #[tokio::test]
    async fn test_enqueue_dedups_active_items() {
        let queue = MemoryWarmingQueue::with_policy(fast_policy());
        let request = EnqueueRequest::new("ethereum", "0xAA", CacheType::Source);

        let first = queue.enqueue(&request).await.unwrap();
        let second = queue.enqueue(&EnqueueRequest::new("ethereum", "0xaa", CacheType::Source)).await.unwrap();
        assert!(!first.deduped);
        assert!(second.deduped);
        assert_eq!(first.id, second.id);

        // A different cache type is a different target.
        let abi = queue.enqueue(&EnqueueRequest::new("ethereum", "0xaa", CacheType::Abi)).await.unwrap();
        assert!(!abi.deduped);

        // Once finished, the same target may be enqueued again.
        let claimed = queue.claim_batch(10, &ClaimFilter::default()).await.unwrap();
        for item in &claimed {
            queue.complete(item.id).await.unwrap();
        }
        let again = queue.enqueue(&request).await.unwrap();
        assert!(!again.deduped);
        assert_ne!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_claim_order_and_filter() {
        let queue = MemoryWarmingQueue::new();
        let now = Utc::now();
        queue
            .enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source).with_priority(Priority::Low))
            .await
            .unwrap();
        queue
            .enqueue(
                &EnqueueRequest::new("ethereum", "0x02", CacheType::Source)
                    .with_priority(Priority::High)
                    .scheduled_at(now - Duration::minutes(1)),
            )
            .await
            .unwrap();
        queue
            .enqueue(&EnqueueRequest::new("bsc", "0x03", CacheType::Source).with_priority(Priority::High))
            .await
            .unwrap();
        queue
            .enqueue(
                &EnqueueRequest::new("ethereum", "0x04", CacheType::Source)
                    .with_priority(Priority::High)
                    .scheduled_at(now + Duration::hours(1)),
            )
            .await
            .unwrap();

        let claimed = queue.claim_batch(10, &ClaimFilter::network("ethereum")).await.unwrap();
        let addresses: Vec<_> = claimed.iter().map(|i| i.contract_address.as_str()).collect();
        // 0x04 is not due yet; bsc is filtered out.
        assert_eq!(addresses, vec!["0x02", "0x01"]);
        assert!(claimed.iter().all(|i| i.status == QueueStatus::Processing && i.claimed_at.is_some()));

        let filter = ClaimFilter {
            network: None,
            priority: Some(Priority::Low),
        };
        assert!(queue.claim_batch(10, &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_blocks_claims() {
        let queue = MemoryWarmingQueue::new();
        queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();

        queue.pause().await.unwrap();
        assert!(queue.is_paused().await.unwrap());
        assert!(queue.claim_batch(5, &ClaimFilter::default()).await.unwrap().is_empty());

        queue.resume().await.unwrap();
        assert_eq!(queue.claim_batch(5, &ClaimFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_termination() {
        let queue = MemoryWarmingQueue::with_policy(fast_policy());
        let outcome = queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();

        for attempt in 1..=4u32 {
            let claimed = queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {attempt} should claim the item");
            queue.fail(outcome.id, "502 Bad Gateway").await.unwrap();
        }

        let item = queue.get(outcome.id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 3);
        assert!(queue.claim_batch(1, &ClaimFilter::default()).await.unwrap().is_empty());

        // Explicit re-enqueue starts over.
        let again = queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();
        assert!(!again.deduped);
    }

    #[tokio::test]
    async fn test_retry_count_tracks_requeues_only() {
        let queue = MemoryWarmingQueue::with_policy(fast_policy());
        let retried = queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();
            outcomes.push(queue.fail(retried.id, "timeout").await.unwrap());
        }
        let counts: Vec<u32> = outcomes
            .iter()
            .map(|o| match o {
                FailOutcome::Requeued { retry_count, .. } | FailOutcome::Terminal { retry_count } => *retry_count,
            })
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 3]);
        assert!(matches!(outcomes[3], FailOutcome::Terminal { .. }));

        let rejected = queue.enqueue(&EnqueueRequest::new("ethereum", "0x02", CacheType::Source)).await.unwrap();
        queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();
        let outcome = queue.fail_permanently(rejected.id, "contract source code not verified").await.unwrap();
        assert_eq!(outcome, FailOutcome::Terminal { retry_count: 0 });

        let item = queue.get(rejected.id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn test_fail_applies_backoff() {
        let queue = MemoryWarmingQueue::new();
        let outcome = queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();
        queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();

        let failed = queue.fail(outcome.id, "timeout").await.unwrap();
        assert!(matches!(failed, FailOutcome::Requeued { retry_count: 1, .. }));
        // Scheduled five minutes out, so not claimable yet.
        assert!(queue.claim_batch(1, &ClaimFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let queue = MemoryWarmingQueue::new();
        let outcome = queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();

        assert!(matches!(
            queue.complete(outcome.id).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.complete(QueueItemId::new()).await,
            Err(Error::QueueItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_stuck_keeps_retry_count() {
        let queue = MemoryWarmingQueue::with_policy(fast_policy());
        let outcome = queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();
        queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();
        queue.fail(outcome.id, "timeout").await.unwrap();
        queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();

        let reset = queue.reset_stuck().await.unwrap();
        assert_eq!(reset, 1);

        let item = queue.get(outcome.id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(queue.claim_batch(1, &ClaimFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_stuck_respects_timeout() {
        let queue = MemoryWarmingQueue::new();
        queue.enqueue(&EnqueueRequest::new("ethereum", "0x01", CacheType::Source)).await.unwrap();
        queue.claim_batch(1, &ClaimFilter::default()).await.unwrap();
        assert_eq!(queue.reset_stuck().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_stats_and_purge() {
        let queue = MemoryWarmingQueue::with_policy(fast_policy());
        for address in ["0x01", "0x02", "0x03"] {
            queue.enqueue(&EnqueueRequest::new("ethereum", address, CacheType::Source)).await.unwrap();
        }
        queue
            .enqueue(&EnqueueRequest::new("bsc", "0x04", CacheType::Source).with_priority(Priority::High))
            .await
            .unwrap();

        let claimed = queue.claim_batch(2, &ClaimFilter::network("ethereum")).await.unwrap();
        queue.complete(claimed[0].id).await.unwrap();
        queue.fail_permanently(claimed[1].id, "not verified").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.by_network.get("bsc"), Some(&1));
        assert_eq!(stats.by_priority.get("high"), Some(&1));
        assert!(stats.estimated_queue_seconds >= 0.0);

        let failures = queue
            .recent_failures("ethereum", Utc::now() - Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(failures, vec![claimed[1].contract_address.clone()]);

        let purged = queue.purge_finished(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(purged, 2);
        assert_eq!(queue.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_usage_windows() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();
        log.append(&UsageEvent::new("ethereum", "etherscan", true).at(now - Duration::seconds(10)))
            .await
            .unwrap();
        log.append(&UsageEvent::new("ethereum", "etherscan", false).at(now - Duration::minutes(30)))
            .await
            .unwrap();
        log.append(&UsageEvent::new("ethereum", "etherscan", true).at(now - Duration::days(2)))
            .await
            .unwrap();
        log.append(&UsageEvent::new("bsc", "bscscan", true).at(now)).await.unwrap();

        let counts = log.counts("ethereum", "etherscan", now).await.unwrap();
        assert_eq!(counts.requests_last_minute, 1);
        assert_eq!(counts.requests_last_hour, 2);
        assert_eq!(counts.errors_last_hour, 1);
        assert!(counts.used_today >= 1 && counts.used_today <= 2);

        let pairs = log.active_pairs(start_of_day(now)).await.unwrap();
        assert!(pairs.contains(&("bsc".to_string(), "bscscan".to_string())));
    }

    #[tokio::test]
    async fn test_purge_never_touches_today() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();
        log.append(&UsageEvent::new("ethereum", "etherscan", true).at(now)).await.unwrap();
        log.append(&UsageEvent::new("ethereum", "etherscan", true).at(now - Duration::days(3)))
            .await
            .unwrap();

        let before = log.counts("ethereum", "etherscan", now).await.unwrap().used_today;
        let purged = log.purge_before(now + Duration::days(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(log.counts("ethereum", "etherscan", now).await.unwrap().used_today, before);
    }

    #[tokio::test]
    async fn test_recent_addresses_most_recent_first() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();
        for (address, minutes) in [("0x01", 30), ("0x02", 5), ("0x01", 1), ("0x03", 120)] {
            log.append(
                &UsageEvent::new("ethereum", "etherscan", true)
                    .with_address(address)
                    .at(now - Duration::minutes(minutes)),
            )
            .await
            .unwrap();
        }

        let recent = log
            .recent_addresses("ethereum", now - Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(recent, vec!["0x01", "0x02"]);
    }
}
