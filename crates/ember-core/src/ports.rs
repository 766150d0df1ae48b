//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the warming engine and its
//! storage and fetch adapters. Stores are shared between worker processes,
//! so every implementation must make its mutating operations atomic at the
//! storage level.

use crate::cache::{CacheEntry, CacheRead, CacheStats, CacheType, CleanupReport, StatsFilter};
use crate::fetch::{FetchRequest, FetchedSource};
use crate::ids::{QueueItemId, ReservationId};
use crate::queue::{ClaimFilter, EnqueueOutcome, EnqueueRequest, FailOutcome, QueueStats, WarmingQueueItem};
use crate::quota::{QuotaReservation, UsageCounts, UsageEvent};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Durable cache keyed by `(network, address, cache_type)`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry. With [`CacheRead::Hit`] the entry's `hit_count` and
    /// `api_calls_saved` are bumped once and the returned entry reflects
    /// the bump.
    async fn get(
        &self,
        network: &str,
        address: &str,
        cache_type: CacheType,
        read: CacheRead,
    ) -> Result<Option<CacheEntry>>;

    /// Upsert an entry. Existing counters are kept; a write whose
    /// `fetched_at` is older than the stored one is ignored.
    async fn put(&self, entry: &CacheEntry) -> Result<()>;

    /// Aggregate counts. May lag concurrent writers.
    async fn stats(&self, filter: &StatsFilter) -> Result<CacheStats>;

    /// Delete expired entries past the grace period and entries that stayed
    /// below the low-quality floor past the retention window. With
    /// `aggressive`, every low-quality entry goes regardless of age.
    async fn cleanup(&self, aggressive: bool) -> Result<CleanupReport>;

    /// Entries on `network` that expire within `within` from now, soonest
    /// first. Already expired entries are included.
    async fn expiring_within(
        &self,
        network: &str,
        cache_type: CacheType,
        within: Duration,
        limit: usize,
    ) -> Result<Vec<CacheEntry>>;

    /// The hit count at `percentile` (0..=1) across entries on `network`,
    /// using discrete percentile semantics. Zero when there are no entries.
    async fn hit_count_percentile(
        &self,
        network: &str,
        cache_type: CacheType,
        percentile: f64,
    ) -> Result<u64>;

    /// Entries with at least `min_hits` hits (and at least one) expiring
    /// before `expiring_before`, most accessed first.
    async fn most_accessed(
        &self,
        network: &str,
        cache_type: CacheType,
        min_hits: u64,
        expiring_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>>;
}

/// Durable priority queue of warm requests.
#[async_trait]
pub trait WarmingQueue: Send + Sync {
    /// Insert a pending item, or report the existing active item for the
    /// same `(address, network, cache_type)`.
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome>;

    /// Atomically move up to `limit` due pending items to `processing`,
    /// highest priority then earliest schedule first. No two callers ever
    /// receive the same item. Returns nothing while the queue is paused.
    async fn claim_batch(&self, limit: usize, filter: &ClaimFilter) -> Result<Vec<WarmingQueueItem>>;

    /// Mark a processing item completed.
    async fn complete(&self, id: QueueItemId) -> Result<()>;

    /// Record a failed attempt; requeues with backoff while retries remain.
    async fn fail(&self, id: QueueItemId, error: &str) -> Result<FailOutcome>;

    /// Record a failure that can never succeed; always terminal.
    async fn fail_permanently(&self, id: QueueItemId, error: &str) -> Result<FailOutcome>;

    /// Return a claimed but unattempted item to `pending`, retry count
    /// unchanged.
    async fn release(&self, id: QueueItemId) -> Result<()>;

    /// Requeue items stuck in `processing` past the processing timeout.
    async fn reset_stuck(&self) -> Result<u64>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Get an item by ID.
    async fn get(&self, id: QueueItemId) -> Result<Option<WarmingQueueItem>>;

    /// Distinct addresses on `network` with a failed attempt since `since`,
    /// most recent first.
    async fn recent_failures(
        &self,
        network: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Delete completed and failed items finished before `older_than`.
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Append-only log of external API calls.
#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn append(&self, event: &UsageEvent) -> Result<()>;

    /// Sliding-window counts for `(network, provider)` as of `now`.
    async fn counts(&self, network: &str, provider: &str, now: DateTime<Utc>) -> Result<UsageCounts>;

    /// Distinct `(network, provider)` pairs with events since `since`.
    async fn active_pairs(&self, since: DateTime<Utc>) -> Result<Vec<(String, String)>>;

    /// Distinct contract addresses looked up on `network` since `since`,
    /// most recent first.
    async fn recent_addresses(
        &self,
        network: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Delete events before `cutoff`. Events from the current UTC day are
    /// never deleted.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Atomically set aside up to `requested` calls out of today's `budget`.
    /// The grant accounts for recorded usage and for calls held by other
    /// unexpired reservations; it may be zero.
    async fn reserve(
        &self,
        network: &str,
        provider: &str,
        requested: u64,
        budget: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<QuotaReservation>;

    /// Return a reservation's unused calls. Releasing twice is a no-op.
    async fn release(&self, id: ReservationId) -> Result<()>;
}

/// Fetches explorer data for one address.
///
/// Implementations report failures as [`crate::Error::Fetch`] so the caller
/// can tell permanent failures from transient ones.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedSource>;
}
