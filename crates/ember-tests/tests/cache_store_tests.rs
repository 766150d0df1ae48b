//! Cache store integration tests.
//!
//! Run with: `cargo test -p ember-tests --test cache_store_tests --features integration`

#![cfg(feature = "integration")]

use chrono::{Duration, Utc};
use ember_core::cache::{CacheRead, CacheType, StatsFilter};
use ember_core::ports::CacheStore;
use ember_tests::{TestContext, fixtures::CacheEntryFixture};

#[tokio::test]
async fn test_hit_counters_and_peek() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let cache = ctx.cache();

    let entry = CacheEntryFixture::fresh("ethereum", "0xAbC");
    cache.put(&entry).await.expect("Failed to put");

    let peeked = cache
        .get("ethereum", "0xabc", CacheType::Source, CacheRead::Peek)
        .await
        .expect("Failed to get")
        .expect("Entry not found");
    assert_eq!(peeked.hit_count, 0);

    for _ in 0..3 {
        cache
            .get("ethereum", "0xABC", CacheType::Source, CacheRead::Hit)
            .await
            .expect("Failed to get");
    }
    let hit = cache
        .get("ethereum", "0xabc", CacheType::Source, CacheRead::Peek)
        .await
        .expect("Failed to get")
        .expect("Entry not found");
    assert_eq!(hit.hit_count, 3);
    assert_eq!(hit.api_calls_saved, 3);

    let missing = cache
        .get("ethereum", "0xabc", CacheType::Abi, CacheRead::Hit)
        .await
        .expect("Failed to get");
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_refresh_keeps_counters_and_last_write_wins() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let cache = ctx.cache();

    let first = CacheEntryFixture::aged("ethereum", "0x01", 10, 0.8);
    cache.put(&first).await.expect("Failed to put");
    cache
        .get("ethereum", "0x01", CacheType::Source, CacheRead::Hit)
        .await
        .expect("Failed to get");

    let newer = CacheEntryFixture::aged("ethereum", "0x01", 1, 0.95);
    cache.put(&newer).await.expect("Failed to put");

    let older = CacheEntryFixture::aged("ethereum", "0x01", 20, 0.5);
    cache.put(&older).await.expect("Failed to put");

    let stored = cache
        .get("ethereum", "0x01", CacheType::Source, CacheRead::Peek)
        .await
        .expect("Failed to get")
        .expect("Entry not found");
    assert_eq!(stored.quality_score, 0.95);
    assert_eq!(stored.hit_count, 1);
    assert!((stored.fetched_at - newer.fetched_at).num_milliseconds().abs() < 1);
}

#[tokio::test]
async fn test_stats_and_cleanup() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let cache = ctx.cache();

    cache
        .put(&CacheEntryFixture::fresh("ethereum", "0x01"))
        .await
        .expect("Failed to put");
    cache
        .put(&CacheEntryFixture::long_expired("ethereum", "0x02"))
        .await
        .expect("Failed to put");
    cache
        .put(&CacheEntryFixture::low_quality("ethereum", "0x03"))
        .await
        .expect("Failed to put");
    cache
        .put(&CacheEntryFixture::fresh("bsc", "0x04"))
        .await
        .expect("Failed to put");

    let all = cache.stats(&StatsFilter::default()).await.expect("Failed to get stats");
    assert_eq!(all.total_entries, 4);
    assert_eq!(all.expired_entries, 1);
    assert_eq!(all.active_entries, 3);
    assert_eq!(all.low_quality_entries, 1);

    let eth = cache
        .stats(&StatsFilter::network("ethereum"))
        .await
        .expect("Failed to get stats");
    assert_eq!(eth.total_entries, 3);

    let gentle = cache.cleanup(false).await.expect("Failed to clean up");
    assert_eq!(gentle.deleted, 1);
    assert!(gentle.bytes_freed > 0);

    let again = cache.cleanup(false).await.expect("Failed to clean up");
    assert_eq!(again.deleted, 0);

    let aggressive = cache.cleanup(true).await.expect("Failed to clean up");
    assert_eq!(aggressive.deleted, 1);

    let remaining = cache.stats(&StatsFilter::default()).await.expect("Failed to get stats");
    assert_eq!(remaining.total_entries, 2);
}

#[tokio::test]
async fn test_candidate_queries() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let cache = ctx.cache();

    // Expires in 8h, 18h and 168h.
    for (address, age) in [("0x01", 160), ("0x02", 150), ("0x03", 0)] {
        cache
            .put(&CacheEntryFixture::aged("ethereum", address, age, 0.9))
            .await
            .expect("Failed to put");
    }
    for _ in 0..5 {
        cache
            .get("ethereum", "0x02", CacheType::Source, CacheRead::Hit)
            .await
            .expect("Failed to get");
    }

    let expiring = cache
        .expiring_within("ethereum", CacheType::Source, Duration::hours(24), 10)
        .await
        .expect("Failed to query");
    let expiring: Vec<_> = expiring.iter().map(|e| e.address.as_str()).collect();
    assert_eq!(expiring, vec!["0x01", "0x02"]);

    let threshold = cache
        .hit_count_percentile("ethereum", CacheType::Source, 0.9)
        .await
        .expect("Failed to query");
    assert_eq!(threshold, 5);

    let hot = cache
        .most_accessed(
            "ethereum",
            CacheType::Source,
            threshold,
            Utc::now() + Duration::hours(48),
            10,
        )
        .await
        .expect("Failed to query");
    assert_eq!(hot.len(), 1);
    assert_eq!(hot[0].address, "0x02");
}
