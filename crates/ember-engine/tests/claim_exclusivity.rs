//! Concurrent claims against the in-memory queue never hand one item to
//! two workers.

use ember_core::cache::CacheType;
use ember_core::ports::WarmingQueue;
use ember_core::queue::{ClaimFilter, EnqueueRequest};
use ember_engine::MemoryWarmingQueue;
use futures::future::join_all;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

async fn seeded_queue(pending: usize) -> Arc<MemoryWarmingQueue> {
    let queue = Arc::new(MemoryWarmingQueue::new());
    for i in 0..pending {
        let request = EnqueueRequest::new("ethereum", &format!("0x{i:040x}"), CacheType::Source);
        queue.enqueue(&request).await.unwrap();
    }
    queue
}

/// Run `workers` claim loops in parallel, each claiming `batch` at a time
/// until the queue is drained. Returns every batch any worker received.
async fn drain(queue: Arc<MemoryWarmingQueue>, workers: usize, batch: usize) -> Vec<Vec<String>> {
    let handles = (0..workers).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut batches = Vec::new();
            loop {
                let items = queue.claim_batch(batch, &ClaimFilter::default()).await.unwrap();
                if items.is_empty() {
                    break;
                }
                batches.push(items.into_iter().map(|i| i.id.to_string()).collect::<Vec<_>>());
                tokio::task::yield_now().await;
            }
            batches
        })
    });

    join_all(handles)
        .await
        .into_iter()
        .flat_map(|joined| joined.unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_claims_over_six_items_are_disjoint() {
    let queue = seeded_queue(6).await;

    let (a, b) = tokio::join!(
        {
            let queue = queue.clone();
            async move { queue.claim_batch(5, &ClaimFilter::default()).await.unwrap() }
        },
        {
            let queue = queue.clone();
            async move { queue.claim_batch(5, &ClaimFilter::default()).await.unwrap() }
        }
    );

    let ids_a: HashSet<_> = a.iter().map(|i| i.id).collect();
    let ids_b: HashSet<_> = b.iter().map(|i| i.id).collect();
    assert!(ids_a.is_disjoint(&ids_b));
    assert_eq!(ids_a.len() + ids_b.len(), 6);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_concurrent_claims_never_overlap(
        pending in 0usize..60,
        workers in 1usize..8,
        batch in 1usize..10,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .unwrap();

        let batches = runtime.block_on(async {
            let queue = seeded_queue(pending).await;
            drain(queue, workers, batch).await
        });

        let mut seen = HashSet::new();
        for batch_ids in &batches {
            prop_assert!(batch_ids.len() <= batch);
            for id in batch_ids {
                prop_assert!(seen.insert(id.clone()), "item {} claimed twice", id);
            }
        }
        prop_assert_eq!(seen.len(), pending);
    }
}
