//! Serialization tests for ember-core types.

use chrono::Utc;
use ember_core::cache::*;
use ember_core::config::EngineConfig;
use ember_core::ids::*;
use ember_core::queue::*;
use ember_core::quota::*;
use ember_core::warming::*;
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn test_cache_entry_roundtrip() {
    let entry = CacheEntry::new(
        "ethereum",
        "0xdAC17F958D2ee523a2206206994597C13D831ec7",
        CacheType::Abi,
        json!({"abi": [{"type": "function", "name": "transfer"}]}),
        Utc::now(),
        168,
        0.85,
        true,
    );

    let json = serde_json::to_string(&entry).expect("serialize");
    let parsed: CacheEntry = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(entry, parsed);
    assert!(json.contains("\"cache_type\":\"abi\""));
}

#[test]
fn test_queue_item_roundtrip() {
    let request = EnqueueRequest::new("bsc", "0x55d398326f99059fF775485246999027B3197955", CacheType::Source)
        .with_priority(Priority::High);
    let item = WarmingQueueItem::from_request(&request, Utc::now());

    let json = serde_json::to_string(&item).expect("serialize");
    let parsed: WarmingQueueItem = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(item.id, parsed.id);
    assert_eq!(parsed.priority, Priority::High);
    assert_eq!(parsed.status, QueueStatus::Pending);
    assert_eq!(parsed.contract_address, "0x55d398326f99059ff775485246999027b3197955");
}

#[test]
fn test_queue_item_id_serializes_as_uuid() {
    let id = QueueItemId::new();
    let json = serde_json::to_value(id).expect("serialize");
    assert_eq!(json, json!(id.as_uuid().to_string()));
}

#[test]
fn test_fail_outcome_tagged() {
    let json = serde_json::to_value(FailOutcome::Terminal { retry_count: 4 }).expect("serialize");
    assert_eq!(json, json!({"outcome": "terminal", "retry_count": 4}));
}

#[test]
fn test_quota_window_json_shape() {
    let window = QuotaWindow::from_counts(
        "polygon",
        "polygonscan",
        5_000,
        UsageCounts {
            requests_last_minute: 1,
            requests_last_hour: 10,
            errors_last_hour: 0,
            used_today: 4_000,
        },
    );

    let json = serde_json::to_value(&window).expect("serialize");
    assert_eq!(json["status"], "warning");
    assert_eq!(json["remaining"], 1_000);
    assert_eq!(json["estimated_hours_remaining"], 100.0);
}

#[test]
fn test_warming_result_roundtrip() {
    let mut result = WarmingResult {
        processed: 5,
        successful: 4,
        failed: 1,
        already_cached: 3,
        api_calls_used: 5,
        allowance: 5,
        ..Default::default()
    };
    result.errors.push(WarmingError {
        address: "0xabc".to_string(),
        message: "Fetch failed (transient): 502 Bad Gateway".to_string(),
    });

    let json = serde_json::to_string(&result).expect("serialize");
    let parsed: WarmingResult = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(result, parsed);
}

#[test]
fn test_engine_config_yaml_roundtrip() {
    let config = EngineConfig::default();
    let yaml = serde_yaml::to_string(&config).expect("serialize");
    let parsed: EngineConfig = serde_yaml::from_str(&yaml).expect("deserialize");

    assert_eq!(parsed.queue.max_retries, config.queue.max_retries);
    assert_eq!(parsed.quota.networks, config.quota.networks);
    assert_eq!(parsed.warmer.popular_tokens, config.warmer.popular_tokens);
}
