//! Warming queue types and state transitions.

use crate::cache::CacheType;
use crate::config::QueuePolicy;
use crate::error::Error;
use crate::ids::QueueItemId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Priority for queue items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Storage rank; higher claims first.
    pub fn rank(&self) -> i16 {
        *self as i16
    }

    pub fn from_rank(rank: i16) -> Self {
        match rank {
            r if r >= 2 => Priority::High,
            1 => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(Error::InvalidPriority(other.to_string())),
        }
    }
}

/// Lifecycle state of a queue item.
///
/// `pending -> processing -> completed | pending | failed`. Only `pending`
/// and `processing` are non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(Error::Internal(format!("unknown queue status: {other}"))),
        }
    }
}

/// A pending or historical warm request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmingQueueItem {
    pub id: QueueItemId,
    pub contract_address: String,
    pub network: String,
    pub cache_type: CacheType,
    pub priority: Priority,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WarmingQueueItem {
    pub fn from_request(request: &EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: QueueItemId::new(),
            contract_address: request.contract_address.clone(),
            network: request.network.clone(),
            cache_type: request.cache_type,
            priority: request.priority,
            status: QueueStatus::Pending,
            retry_count: 0,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            claimed_at: None,
            completed_at: None,
            last_error: None,
            last_failed_at: None,
            created_at: now,
        }
    }

    /// Whether this item blocks an equivalent enqueue.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn same_target(&self, request: &EnqueueRequest) -> bool {
        self.contract_address == request.contract_address
            && self.network == request.network
            && self.cache_type == request.cache_type
    }

    /// Claim order: higher priority first, then earlier schedule.
    pub fn claim_order(&self, other: &Self) -> Ordering {
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => self.scheduled_at.cmp(&other.scheduled_at),
            ordering => ordering,
        }
    }

    /// Apply a failed attempt. The item returns to `pending` after backoff
    /// while retries remain, and only that requeue bumps `retry_count`.
    /// Otherwise it becomes terminal with the counter unchanged.
    pub fn record_failure(
        &mut self,
        error: &str,
        retryable: bool,
        policy: &QueuePolicy,
        now: DateTime<Utc>,
    ) -> FailOutcome {
        self.last_error = Some(error.to_string());
        self.last_failed_at = Some(now);
        self.claimed_at = None;

        let next = self.retry_count + 1;
        if retryable && next <= policy.max_retries {
            self.retry_count = next;
            self.status = QueueStatus::Pending;
            self.scheduled_at = now + policy.backoff_for(next);
            FailOutcome::Requeued {
                retry_count: next,
                scheduled_at: self.scheduled_at,
            }
        } else {
            self.status = QueueStatus::Failed;
            self.completed_at = Some(now);
            FailOutcome::Terminal {
                retry_count: self.retry_count,
            }
        }
    }
}

/// Request to add an address to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub contract_address: String,
    pub network: String,
    pub cache_type: CacheType,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(network: impl Into<String>, address: &str, cache_type: CacheType) -> Self {
        Self {
            contract_address: crate::ids::normalize_address(address),
            network: network.into(),
            cache_type,
            priority: Priority::Medium,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Result of an enqueue. `deduped` means an equivalent active item already
/// existed and nothing was inserted; `id` is that item's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub id: QueueItemId,
    pub deduped: bool,
}

/// Narrows which pending items a claim may take.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    pub network: Option<String>,
    pub priority: Option<Priority>,
}

impl ClaimFilter {
    pub fn network(network: impl Into<String>) -> Self {
        Self {
            network: Some(network.into()),
            priority: None,
        }
    }

    pub fn matches(&self, item: &WarmingQueueItem) -> bool {
        self.network.as_ref().is_none_or(|n| *n == item.network)
            && self.priority.is_none_or(|p| p == item.priority)
    }
}

/// Where a failed item went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    Requeued {
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    },
    Terminal {
        retry_count: u32,
    },
}

/// Default per-item processing time used for queue estimates.
pub const DEFAULT_PROCESSING_SECONDS: f64 = 30.0;

/// Queue counters and derived rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Pending items per priority.
    pub by_priority: BTreeMap<String, u64>,
    /// Pending items per network.
    pub by_network: BTreeMap<String, u64>,
    /// Completed share of finished items, in percent.
    pub success_rate: f64,
    pub avg_processing_seconds: f64,
    pub estimated_queue_seconds: f64,
    pub paused: bool,
}

impl QueueStats {
    /// Fill the derived fields from the raw counters.
    pub fn finish(mut self, avg_processing_seconds: Option<f64>) -> Self {
        let finished = self.completed + self.failed;
        self.success_rate = if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64 * 100.0
        };
        self.avg_processing_seconds = avg_processing_seconds.unwrap_or(0.0);
        let per_item = avg_processing_seconds
            .filter(|secs| *secs > 0.0)
            .unwrap_or(DEFAULT_PROCESSING_SECONDS);
        self.estimated_queue_seconds = self.pending as f64 * per_item;
        self
    }
}
