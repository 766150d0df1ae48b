//! Quota-aware cache warming for Ember.
//!
//! The engine is written against the ports in [`ember_core::ports`]; the
//! in-memory adapters in [`memory`] serve tests and single-process runs.

pub mod control;
pub mod fetcher;
pub mod memory;
pub mod quota;
pub mod strategies;
pub mod warmer;

#[cfg(test)]
mod testing;

pub use control::{ControlPlane, MaintenanceReport, SystemStats};
pub use fetcher::{ExplorerConfig, ExplorerEndpoint, HttpExplorerFetcher};
pub use memory::{MemoryCacheStore, MemoryUsageLog, MemoryWarmingQueue};
pub use quota::QuotaTracker;
pub use strategies::{CandidateSelector, DEFAULT_STRATEGIES, StrategyRegistry};
pub use warmer::IntelligentWarmer;
