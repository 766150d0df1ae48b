//! Repository implementations for PostgreSQL.

mod cache;
mod queue;
mod usage;

pub use cache::PgCacheStore;
pub use queue::PgWarmingQueue;
pub use usage::PgUsageLog;
