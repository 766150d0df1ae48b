//! Test context wiring the PostgreSQL adapters to a fresh container.

use crate::containers::PostgresContainer;
use crate::helpers::StubFetcher;
use ember_core::config::EngineConfig;
use ember_db::{Database, PgCacheStore, PgUsageLog, PgWarmingQueue, PoolSettings};
use ember_engine::{ControlPlane, QuotaTracker};
use std::sync::Arc;

/// A migrated database in its own container.
///
/// Drop this to stop the container.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub db: Database,
    pub config: EngineConfig,
}

impl TestContext {
    /// Start PostgreSQL and apply migrations with the default engine config.
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let settings = PoolSettings {
            max_connections: 16,
            ..PoolSettings::default()
        };
        let db = Database::connect_with(postgres.connection_string(), settings).await?;
        db.migrate().await?;

        Ok(Self {
            postgres,
            db,
            config,
        })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }

    pub fn cache(&self) -> Arc<PgCacheStore> {
        Arc::new(PgCacheStore::new(self.db.pool().clone()).with_policy(self.config.cache.clone()))
    }

    pub fn queue(&self) -> Arc<PgWarmingQueue> {
        Arc::new(PgWarmingQueue::new(self.db.pool().clone()).with_policy(self.config.queue.clone()))
    }

    pub fn usage(&self) -> Arc<PgUsageLog> {
        Arc::new(PgUsageLog::new(self.db.pool().clone()))
    }

    pub fn quota(&self) -> QuotaTracker {
        QuotaTracker::new(self.usage(), self.config.quota.clone())
    }

    /// A control plane over this database that fetches through `fetcher`.
    pub fn control(&self, fetcher: Arc<StubFetcher>) -> ControlPlane {
        ControlPlane::new(
            self.cache(),
            self.queue(),
            self.usage(),
            fetcher,
            self.config.clone(),
        )
    }
}
