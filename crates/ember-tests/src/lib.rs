//! Integration test infrastructure for Ember.
//!
//! This crate provides a testcontainers-backed PostgreSQL for running the
//! storage adapters and the warming engine against a real database.
//!
//! # Usage
//!
//! ```ignore
//! use ember_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await.unwrap();
//!     let queue = ctx.queue();
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,ember_engine=debug,ember_db=debug")),
        )
        .with_test_writer()
        .try_init();
}
