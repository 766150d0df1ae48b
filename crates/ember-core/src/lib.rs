//! Ember Core
//!
//! Domain types, scoring, configuration and port traits for the Ember cache
//! warming engine. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ids;
pub mod ports;
pub mod quality;
pub mod queue;
pub mod quota;
pub mod warming;

pub use error::{Error, FetchErrorKind, Result};
pub use ids::*;
