//! Error types for Ember.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failed call to an explorer API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Network errors, 5xx responses, provider rate limiting.
    Transient,
    /// The call exceeded the per-call timeout.
    Timeout,
    /// The request can never succeed (unverified contract, bad address).
    Permanent,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Transient => "transient",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Permanent => "permanent",
        }
    }

    /// Whether a failure of this kind may be retried through the queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchErrorKind::Permanent)
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Cache errors
    #[error("Cache entry not found: {0}")]
    CacheEntryNotFound(String),

    #[error("Invalid cache type: {0}")]
    InvalidCacheType(String),

    // Queue errors
    #[error("Queue item not found: {0}")]
    QueueItemNotFound(String),

    #[error("Invalid queue transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    // Warming errors
    #[error("Unknown warming strategy: {0}")]
    UnknownStrategy(String),

    #[error("Fetch failed ({kind}): {message}")]
    Fetch {
        kind: FetchErrorKind,
        message: String,
    },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Fetch {
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Error::Fetch {
            kind: FetchErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Fetch {
            kind: FetchErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// The fetch classification of this error, if it came from a fetch.
    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            Error::Fetch { kind, .. } => Some(*kind),
            Error::Network(_) => Some(FetchErrorKind::Transient),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
