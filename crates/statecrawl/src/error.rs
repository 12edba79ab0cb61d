//! Error types for the statecrawl core

use thiserror::Error;

/// Result type alias for statecrawl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the scanner pipeline
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Configuration error (unknown distance type, missing reset endpoint, ...)
    ///
    /// Fatal: surfaces at initialization, never recovered from.
    #[error("configuration error: {0}")]
    Config(String),

    /// Document store error
    #[error("store error: {0}")]
    Store(String),

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record did not have the expected shape (stale id, missing field)
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A runtime invariant was violated (e.g. no state marked current)
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create an invalid-record error
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Create an invariant-violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}
