//! Error types
//!
//! Two durable failure classes cross module boundaries: `Value` for caller
//! mistakes (bad timespan, unknown exchange, impossible merges) and
//! `Runtime` for exhausted retries, corrupt data, and violated invariants.
//! Transient exchange failures (rate limits, outages) stay inside the
//! exchange retry loop and never surface as `TaxGraphError`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaxGraphError>;

#[derive(Debug, Error)]
pub enum TaxGraphError {
    /// Invalid input or an impossible request (e.g. a fiat conversion
    /// between two non-USD currencies on the USD-anchored free tier).
    #[error("Value error: {0}")]
    Value(String),

    /// Retries exhausted, corrupt archive or cache, or a broken internal
    /// invariant (e.g. pricing a graph that was never optimized).
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The resolver was interrupted; caches have already been saved.
    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TaxGraphError {
    pub fn value(message: impl Into<String>) -> Self {
        TaxGraphError::Value(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        TaxGraphError::Runtime(message.into())
    }
}
