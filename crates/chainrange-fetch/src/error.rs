//! Error types for cache stores, lock services and the fetch guard.

use thiserror::Error;

/// Classifies a fetch error for the retry loop.
///
/// Errors that can never succeed on retry (e.g. an endpoint missing the
/// requested historical state) return `false` and end the loop at once.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Errors raised by a [`CacheStore`](crate::cache::CacheStore).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Errors raised by a [`LockService`](crate::lock::LockService).
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited_ms}ms waiting for lock '{resource_id}'")]
    Timeout { resource_id: String, waited_ms: u64 },

    #[error("Lock '{resource_id}' is not held by this token")]
    NotHeld { resource_id: String },

    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Returns `true` if waiting again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Backend(_))
    }
}

/// Errors returned by [`FetchGuard::fetch`](crate::guard::FetchGuard::fetch)
/// when no value, fresh or stale, can be served.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// Every attempt failed.
    #[error("Fetch of '{resource_id}' failed after {attempts} attempts: {source}")]
    Exhausted {
        resource_id: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The fetch failed with an error retrying cannot fix.
    #[error("Fetch of '{resource_id}' failed permanently: {source}")]
    NonRetryable {
        resource_id: String,
        #[source]
        source: E,
    },

    /// The lock could never be acquired.
    #[error("Could not lock '{resource_id}' after {attempts} attempts: {source}")]
    Lock {
        resource_id: String,
        attempts: u32,
        #[source]
        source: LockError,
    },
}

impl<E> GuardError<E> {
    /// The underlying fetch error, if the failure came from the fetch itself.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
            Self::Lock { .. } => None,
        }
    }
}
