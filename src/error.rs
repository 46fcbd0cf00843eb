//! Error taxonomy for the Client Facade, and the crate-level result alias.
//!
//! `FacadeError` classifies exactly the six kinds the Manager's retry policy
//! needs to distinguish (spec §7). Everything the Manager surfaces to its
//! own caller (unrecoverable errors, `join`/`leave` failures) flows through
//! the crate's `Result<T> = eyre::Result<T>` alias instead, following the
//! teacher's split: typed errors at the client boundary, an opaque,
//! richly-contexted report at the public API boundary.

/// The crate-wide fallible return type for public, application-facing APIs.
pub type Result<T> = eyre::Result<T>;

/// Errors the [`crate::facade::ClientFacade`] can return from any of its calls.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// The homeserver rejected the request with `M_LIMIT_EXCEEDED`.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The requested delay exceeds what this homeserver allows for delayed events.
    #[error("requested delay exceeds server maximum of {max_allowed_ms}ms")]
    MaxDelayExceeded { max_allowed_ms: u64 },

    /// The referenced `delay_id` has already expired, been consumed, or never existed.
    #[error("delay_id not found")]
    NotFound,

    /// This homeserver does not implement delayed events at all.
    #[error("homeserver does not support delayed events")]
    UnsupportedDelayedEvents,

    /// Abort, connection reset, 5xx, or a recognised delayed-event-update timeout.
    #[error("transient network error: {0}")]
    NetworkTransient(String),

    /// Anything else. Unrecoverable; the Scheduler loop terminates.
    #[error("fatal client error")]
    Fatal(#[source] eyre::Report),
}

impl FacadeError {
    /// True for the error kinds the Manager retries within a bounded budget
    /// ([`FacadeError::RateLimited`], [`FacadeError::NetworkTransient`]).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FacadeError::RateLimited { .. } | FacadeError::NetworkTransient(_)
        )
    }
}
