//! Engine-level failure taxonomy
//!
//! Adapters surface failures as [`EngineError`] values wrapped in
//! `anyhow::Error` at the port boundary. The transfer queue and collector
//! classify errors through [`classify`] / [`is_transient`] to decide
//! between retrying, backing off, and giving up.

use std::time::Duration;

use thiserror::Error;

use crate::domain::newtypes::{Fingerprint, MirrorPath};

/// Failure kinds the engine reacts to
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Network or disk hiccup; retry with backoff
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Provider throttled the request; retry after the given delay
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The item cannot be read or written on one side; terminal
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Remote storage is full; retried after a cooldown
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Two items map to the same local path
    #[error("name collision at {0}")]
    NameCollision(MirrorPath),

    /// The change cursor is no longer valid; full re-enumeration needed
    #[error("change cursor is stale")]
    StaleCursor,

    /// Transferred content did not match the expected fingerprint
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },
}

impl EngineError {
    /// Whether the failure is worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::RateLimited { .. } | Self::QuotaExceeded(_)
        )
    }

    /// Provider-suggested delay before the next attempt, if any
    #[must_use]
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Extract the typed engine error from a port-boundary `anyhow::Error`
#[must_use]
pub fn classify(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>()
}

/// Whether a port-boundary error is worth retrying
///
/// Typed [`EngineError`]s answer directly; untyped adapter errors fall back
/// to message heuristics for the common I/O failure shapes.
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(engine_err) = classify(err) {
        return engine_err.is_transient();
    }

    let message = err.to_string().to_lowercase();
    const TRANSIENT_MARKERS: &[&str] = &[
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
        "interrupted",
        "broken pipe",
    ];
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}
