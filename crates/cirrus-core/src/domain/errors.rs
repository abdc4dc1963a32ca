//! Domain error types
//!
//! Validation and invariant errors raised by the domain layer itself.
//! Errors that cross the engine's port boundaries live in
//! [`crate::engine_error`].

use thiserror::Error;

/// Errors produced by domain entity construction and state transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// An identifier failed validation
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A mirror path failed validation
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A remote item identifier failed validation
    #[error("invalid remote id: {0}")]
    InvalidRemoteId(String),

    /// A content fingerprint failed validation
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// A change cursor failed validation
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// An item state transition is not allowed
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// An entity invariant was violated
    #[error("validation failed: {0}")]
    ValidationFailed(String),
}
