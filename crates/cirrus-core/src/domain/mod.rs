//! Domain entities and business logic
//!
//! Core domain types for Cirrus:
//! - Newtypes for type-safe identifiers and validated domain values
//! - The tracked item entity and its state machine
//! - Change events from both sides of the mirror
//! - Durable transfer queue operations
//! - Conflict records and resolution choices
//! - Domain-specific error types

pub mod change;
pub mod conflict;
pub mod errors;
pub mod item;
pub mod newtypes;
pub mod operation;

// Re-export commonly used types
pub use change::{ChangeEvent, ChangeKind, Origin};
pub use conflict::{
    conflict_copy_path, conflict_copy_tag, Conflict, ConflictReason, Resolution, VersionInfo,
};
pub use errors::DomainError;
pub use item::{Item, ItemKey, SyncState};
pub use newtypes::*;
pub use operation::{OperationKind, OperationState, SyncOperation};
