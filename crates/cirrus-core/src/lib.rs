//! Cirrus Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Item`, `ChangeEvent`, `SyncOperation`, `Conflict`
//! - **Port definitions** - Traits for adapters: `IRemoteGateway`,
//!   `ILocalFileSystem`, `IStateStore`
//! - **Error taxonomy** - `EngineError` classification for retry decisions
//! - **Configuration** - typed YAML configuration
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no external
//! dependencies. Ports define trait interfaces that adapter crates
//! implement.

pub mod config;
pub mod domain;
pub mod engine_error;
pub mod ports;
