//! Skysync Core - Domain types and port definitions
//!
//! This crate contains the hexagonal core of the reconciliation engine:
//! - Domain entities (node snapshots, fingerprints, scheduling flags)
//! - Port definitions (traits the engine consumes: filesystem, cloud drive,
//!   state store)
//! - Configuration types
//!
//! No I/O happens here; adapters live in `skysync-engine` (local filesystem,
//! watcher) and `skysync-cache` (SQLite state store).

pub mod config;
pub mod domain;
pub mod ports;
