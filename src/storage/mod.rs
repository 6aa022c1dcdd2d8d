//! SQLite storage layer for Recall (the local replica).
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode for concurrent reads
//! - Transaction discipline for atomic multi-record writes
//! - Per-owner sync watermarks
//! - An audit trail for `recall history`
//!
//! # Submodules
//!
//! - [`events`] - Audit trail of local mutations
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main SQLite storage implementation

pub mod events;
pub mod migrations;
pub mod schema;
pub mod sqlite;

pub use events::{AuditEntry, Change, Entity};
pub use sqlite::{Direction, DueEntry, MutationContext, OwnerCounts, SqliteStorage};
