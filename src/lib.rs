//! Recall - offline-first memorization tracker with replica sync
//!
//! This crate provides the core functionality for the `recall` CLI tool.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Data types (Item, Alias, Progress, ReviewEvent, QueuedOperation)
//! - [`storage`] - SQLite local replica
//! - [`scheduler`] - Due dates, slot assignment and phase transitions
//! - [`remote`] - Remote replica and passage lookup seams (HTTP and in-memory)
//! - [`sync`] - Sync engine, conflict resolution and the offline write queue
//! - [`session`] - Owner-scoped write path and sync entry points
//! - [`reference`] - Reference normalization
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod reference;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};
