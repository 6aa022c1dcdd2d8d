//! Data models for Recall.
//!
//! This module contains all domain models:
//! - Item / Alias
//! - Progress (Phase, Assignment, ProgressPatch)
//! - ReviewEvent
//! - QueuedOperation

pub mod item;
pub mod progress;
pub mod queue;
pub mod review;

pub use item::{Alias, Item, ItemKey};
pub use progress::{Assignment, Phase, Progress, ProgressPatch};
pub use queue::{Operation, QueueStatus, QueuedOperation};
pub use review::ReviewEvent;
