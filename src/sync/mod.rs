//! Replica synchronization.
//!
//! Keeps an owner's local store and the remote store convergent:
//!
//! - **Engine**: incremental push and pull passes driven by per-direction
//!   watermarks ([`SyncEngine`])
//! - **Conflicts**: field-level merge of diverged records ([`resolve`])
//! - **Queue**: durable offline write queue with adaptive batching
//!   ([`BatchQueue`])
//! - **Observer**: conflict and pass notifications ([`SyncObserver`])
//!
//! # Architecture
//!
//! Records are matched across replicas by `(owner, ItemKey)`; ids are
//! replica-local. Only review events are queued. Progress always goes
//! through the merge path, inline after a write or in the next push pass,
//! so a stale local snapshot never overwrites the remote row. Queued
//! reviews and the push pass share one time-window match, so an event
//! delivered by either is not delivered again by the other.
//!
//! # Example
//!
//! ```ignore
//! use recall::sync::{SyncConfig, SyncEngine, TracingObserver};
//!
//! let mut engine = SyncEngine::new(&mut storage, &remote, &TracingObserver, SyncConfig::default());
//! let report = engine.run_cycle("owner_1").await?;
//! println!("pushed {} pulled {}", report.push.synced, report.pull.synced);
//! ```

mod conflict;
mod engine;
mod hash;
mod observer;
mod queue;
mod types;

pub use conflict::{resolve, MergePolicy, Resolution, DEFAULT_GRACE_WINDOW_MS};
pub use engine::{SyncConfig, SyncEngine, DEFAULT_DEDUP_WINDOW_MS};
pub use hash::batch_id;
pub use observer::{SyncObserver, TracingObserver};
pub use queue::{Adaptive, BatchQueue, DispatchPolicy, IndividualOnly, QueueSettings, QueueSnapshot};
pub use types::{BatchSummary, OperationResult, PassReport, SyncOutcome, SyncReport, Watermarks};

#[cfg(test)]
pub(crate) use observer::testing;
