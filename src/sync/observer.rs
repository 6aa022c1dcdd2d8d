//! Observability hook for the sync core.
//!
//! The engine and queue report conflict resolutions and pass completions
//! through [`SyncObserver`] rather than logging directly, so embedders can
//! route them anywhere. [`TracingObserver`] is the default sink.

use tracing::{info, warn};

use crate::model::ItemKey;
use crate::storage::Direction;

use super::types::{PassReport, SyncOutcome};

/// Receives sync notifications. All methods default to doing nothing.
pub trait SyncObserver: Send + Sync {
    /// A local and a remote record diverged and were merged.
    fn on_conflict(&self, _owner_id: &str, _item: &ItemKey, _conflicts: &[String]) {}

    /// A push or pull pass finished (cleanly or not).
    fn on_pass_complete(&self, _owner_id: &str, _direction: Direction, _report: &PassReport) {}

    /// A queue flush dispatched operations.
    fn on_flush(&self, _owner_id: &str, _outcome: &SyncOutcome) {}
}

/// Logs every notification with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_conflict(&self, owner_id: &str, item: &ItemKey, conflicts: &[String]) {
        for conflict in conflicts {
            info!(owner = owner_id, item = %item, conflict = conflict.as_str(), "Resolved sync conflict");
        }
    }

    fn on_pass_complete(&self, owner_id: &str, direction: Direction, report: &PassReport) {
        if report.is_clean() {
            info!(
                owner = owner_id,
                direction = direction.as_str(),
                synced = report.synced,
                skipped = report.skipped,
                "Sync pass complete"
            );
        } else {
            warn!(
                owner = owner_id,
                direction = direction.as_str(),
                synced = report.synced,
                failed = report.failed,
                aborted = report.aborted,
                "Sync pass incomplete"
            );
        }
    }

    fn on_flush(&self, owner_id: &str, outcome: &SyncOutcome) {
        let mode = match outcome {
            SyncOutcome::Individual { .. } => "individual",
            SyncOutcome::Batched(_) => "batched",
        };
        info!(
            owner = owner_id,
            mode,
            successful = outcome.successful(),
            failed = outcome.failed(),
            "Queue flushed"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Observer that keeps every notification for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        pub conflicts: Mutex<Vec<String>>,
        pub passes: Mutex<Vec<(Direction, PassReport)>>,
        pub flushes: Mutex<Vec<SyncOutcome>>,
    }

    impl SyncObserver for RecordingObserver {
        fn on_conflict(&self, _owner_id: &str, _item: &ItemKey, conflicts: &[String]) {
            self.conflicts.lock().unwrap().extend(conflicts.iter().cloned());
        }

        fn on_pass_complete(&self, _owner_id: &str, direction: Direction, report: &PassReport) {
            self.passes.lock().unwrap().push((direction, report.clone()));
        }

        fn on_flush(&self, _owner_id: &str, outcome: &SyncOutcome) {
            self.flushes.lock().unwrap().push(outcome.clone());
        }
    }
}
