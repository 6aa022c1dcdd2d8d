//! Result types for sync passes and queue flushes.

use serde::Serialize;

use crate::model::QueueStatus;

/// Outcome of one push or pull pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Records written to the other replica (created, updated or merged).
    pub synced: usize,
    /// Records that needed no write.
    pub skipped: usize,
    /// Records that failed; they stay eligible for the next cycle.
    pub failed: usize,
    /// One line per failure.
    pub errors: Vec<String>,
    /// True when a connectivity failure stopped the pass early.
    pub aborted: bool,
}

impl PassReport {
    /// A pass advances its watermark only when nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.aborted
    }

    pub fn record_failure(&mut self, record: &str, error: &crate::error::Error) {
        self.failed += 1;
        self.errors.push(format!("{record}: {error}"));
    }

    pub fn record_abort(&mut self, error: &crate::error::Error) {
        self.aborted = true;
        self.errors.push(format!("aborted: {error}"));
    }
}

/// Watermarks after a cycle (Unix ms). `None` means the direction has
/// never completed cleanly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermarks {
    pub push: Option<i64>,
    pub pull: Option<i64>,
}

/// Outcome of a full sync cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub owner_id: String,
    pub push: PassReport,
    pub pull: PassReport,
    pub new_watermark: Watermarks,
}

/// Outcome of dispatching one queued operation on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub id: String,
    pub kind: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where the operation ended up: removed (`completed`), back in the
    /// queue (`pending`), or given up on (`failed`).
    pub status: QueueStatus,
}

/// Outcome of one batched request.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub successful: usize,
    pub failed: usize,
    /// Failed operations put back for another attempt
    pub requeued: usize,
    /// Failed operations past the retry limit
    pub dropped: usize,
}

/// How a queue flush was dispatched, and what came of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncOutcome {
    Individual { results: Vec<OperationResult> },
    Batched(BatchSummary),
}

impl SyncOutcome {
    #[must_use]
    pub fn successful(&self) -> usize {
        match self {
            Self::Individual { results } => results.iter().filter(|r| r.success).count(),
            Self::Batched(summary) => summary.successful,
        }
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        match self {
            Self::Individual { results } => results.iter().filter(|r| !r.success).count(),
            Self::Batched(summary) => summary.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_pass_report_clean() {
        let mut report = PassReport::default();
        assert!(report.is_clean());

        report.record_failure("prog_1", &Error::Remote("rejected".into()));
        assert!(!report.is_clean());
        assert_eq!(report.errors.len(), 1);

        let mut aborted = PassReport::default();
        aborted.record_abort(&Error::Connectivity("timeout".into()));
        assert!(!aborted.is_clean());
        assert_eq!(aborted.failed, 0);
    }

    #[test]
    fn test_outcome_counts() {
        let outcome = SyncOutcome::Individual {
            results: vec![
                OperationResult {
                    id: "a".into(),
                    kind: "record_review".into(),
                    success: true,
                    error: None,
                    status: QueueStatus::Completed,
                },
                OperationResult {
                    id: "b".into(),
                    kind: "record_review".into(),
                    success: false,
                    error: Some("boom".into()),
                    status: QueueStatus::Pending,
                },
            ],
        };
        assert_eq!(outcome.successful(), 1);
        assert_eq!(outcome.failed(), 1);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["mode"], "individual");
    }
}
