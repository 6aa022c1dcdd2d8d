//! Review event model. Append-only.

use serde::{Deserialize, Serialize};

/// One recorded review attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub id: String,
    pub owner_id: String,
    pub progress_id: String,
    pub succeeded: bool,
    /// Whether the review was eligible to advance phase progress.
    /// Decided once when the event is created and never recomputed.
    pub counted: bool,
    pub duration_s: Option<u32>,
    /// Unix milliseconds
    pub created_at: i64,
}

impl ReviewEvent {
    pub fn new(owner_id: &str, progress_id: &str, succeeded: bool, counted: bool, duration_s: Option<u32>) -> Self {
        Self {
            id: format!("rev_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            owner_id: owner_id.to_string(),
            progress_id: progress_id.to_string(),
            succeeded,
            counted,
            duration_s,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
