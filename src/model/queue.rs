//! Queued remote write intents.

use serde::{Deserialize, Serialize};

use super::item::ItemKey;
use super::review::ReviewEvent;

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from string, treating unknown values as pending.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A remote write intent, tagged by kind on the wire:
/// `{"kind":"record_review","payload":{...}}`.
///
/// Progress records are never queued. A queued snapshot would overwrite
/// whatever the remote gained in the meantime; they go out through the
/// push pass instead, which merges first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    /// Mirror a review event; `item` locates the remote progress.
    RecordReview { item: ItemKey, event: ReviewEvent },
}

impl Operation {
    /// Kind string, stored alongside the payload for filtering.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RecordReview { .. } => "record_review",
        }
    }
}

/// A queued operation owned by one owner's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub owner_id: String,
    pub operation: Operation,
    /// Unix milliseconds
    pub queued_at: i64,
    pub retry_count: u32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn new(owner_id: &str, operation: Operation) -> Self {
        Self {
            id: format!("op_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            owner_id: owner_id.to_string(),
            operation,
            queued_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            status: QueueStatus::Pending,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_wire_shape() {
        let event = ReviewEvent::new("owner", "prog_1", true, true, Some(30));
        let op = Operation::RecordReview {
            item: ItemKey::new("John 3:16", "KJV"),
            event,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "record_review");
        assert_eq!(json["payload"]["item"]["canonical_reference"], "John 3:16");
        assert_eq!(op.kind(), "record_review");
    }

    #[test]
    fn test_retired_progress_kind_is_rejected() {
        let json = serde_json::json!({"kind": "upsert_progress", "payload": {}});
        assert!(serde_json::from_value::<Operation>(json).is_err());
    }

    #[test]
    fn test_queue_status_parse() {
        assert_eq!(QueueStatus::parse("failed"), QueueStatus::Failed);
        assert_eq!(QueueStatus::parse("bogus"), QueueStatus::Pending);
    }
}
