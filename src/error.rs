//! Error types for Recall.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, etc.)
//! - Retryability flags so callers know which failures are worth repeating
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

use crate::model::Progress;

/// Result type alias for Recall operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    DatabaseError,

    // Not Found (exit 3)
    NotFound,
    NoOwner,

    // Validation (exit 4)
    ValidationError,
    InvalidArgument,
    ManualTextRequired,

    // Duplicate (exit 5)
    DuplicateError,

    // Sync (exit 6)
    ConnectivityError,
    ConflictError,
    RemoteError,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::NoOwner => "NO_OWNER",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::ManualTextRequired => "MANUAL_TEXT_REQUIRED",
            Self::DuplicateError => "DUPLICATE_ERROR",
            Self::ConnectivityError => "CONNECTIVITY_ERROR",
            Self::ConflictError => "CONFLICT_ERROR",
            Self::RemoteError => "REMOTE_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::DatabaseError => 2,
            Self::NotFound | Self::NoOwner => 3,
            Self::ValidationError | Self::InvalidArgument | Self::ManualTextRequired => 4,
            Self::DuplicateError => 5,
            Self::ConnectivityError | Self::ConflictError | Self::RemoteError => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether repeating the same call later may succeed.
    ///
    /// Only transient transport failures qualify. Validation and duplicate
    /// outcomes are answers, not failures, and repeating them changes nothing.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectivityError | Self::DatabaseError)
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in Recall operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `recall init` first")]
    NotInitialized,

    #[error("No owner configured")]
    NoOwner,

    #[error("Not found: {what}")]
    NotFound { what: String },

    /// The reference does not resolve to a real passage.
    #[error("Invalid reference '{reference}': {message}")]
    Validation { reference: String, message: String },

    /// An active progress record already exists for this owner and item.
    ///
    /// When `on_remote` is set the record came from the lookup service and
    /// its ids are remote ids; nothing was written locally.
    #[error("Already memorizing this item (phase {}, due {})", existing.phase, existing.next_due_date)]
    Duplicate { existing: Box<Progress>, on_remote: bool },

    /// The remote could not be reached or timed out.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The merge rules failed to produce a resolution for one record.
    #[error("Unresolved conflict for {record}: {message}")]
    Conflict { record: String, message: String },

    /// The reference is unknown locally and cannot be looked up right now.
    #[error("'{reference}' is not known locally and lookup is unavailable; supply the passage text")]
    ManualTextRequired { reference: String },

    /// The remote answered with an unexpected failure.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database already exists at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized | Self::AlreadyInitialized { .. } => ErrorCode::NotInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::NoOwner => ErrorCode::NoOwner,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::ManualTextRequired { .. } => ErrorCode::ManualTextRequired,
            Self::Duplicate { .. } => ErrorCode::DuplicateError,
            Self::Connectivity(_) => ErrorCode::ConnectivityError,
            Self::Conflict { .. } => ErrorCode::ConflictError,
            Self::Remote(_) => ErrorCode::RemoteError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// True for transport failures that should trigger the offline path.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => Some("Run `recall init` to create the local database".to_string()),

            Self::AlreadyInitialized { path } => Some(format!(
                "{} is already set up. `recall init --force` keeps its data and rewrites the settings.",
                path.display()
            )),

            Self::NoOwner => Some(
                "Pass --owner <id>, set RECALL_OWNER, or add \"owner_id\" to ~/.recall/config.json"
                    .to_string(),
            ),

            Self::Duplicate { on_remote: true, .. } => Some(
                "Another device already tracks this passage. Run `recall sync` to bring it here".to_string(),
            ),
            Self::Duplicate { existing, .. } => Some(format!(
                "Record a review with `recall review` instead. Progress id: {}",
                existing.id
            )),

            Self::ManualTextRequired { reference } => Some(format!(
                "recall add \"{reference}\" --text \"<passage text>\""
            )),

            Self::Connectivity(_) => Some(
                "Changes are kept locally and will be synced on the next `recall sync`".to_string(),
            ),

            Self::Validation { .. } => {
                Some("Check the book name, chapter and verse (e.g. \"John 3:16\")".to_string())
            }

            Self::NotFound { .. } => Some("Use `recall list` to see tracked items".to_string()),

            Self::Conflict { .. }
            | Self::Remote(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        if let Self::Duplicate { existing, on_remote } = self {
            obj["error"]["existing"] = serde_json::to_value(existing.as_ref()).unwrap_or_default();
            obj["error"]["on_remote"] = serde_json::Value::Bool(*on_remote);
        }

        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_is_retryable() {
        let err = Error::Connectivity("timeout".into());
        assert!(err.error_code().is_retryable());
        assert!(err.is_connectivity());
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_validation_and_duplicate_not_retryable() {
        let validation = Error::Validation {
            reference: "Hezekiah 1:1".into(),
            message: "unknown book".into(),
        };
        assert!(!validation.error_code().is_retryable());

        let existing = Progress::new("owner", "item", chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        let duplicate = Error::Duplicate {
            existing: Box::new(existing),
            on_remote: false,
        };
        assert!(!duplicate.error_code().is_retryable());
        assert_eq!(duplicate.exit_code(), 5);
    }

    #[test]
    fn test_duplicate_json_carries_existing_record() {
        let existing = Progress::new("owner", "item_1", chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        let id = existing.id.clone();
        let json = Error::Duplicate {
            existing: Box::new(existing),
            on_remote: true,
        }
        .to_structured_json();
        assert_eq!(json["error"]["code"], "DUPLICATE_ERROR");
        assert_eq!(json["error"]["existing"]["id"], id);
        assert_eq!(json["error"]["on_remote"], true);
        assert!(json["error"]["hint"].as_str().unwrap().contains("recall sync"));
    }
}
