//! Remote replica and passage lookup seams.
//!
//! The remote store is authoritative for item identity and, once synced,
//! for the progress row itself. Local and remote ids are never assumed to
//! match, so every remote call locates records by `(owner, ItemKey)`.
//!
//! Two implementations are provided:
//! - [`HttpRemote`] talks JSON over HTTP with a bounded timeout
//! - [`MemoryRemote`] keeps everything in process (offline use and tests)

pub mod http;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Item, ItemKey, Operation, Progress, ReviewEvent};

pub use http::HttpRemote;
pub use memory::MemoryRemote;

/// A progress row as the remote stores it.
///
/// `progress.id` and `progress.item_id` are remote ids; `item` is the
/// identity both replicas agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProgress {
    pub item: ItemKey,
    #[serde(flatten)]
    pub progress: Progress,
}

/// The remote replica.
pub trait RemoteStore: Send + Sync {
    /// Cheap reachability probe. Never errors: unreachable is `false`.
    fn is_available(&self) -> impl std::future::Future<Output = bool> + Send;

    /// Progress rows for `owner_id` updated strictly after `since` (Unix ms).
    fn pull_progress_since(
        &self,
        owner_id: &str,
        since: i64,
    ) -> impl std::future::Future<Output = Result<Vec<RemoteProgress>>> + Send;

    /// The owner's progress for an item: the active row if any, otherwise
    /// the most recently updated archived one.
    fn find_progress(
        &self,
        owner_id: &str,
        item: &ItemKey,
    ) -> impl std::future::Future<Output = Result<Option<RemoteProgress>>> + Send;

    /// Canonical item for a key.
    fn fetch_item(&self, item: &ItemKey) -> impl std::future::Future<Output = Result<Option<Item>>> + Send;

    /// Create or update the owner's progress for `item`, creating the item
    /// remotely if the remote has never seen it. Returns the stored row.
    fn upsert_progress(
        &self,
        owner_id: &str,
        item: &Item,
        progress: &Progress,
    ) -> impl std::future::Future<Output = Result<RemoteProgress>> + Send;

    /// Review events for the owner's progress on `item` created within
    /// `[from, to]` (Unix ms).
    fn review_events_between(
        &self,
        owner_id: &str,
        item: &ItemKey,
        from: i64,
        to: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ReviewEvent>>> + Send;

    /// Append a review event to the owner's progress on `item`.
    fn insert_review_event(
        &self,
        owner_id: &str,
        item: &ItemKey,
        event: &ReviewEvent,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Execute several operations in one request.
    fn execute_batch(&self, request: &BatchRequest) -> impl std::future::Future<Output = Result<BatchResponse>> + Send;
}

/// External passage lookup/creation collaborator.
///
/// Errors are classified: `Error::Validation` (not a real passage),
/// `Error::Duplicate` (owner already has active progress remotely) and
/// `Error::Connectivity` (retryable). Never called inside a local
/// transaction.
pub trait PassageLookup: Send + Sync {
    fn lookup(&self, request: &LookupRequest) -> impl std::future::Future<Output = Result<LookupResponse>> + Send;
}

/// What the collaborator is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupOperation {
    /// Resolve the reference to canonical text only
    Lookup,
    /// Resolve and create server-side progress for the owner
    Create,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub operation: LookupOperation,
    pub owner_id: String,
    pub reference: String,
    pub normalized_reference: String,
    pub translation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    #[serde(default)]
    pub item: Option<Item>,
    #[serde(default)]
    pub existing_progress: Option<Progress>,
}

// ====================
// Batch wire format
// ====================

/// One operation inside a batch: `{id, kind, payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: String,
    #[serde(flatten)]
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: String,
    pub owner_id: String,
    pub operations: Vec<BatchOperation>,
}

/// Result for one operation, correlated to the request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<BatchResult>,
    pub summary: BatchCounts,
}

impl BatchResponse {
    /// Result for an operation id, if the remote reported one.
    #[must_use]
    pub fn result_for(&self, id: &str) -> Option<&BatchResult> {
        self.results.iter().find(|r| r.id == id)
    }
}
