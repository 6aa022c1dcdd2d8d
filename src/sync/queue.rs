//! Owner-scoped queue of review events waiting for the remote.
//!
//! Reviews that could not be mirrored inline wait here and are flushed
//! either as one batch request or one by one. Queue rows live in the
//! `queued_operations` table, but only this type reads or changes them;
//! the storage methods it uses are crate-private.
//!
//! A flush claims its rows (status `processing`) in one transaction, then
//! talks to the remote with no transaction open. Rows left in `processing`
//! by a crashed flush go back to `pending` when the queue is opened again.
//!
//! A timeout can hide a write the remote did apply, so before sending, a
//! flush asks the remote for events near each claimed one and drops the
//! operations it already has (same time-window match as the push pass).

use std::collections::HashMap;
use std::marker::PhantomData;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{ItemKey, Operation, QueueStatus, QueuedOperation, ReviewEvent};
use crate::remote::{BatchOperation, BatchRequest, RemoteStore};
use crate::storage::SqliteStorage;

use super::engine::{match_review_events, DEFAULT_DEDUP_WINDOW_MS};
use super::hash::batch_id;
use super::observer::SyncObserver;
use super::types::{BatchSummary, OperationResult, SyncOutcome};

/// Upper bound on operations claimed by one flush.
const MAX_OPERATIONS_PER_FLUSH: usize = 100;

/// Queue thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Flush (and prefer a batch) once this many operations are pending.
    pub size_threshold: usize,
    /// Flush once the oldest pending operation is this old (ms).
    pub age_threshold_ms: i64,
    /// Failed attempts allowed before an operation is given up on.
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            size_threshold: 5,
            age_threshold_ms: 30_000,
            max_retries: 3,
        }
    }
}

/// How a flush dispatches the operations it claimed. Chosen at compile
/// time as the queue's type parameter.
pub trait DispatchPolicy {
    /// Name used in logs.
    const NAME: &'static str;

    /// Whether to send the claimed operations as one batch.
    fn use_batch(queue_depth: usize, has_retries: bool, settings: &QueueSettings) -> bool;
}

/// Batch when the queue is deep enough or a retry is pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct Adaptive;

impl DispatchPolicy for Adaptive {
    const NAME: &'static str = "adaptive";

    fn use_batch(queue_depth: usize, has_retries: bool, settings: &QueueSettings) -> bool {
        queue_depth >= settings.size_threshold || has_retries
    }
}

/// Never batch; for remotes without a batch endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndividualOnly;

impl DispatchPolicy for IndividualOnly {
    const NAME: &'static str = "individual";

    fn use_batch(_queue_depth: usize, _has_retries: bool, _settings: &QueueSettings) -> bool {
        false
    }
}

/// Snapshot of the queue for status output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub oldest_pending_at: Option<i64>,
    pub operations: Vec<QueuedOperation>,
}

/// One owner's queue.
#[derive(Debug)]
pub struct BatchQueue<P: DispatchPolicy = Adaptive> {
    owner_id: String,
    settings: QueueSettings,
    dedup_window_ms: i64,
    _policy: PhantomData<fn() -> P>,
}

/// Claimed operations, split by what the remote already has.
#[derive(Debug, Default)]
struct Reconciled {
    send: Vec<QueuedOperation>,
    delivered: Vec<QueuedOperation>,
    /// The remote could not be asked; (operation, error)
    unchecked: Vec<(QueuedOperation, String)>,
}

impl<P: DispatchPolicy> BatchQueue<P> {
    /// Open the queue for `owner_id`, returning rows a crashed flush left
    /// in `processing` to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the recovery update fails.
    pub fn open(storage: &mut SqliteStorage, owner_id: &str, settings: QueueSettings) -> Result<Self> {
        let recovered = storage.queue_reset_processing(owner_id)?;
        if recovered > 0 {
            warn!(owner = owner_id, recovered, "Recovered operations from an interrupted flush");
        }
        Ok(Self {
            owner_id: owner_id.to_string(),
            settings,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            _policy: PhantomData,
        })
    }

    /// Treat a remote event this close (ms) to a queued one, with the same
    /// outcome, as that operation already delivered.
    #[must_use]
    pub fn with_dedup_window(mut self, window_ms: i64) -> Self {
        self.dedup_window_ms = window_ms;
        self
    }

    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Whether a flush of `queue_depth` operations should go out as one batch.
    #[must_use]
    pub fn should_batch(&self, queue_depth: usize, has_retries: bool) -> bool {
        P::use_batch(queue_depth, has_retries, &self.settings)
    }

    /// Add an operation to the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn enqueue(&self, storage: &mut SqliteStorage, operation: Operation) -> Result<QueuedOperation> {
        let op = QueuedOperation::new(&self.owner_id, operation);
        storage.queue_insert(&op)?;
        debug!(owner = %self.owner_id, id = %op.id, kind = op.operation.kind(), "Queued operation");
        Ok(op)
    }

    /// Current queue contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn snapshot(&self, storage: &SqliteStorage) -> Result<QueueSnapshot> {
        let operations = storage.queue_list(&self.owner_id)?;
        let mut snapshot = QueueSnapshot::default();
        for op in &operations {
            match op.status {
                QueueStatus::Pending => {
                    snapshot.pending += 1;
                    snapshot.oldest_pending_at = Some(
                        snapshot
                            .oldest_pending_at
                            .map_or(op.queued_at, |oldest| oldest.min(op.queued_at)),
                    );
                }
                QueueStatus::Processing => snapshot.processing += 1,
                QueueStatus::Failed => snapshot.failed += 1,
                QueueStatus::Completed => {}
            }
        }
        snapshot.operations = operations;
        Ok(snapshot)
    }

    /// Remove operations that permanently failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear_failed(&self, storage: &mut SqliteStorage) -> Result<usize> {
        storage.queue_clear_failed(&self.owner_id)
    }

    /// Drop pending operations whose effect a clean push pass already
    /// delivered (everything queued at or before `through`).
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn acknowledge_pushed(&self, storage: &mut SqliteStorage, through: i64) -> Result<usize> {
        let n = storage.queue_delete_pending_through(&self.owner_id, through)?;
        if n > 0 {
            debug!(owner = %self.owner_id, n, "Dropped operations covered by push");
        }
        Ok(n)
    }

    /// Flush pending operations.
    ///
    /// Without `force`, nothing happens until the pending count reaches the
    /// size threshold or the oldest pending operation reaches the age
    /// threshold. Returns `None` when nothing was dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error only for local storage failures; remote failures
    /// are reported in the outcome and the operations stay queued.
    pub async fn flush<R: RemoteStore, O: SyncObserver>(
        &self,
        storage: &mut SqliteStorage,
        remote: &R,
        observer: &O,
        force: bool,
    ) -> Result<Option<SyncOutcome>> {
        let snapshot = self.snapshot(storage)?;
        let Some(oldest) = snapshot.oldest_pending_at else {
            return Ok(None);
        };

        let age = Utc::now().timestamp_millis() - oldest;
        let due = force
            || snapshot.pending >= self.settings.size_threshold
            || age >= self.settings.age_threshold_ms;
        if !due {
            debug!(owner = %self.owner_id, pending = snapshot.pending, age, "Queue below flush thresholds");
            return Ok(None);
        }

        let has_retries = snapshot
            .operations
            .iter()
            .any(|op| op.status == QueueStatus::Pending && op.retry_count > 0);
        let batched = self.should_batch(snapshot.pending, has_retries);

        let claimed = storage.queue_claim_pending(&self.owner_id, MAX_OPERATIONS_PER_FLUSH)?;
        if claimed.is_empty() {
            return Ok(None);
        }

        info!(
            owner = %self.owner_id,
            policy = P::NAME,
            operations = claimed.len(),
            batched,
            "Flushing queue"
        );

        let outcome = match self.reconcile(remote, &claimed).await {
            Ok(reconciled) => self.dispatch(storage, remote, reconciled, batched).await?,
            Err(e) => {
                warn!(owner = %self.owner_id, error = %e, "Remote unreachable, operations stay queued");
                storage.queue_reset_processing(&self.owner_id)?;
                undelivered(&claimed, &e.to_string(), batched)
            }
        };

        observer.on_flush(&self.owner_id, &outcome);
        Ok(Some(outcome))
    }

    /// Ask the remote which claimed reviews it already holds.
    ///
    /// Operations are grouped by item so each group costs one window query.
    /// Only connectivity errors are returned; any other failure marks its
    /// group unchecked.
    async fn reconcile<R: RemoteStore>(&self, remote: &R, claimed: &[QueuedOperation]) -> Result<Reconciled> {
        let mut groups: Vec<(&ItemKey, Vec<(&str, &ReviewEvent)>)> = Vec::new();
        for op in claimed {
            let Operation::RecordReview { item, event } = &op.operation;
            match groups.iter_mut().find(|(key, _)| *key == item) {
                Some((_, members)) => members.push((op.id.as_str(), event)),
                None => groups.push((item, vec![(op.id.as_str(), event)])),
            }
        }

        let window = self.dedup_window_ms;
        let mut delivered: Vec<&str> = Vec::new();
        let mut unchecked: HashMap<&str, String> = HashMap::new();
        for (key, mut members) in groups {
            members.sort_by_key(|(_, event)| event.created_at);
            let (Some((_, first)), Some((_, last))) = (members.first(), members.last()) else {
                continue;
            };
            let (from, to) = (first.created_at - window, last.created_at + window);

            let remote_events = match remote.review_events_between(&self.owner_id, key, from, to).await {
                Ok(events) => events,
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    let error = e.to_string();
                    unchecked.extend(members.iter().map(|(id, _)| (*id, error.clone())));
                    continue;
                }
            };

            let local: Vec<ReviewEvent> = members.iter().map(|(_, event)| (*event).clone()).collect();
            let matched = match_review_events(&local, &remote_events, window);
            for ((id, _), already) in members.iter().zip(matched) {
                if already {
                    debug!(owner = %self.owner_id, id = *id, "Queued review already on remote");
                    delivered.push(*id);
                }
            }
        }

        let mut reconciled = Reconciled::default();
        for op in claimed {
            if delivered.contains(&op.id.as_str()) {
                reconciled.delivered.push(op.clone());
            } else if let Some(error) = unchecked.remove(op.id.as_str()) {
                reconciled.unchecked.push((op.clone(), error));
            } else {
                reconciled.send.push(op.clone());
            }
        }
        Ok(reconciled)
    }

    async fn dispatch<R: RemoteStore>(
        &self,
        storage: &mut SqliteStorage,
        remote: &R,
        reconciled: Reconciled,
        batched: bool,
    ) -> Result<SyncOutcome> {
        let Reconciled {
            send,
            delivered,
            unchecked,
        } = reconciled;
        let delivered_ids: Vec<String> = delivered.iter().map(|op| op.id.clone()).collect();
        storage.queue_delete(&delivered_ids)?;

        if batched {
            let mut summary = self.dispatch_batch(storage, remote, &send).await?;
            summary.successful += delivered.len();
            for (op, error) in &unchecked {
                summary.failed += 1;
                match self.release(storage, op, error)? {
                    QueueStatus::Failed => summary.dropped += 1,
                    _ => summary.requeued += 1,
                }
            }
            return Ok(SyncOutcome::Batched(summary));
        }

        let mut results: Vec<OperationResult> = delivered
            .iter()
            .map(|op| result(op, true, None, QueueStatus::Completed))
            .collect();
        for (op, error) in &unchecked {
            let status = self.release(storage, op, error)?;
            results.push(result(op, false, Some(error.clone()), status));
        }
        results.extend(self.dispatch_individually(storage, remote, &send).await?);
        Ok(SyncOutcome::Individual { results })
    }

    async fn dispatch_batch<R: RemoteStore>(
        &self,
        storage: &mut SqliteStorage,
        remote: &R,
        claimed: &[QueuedOperation],
    ) -> Result<BatchSummary> {
        let ids: Vec<&str> = claimed.iter().map(|op| op.id.as_str()).collect();
        let request = BatchRequest {
            batch_id: batch_id(&ids),
            owner_id: self.owner_id.clone(),
            operations: claimed
                .iter()
                .map(|op| BatchOperation {
                    id: op.id.clone(),
                    operation: op.operation.clone(),
                })
                .collect(),
        };

        let mut summary = BatchSummary {
            batch_id: request.batch_id.clone(),
            ..Default::default()
        };
        if request.operations.is_empty() {
            return Ok(summary);
        }

        match remote.execute_batch(&request).await {
            Ok(response) => {
                let mut completed = Vec::new();
                for op in claimed {
                    match response.result_for(&op.id) {
                        Some(result) if result.success => {
                            completed.push(op.id.clone());
                            summary.successful += 1;
                        }
                        other => {
                            let error = other
                                .and_then(|r| r.error.clone())
                                .unwrap_or_else(|| "no result returned for operation".to_string());
                            summary.failed += 1;
                            match self.release(storage, op, &error)? {
                                QueueStatus::Failed => summary.dropped += 1,
                                _ => summary.requeued += 1,
                            }
                        }
                    }
                }
                storage.queue_delete(&completed)?;
            }
            Err(e) if e.is_connectivity() => {
                // Never reached the remote: put everything back untouched
                warn!(owner = %self.owner_id, error = %e, "Batch not delivered");
                storage.queue_reset_processing(&self.owner_id)?;
                summary.failed = claimed.len();
                summary.requeued = claimed.len();
            }
            Err(e) => {
                warn!(owner = %self.owner_id, error = %e, "Batch rejected");
                let error = e.to_string();
                for op in claimed {
                    summary.failed += 1;
                    match self.release(storage, op, &error)? {
                        QueueStatus::Failed => summary.dropped += 1,
                        _ => summary.requeued += 1,
                    }
                }
            }
        }

        Ok(summary)
    }

    async fn dispatch_individually<R: RemoteStore>(
        &self,
        storage: &mut SqliteStorage,
        remote: &R,
        claimed: &[QueuedOperation],
    ) -> Result<Vec<OperationResult>> {
        let mut results = Vec::with_capacity(claimed.len());
        let mut offline: Option<String> = None;

        for op in claimed {
            if let Some(error) = &offline {
                results.push(result(op, false, Some(error.clone()), QueueStatus::Pending));
                continue;
            }

            match execute_operation(remote, &self.owner_id, &op.operation).await {
                Ok(()) => {
                    storage.queue_delete(std::slice::from_ref(&op.id))?;
                    results.push(result(op, true, None, QueueStatus::Completed));
                }
                Err(e) if e.is_connectivity() => {
                    let error = e.to_string();
                    results.push(result(op, false, Some(error.clone()), QueueStatus::Pending));
                    offline = Some(error);
                }
                Err(e) => {
                    let error = e.to_string();
                    let status = self.release(storage, op, &error)?;
                    results.push(result(op, false, Some(error), status));
                }
            }
        }

        if offline.is_some() {
            storage.queue_reset_processing(&self.owner_id)?;
        }
        Ok(results)
    }

    fn release(&self, storage: &mut SqliteStorage, op: &QueuedOperation, error: &str) -> Result<QueueStatus> {
        let status = storage.queue_release_failed(&op.id, error, self.settings.max_retries)?;
        if status == QueueStatus::Failed {
            warn!(
                owner = %self.owner_id,
                id = %op.id,
                kind = op.operation.kind(),
                error,
                "Operation exceeded retry limit"
            );
        }
        Ok(status)
    }
}

fn result(op: &QueuedOperation, success: bool, error: Option<String>, status: QueueStatus) -> OperationResult {
    OperationResult {
        id: op.id.clone(),
        kind: op.operation.kind().to_string(),
        success,
        error,
        status,
    }
}

/// Outcome for a flush that could not reach the remote at all.
fn undelivered(claimed: &[QueuedOperation], error: &str, batched: bool) -> SyncOutcome {
    if batched {
        let ids: Vec<&str> = claimed.iter().map(|op| op.id.as_str()).collect();
        return SyncOutcome::Batched(BatchSummary {
            batch_id: batch_id(&ids),
            failed: claimed.len(),
            requeued: claimed.len(),
            ..Default::default()
        });
    }
    SyncOutcome::Individual {
        results: claimed
            .iter()
            .map(|op| result(op, false, Some(error.to_string()), QueueStatus::Pending))
            .collect(),
    }
}

/// Apply one operation to the remote on its own.
async fn execute_operation<R: RemoteStore>(remote: &R, owner_id: &str, operation: &Operation) -> Result<()> {
    let Operation::RecordReview { item, event } = operation;
    remote.insert_review_event(owner_id, item, event).await
}
