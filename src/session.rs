//! Owner-scoped session: the write path and sync entry points.
//!
//! Every user-facing operation goes through an [`OwnerSession`]. Local
//! writes always commit first, in one transaction each; mirroring to the
//! remote happens afterwards and its failures are downgraded to a warning
//! on the outcome. A progress record that missed its mirror is still newer
//! than the push watermark, so the next sync carries it; review events
//! wait in the queue.
//!
//! `add_item` follows a fixed sequence:
//!
//! 1. local item (identity, then alias): create, reactivate, or fail as a duplicate
//! 2. remote lookup: mirror the canonical item and server-side progress
//! 3. unreachable remote: manual text becomes an unverified local item

use chrono::{FixedOffset, Offset, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Alias, Item, ItemKey, Operation, Progress, ReviewEvent};
use crate::reference::{canonicalize_reference, normalize_reference};
use crate::remote::{LookupOperation, LookupRequest, PassageLookup, RemoteStore};
use crate::scheduler::{self, PhaseThresholds, ReviewOutcome};
use crate::storage::{AuditEntry, Direction, DueEntry, OwnerCounts, SqliteStorage};
use crate::sync::{
    Adaptive, BatchQueue, DispatchPolicy, QueueSettings, QueueSnapshot, SyncConfig, SyncEngine,
    SyncObserver, SyncOutcome, SyncReport, TracingObserver, Watermarks,
};

/// Translation used when none is configured.
pub const DEFAULT_TRANSLATION: &str = "KJV";

/// Per-owner tunables.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Translation new items are looked up in.
    pub translation: String,
    /// The owner's timezone; decides what "today" is.
    pub offset: FixedOffset,
    pub thresholds: PhaseThresholds,
    pub sync: SyncConfig,
    pub queue: QueueSettings,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            translation: DEFAULT_TRANSLATION.to_string(),
            offset: Utc.fix(),
            thresholds: PhaseThresholds::default(),
            sync: SyncConfig::default(),
            queue: QueueSettings::default(),
        }
    }
}

/// How a write reached its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    /// New progress for an item already known locally
    Created,
    /// Archived progress restarted at p0
    Reactivated,
    /// Item and progress mirrored from the lookup service
    Mirrored,
    /// Unverified item created from manual text
    Manual,
    Archived,
}

/// Result of a local write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub action: WriteAction,
    pub item: Item,
    pub progress: Progress,
    /// Set when the local write succeeded but the remote mirror did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Result of recording a review.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub item: Item,
    pub progress: Progress,
    pub event: ReviewEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flushed: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Result of the verification pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    /// References now verified
    pub verified: Vec<String>,
    /// `reference: reason` for items left unverified
    pub rejected: Vec<String>,
    /// True when the remote became unreachable part-way
    pub aborted: bool,
}

/// Result of `sync`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<SyncOutcome>,
    pub report: SyncReport,
    /// Queued reviews dropped because the push pass delivered them
    pub acknowledged: usize,
}

/// Result of `history`: the record and how it got there.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub item: Item,
    pub progress: Progress,
    pub entries: Vec<AuditEntry>,
}

/// Everything `recall status` shows.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub owner_id: String,
    pub counts: OwnerCounts,
    pub queue: QueueSnapshot,
    pub watermarks: Watermarks,
}

/// One owner's view of the local store, optionally connected to a remote.
///
/// `remote` is `None` when working offline; every write still succeeds
/// locally, reviews are queued, and progress waits for the next sync.
pub struct OwnerSession<'a, R, O = TracingObserver, P = Adaptive>
where
    R: RemoteStore + PassageLookup,
    O: SyncObserver,
    P: DispatchPolicy,
{
    storage: &'a mut SqliteStorage,
    remote: Option<&'a R>,
    observer: O,
    queue: BatchQueue<P>,
    owner_id: String,
    options: SessionOptions,
}

impl<'a, R, O, P> OwnerSession<'a, R, O, P>
where
    R: RemoteStore + PassageLookup,
    O: SyncObserver,
    P: DispatchPolicy,
{
    /// Open a session, recovering any interrupted queue flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be opened.
    pub fn new(
        storage: &'a mut SqliteStorage,
        remote: Option<&'a R>,
        observer: O,
        owner_id: &str,
        options: SessionOptions,
    ) -> Result<Self> {
        let queue = BatchQueue::open(storage, owner_id, options.queue)?.with_dedup_window(options.sync.dedup_window_ms);
        Ok(Self {
            storage,
            remote,
            observer,
            queue,
            owner_id: owner_id.to_string(),
            options,
        })
    }

    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    #[must_use]
    pub fn today(&self) -> chrono::NaiveDate {
        scheduler::today_in(&self.options.offset)
    }

    // ==========
    // Write path
    // ==========

    /// Start memorizing `reference`.
    ///
    /// `manual_text` is only used when the item is unknown locally and the
    /// lookup service cannot be reached.
    ///
    /// # Errors
    ///
    /// - `Duplicate` if the owner already has active progress for the item.
    ///   When the lookup service reports it (`on_remote`), the attached record
    ///   is the remote row with remote ids and nothing is written locally.
    /// - `Validation` if the lookup service does not recognize the reference
    /// - `ManualTextRequired` if the remote is unreachable and no text was given
    /// - local storage failures
    pub async fn add_item(&mut self, reference: &str, manual_text: Option<&str>) -> Result<WriteOutcome> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::InvalidArgument("reference is empty".to_string()));
        }
        let normalized = normalize_reference(reference);
        let translation = self.options.translation.clone();

        // Local
        if let Some(item) = self.find_local_item(reference, &normalized)? {
            debug!(reference, item = %item.id, "Found item locally");
            return self.add_for_known_item(item, &normalized).await;
        }

        // Remote
        if let Some(remote) = self.remote {
            let request = LookupRequest {
                operation: LookupOperation::Create,
                owner_id: self.owner_id.clone(),
                reference: reference.to_string(),
                normalized_reference: normalized.clone(),
                translation: translation.clone(),
            };
            match remote.lookup(&request).await {
                Ok(response) => {
                    let item = response
                        .item
                        .ok_or_else(|| Error::Remote(format!("lookup returned no item for {reference}")))?;
                    return self
                        .mirror_looked_up(item, response.existing_progress, &normalized)
                        .await;
                }
                Err(e) if e.is_connectivity() => {
                    warn!(reference, error = %e, "Lookup unreachable, falling back to manual entry");
                }
                Err(e) => return Err(e),
            }
        }

        // Manual
        let Some(text) = manual_text.map(str::trim).filter(|t| !t.is_empty()) else {
            return Err(Error::ManualTextRequired {
                reference: reference.to_string(),
            });
        };
        let canonical = canonicalize_reference(reference).unwrap_or_else(|| reference.to_string());
        let item = Item::manual(canonical, text.to_string(), translation);
        let progress = Progress::new(&self.owner_id, &item.id, self.today());
        let alias = Alias::new(normalized, item.id.clone());
        let (item, progress) =
            self.storage
                .create_item_with_progress(&item, Some(&alias), &progress, &self.owner_id)?;
        info!(owner = %self.owner_id, reference = %item.canonical_reference, "Created unverified item");

        let (progress, warning) = self.mirror_progress(progress).await?;
        Ok(WriteOutcome {
            action: WriteAction::Manual,
            item,
            progress,
            warning,
        })
    }

    /// Create or reactivate progress for an item already stored locally.
    async fn add_for_known_item(&mut self, item: Item, normalized: &str) -> Result<WriteOutcome> {
        let alias = Alias::new(normalized.to_string(), item.id.clone());
        let today = self.today();

        let (action, progress) = match self.storage.find_current_progress(&self.owner_id, &item.id)? {
            Some(existing) if !existing.archived => {
                return Err(Error::Duplicate {
                    existing: Box::new(existing),
                    on_remote: false,
                });
            }
            Some(archived) => {
                let progress = self
                    .storage
                    .reactivate_progress(&archived.id, today, Some(&alias), &self.owner_id)?;
                (WriteAction::Reactivated, progress)
            }
            None => {
                let progress = Progress::new(&self.owner_id, &item.id, today);
                self.storage
                    .create_progress_with_alias(&progress, Some(&alias), &self.owner_id)?;
                (WriteAction::Created, progress)
            }
        };

        let (progress, warning) = self.mirror_progress(progress).await?;
        Ok(WriteOutcome {
            action,
            item,
            progress,
            warning,
        })
    }

    /// Store the canonical item (and server-side progress) the lookup service returned.
    async fn mirror_looked_up(
        &mut self,
        item: Item,
        remote_progress: Option<Progress>,
        normalized: &str,
    ) -> Result<WriteOutcome> {
        // Known under its canonical spelling but not under what the user typed
        if let Some(local) = self.storage.find_item_by_key(&item.key())? {
            return self.add_for_known_item(local, normalized).await;
        }

        let today = self.today();
        let progress = match remote_progress {
            Some(remote) => Progress {
                id: format!("prog_{}", &uuid::Uuid::new_v4().to_string()[..12]),
                owner_id: self.owner_id.clone(),
                item_id: item.id.clone(),
                ..remote
            },
            None => Progress::new(&self.owner_id, &item.id, today),
        };
        let alias = Alias::new(normalized.to_string(), item.id.clone());
        let (item, progress) =
            self.storage
                .create_item_with_progress(&item, Some(&alias), &progress, &self.owner_id)?;
        info!(owner = %self.owner_id, reference = %item.canonical_reference, "Mirrored item from lookup");

        Ok(WriteOutcome {
            action: WriteAction::Mirrored,
            item,
            progress,
            warning: None,
        })
    }

    /// Mirror a committed progress record inline, merging with the remote
    /// row first when it has diverged. Returns the record as it stands
    /// afterwards and a warning when the remote could not be updated.
    async fn mirror_progress(&mut self, progress: Progress) -> Result<(Progress, Option<String>)> {
        let Some(remote) = self.remote else {
            return Ok((progress, None));
        };
        let mut engine = SyncEngine::new(self.storage, remote, &self.observer, self.options.sync);
        match engine.mirror_progress(&self.owner_id, &progress.id).await {
            Ok(current) => Ok((current, None)),
            Err(e @ Error::Database(_)) => Err(e),
            Err(e) => {
                warn!(owner = %self.owner_id, progress = %progress.id, error = %e, "Remote mirror failed");
                let warning = format!("saved locally; remote update failed ({e}); `recall sync` will send it");
                Ok((progress, Some(warning)))
            }
        }
    }

    // =======
    // Reviews
    // =======

    /// Record one review of `reference`.
    ///
    /// Whether the review counts toward phase progress is decided here,
    /// once, from the due date. The event and the scheduling change commit
    /// together. The progress record is then mirrored through the merge
    /// path and the event is queued for the remote.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the owner has no active progress for the item,
    /// or a local storage error.
    pub async fn record_review(
        &mut self,
        reference: &str,
        succeeded: bool,
        duration_s: Option<u32>,
    ) -> Result<ReviewReport> {
        let (item, progress) = self.tracked(reference)?;
        let today = self.today();
        let now = Utc::now().timestamp_millis();
        let counted = scheduler::is_counted(&progress, today);

        let next_phase_assignments = match progress.phase.next() {
            Some(next) => self.storage.assignments_in_phase(&self.owner_id, next)?,
            None => Vec::new(),
        };
        let patch = scheduler::review_transition(
            &progress,
            ReviewOutcome { succeeded, counted },
            today,
            now,
            &self.options.thresholds,
            &next_phase_assignments,
        );

        let mut event = ReviewEvent::new(&self.owner_id, &progress.id, succeeded, counted, duration_s);
        event.created_at = now;
        let updated = self.storage.record_review(&event, &patch, &self.owner_id)?;
        info!(
            owner = %self.owner_id,
            reference = %item.canonical_reference,
            succeeded,
            counted,
            phase = %updated.phase,
            "Recorded review"
        );

        let (updated, mut warning) = self.mirror_progress(updated).await?;
        self.queue.enqueue(
            self.storage,
            Operation::RecordReview {
                item: item.key(),
                event: event.clone(),
            },
        )?;

        let flushed = match self.remote {
            Some(remote) => {
                self.queue
                    .flush(self.storage, remote, &self.observer, false)
                    .await?
            }
            None => None,
        };
        if let Some(outcome) = flushed.as_ref().filter(|outcome| outcome.failed() > 0) {
            warning.get_or_insert_with(|| format!("{} queued review(s) could not be sent", outcome.failed()));
        }

        Ok(ReviewReport {
            item,
            progress: updated,
            event,
            flushed,
            warning,
        })
    }

    // ================
    // Archive / resume
    // ================

    /// Stop reviewing `reference`. History and `best_streak` are kept.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no active progress for the item.
    pub async fn archive_item(&mut self, reference: &str) -> Result<WriteOutcome> {
        let (item, progress) = self.tracked(reference)?;
        let progress = self.storage.archive_progress(&progress.id, &self.owner_id)?;
        let (progress, warning) = self.mirror_progress(progress).await?;
        Ok(WriteOutcome {
            action: WriteAction::Archived,
            item,
            progress,
            warning,
        })
    }

    /// Restart archived progress for `reference` at p0, due today.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` if the progress is already active and `NotFound`
    /// if the owner never tracked the item.
    pub async fn resume(&mut self, reference: &str) -> Result<WriteOutcome> {
        let item = self.find_item(reference)?;
        let progress = match self.storage.find_current_progress(&self.owner_id, &item.id)? {
            Some(active) if !active.archived => {
                return Err(Error::Duplicate {
                    existing: Box::new(active),
                    on_remote: false,
                });
            }
            Some(archived) => archived,
            None => {
                return Err(Error::NotFound {
                    what: format!("progress for {reference}"),
                })
            }
        };

        let today = self.today();
        let progress = self
            .storage
            .reactivate_progress(&progress.id, today, None, &self.owner_id)?;
        let (progress, warning) = self.mirror_progress(progress).await?;
        Ok(WriteOutcome {
            action: WriteAction::Reactivated,
            item,
            progress,
            warning,
        })
    }

    // =====
    // Reads
    // =====

    /// Active progress due today or earlier, most overdue first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn due_today(&self) -> Result<Vec<DueEntry>> {
        self.storage.due_progress(&self.owner_id, self.today())
    }

    /// All tracked items.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, include_archived: bool) -> Result<Vec<DueEntry>> {
        self.storage.list_progress(&self.owner_id, include_archived)
    }

    /// The most recent changes to a passage's progress, archived or not.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the passage was never tracked by this owner.
    pub fn history(&self, reference: &str, limit: u32) -> Result<HistoryReport> {
        let item = self.find_item(reference)?;
        let progress = self
            .storage
            .find_current_progress(&self.owner_id, &item.id)?
            .ok_or_else(|| Error::NotFound {
                what: format!("progress for {reference}"),
            })?;
        let entries = self.storage.progress_history(&progress.id, limit)?;
        Ok(HistoryReport { item, progress, entries })
    }

    /// Counts, queue state and watermarks.
    ///
    /// # Errors
    ///
    /// Returns an error if any query fails.
    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            owner_id: self.owner_id.clone(),
            counts: self.storage.owner_counts(&self.owner_id, self.today())?,
            queue: self.queue.snapshot(&*self.storage)?,
            watermarks: Watermarks {
                push: self.storage.get_watermark(&self.owner_id, Direction::Push)?,
                pull: self.storage.get_watermark(&self.owner_id, Direction::Pull)?,
            },
        })
    }

    // ============
    // Verification
    // ============

    /// Confirm manually entered items against the lookup service.
    ///
    /// # Errors
    ///
    /// Returns `Connectivity` when there is no remote, or a local storage error.
    pub async fn verify_items(&mut self) -> Result<VerifyReport> {
        let remote = self.connected()?;
        let mut report = VerifyReport::default();

        for item in self.storage.unverified_items_for_owner(&self.owner_id)? {
            let request = LookupRequest {
                operation: LookupOperation::Lookup,
                owner_id: self.owner_id.clone(),
                reference: item.canonical_reference.clone(),
                normalized_reference: normalize_reference(&item.canonical_reference),
                translation: item.source_translation.clone(),
            };

            let confirmed = match remote.lookup(&request).await {
                Ok(response) => response.item,
                Err(e) if e.is_connectivity() => {
                    warn!(owner = %self.owner_id, error = %e, "Verification stopped");
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    report.rejected.push(format!("{}: {e}", item.canonical_reference));
                    continue;
                }
            };

            let Some(confirmed) = confirmed else {
                report
                    .rejected
                    .push(format!("{}: lookup returned no passage", item.canonical_reference));
                continue;
            };

            // Canonical spelling may already belong to another item
            if let Some(other) = self.storage.find_item_by_key(&confirmed.key())? {
                if other.id != item.id {
                    report.rejected.push(format!(
                        "{}: already tracked as {}",
                        item.canonical_reference, other.canonical_reference
                    ));
                    continue;
                }
            }

            self.storage.mark_item_verified(
                &item.id,
                &confirmed.canonical_reference,
                &confirmed.body_text,
                &self.owner_id,
            )?;
            report.verified.push(confirmed.canonical_reference);
        }

        Ok(report)
    }

    // ====
    // Sync
    // ====

    /// Run a full sync cycle, drop queued reviews the push pass already
    /// delivered, then flush whatever is left.
    ///
    /// The cycle goes first so every progress record reaches the remote
    /// through the merge path; a queued review needs its remote progress
    /// row to exist anyway.
    ///
    /// # Errors
    ///
    /// Returns `Connectivity` when there is no remote, or a local storage error.
    pub async fn sync(&mut self) -> Result<SyncRun> {
        let remote = self.connected()?;

        let mut engine = SyncEngine::new(self.storage, remote, &self.observer, self.options.sync);
        let report = engine.run_cycle(&self.owner_id).await?;

        let acknowledged = match report.new_watermark.push {
            Some(through) if report.push.is_clean() => self.queue.acknowledge_pushed(self.storage, through)?,
            _ => 0,
        };

        let flush = self
            .queue
            .flush(self.storage, remote, &self.observer, true)
            .await?;

        Ok(SyncRun {
            flush,
            report,
            acknowledged,
        })
    }

    /// Flush the queue now.
    ///
    /// # Errors
    ///
    /// Returns `Connectivity` when there is no remote, or a local storage error.
    pub async fn flush_queue(&mut self, force: bool) -> Result<Option<SyncOutcome>> {
        let remote = self.connected()?;
        self.queue
            .flush(self.storage, remote, &self.observer, force)
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn queue_status(&self) -> Result<QueueSnapshot> {
        self.queue.snapshot(&*self.storage)
    }

    /// Remove operations that exhausted their retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear_failed(&mut self) -> Result<usize> {
        self.queue.clear_failed(self.storage)
    }

    // =======
    // Helpers
    // =======

    fn connected(&self) -> Result<&'a R> {
        self.remote
            .ok_or_else(|| Error::Connectivity("no remote configured (offline)".to_string()))
    }

    /// Direct identity, then alias, then the best-effort canonical
    /// spelling manual entries are stored under.
    fn find_local_item(&self, reference: &str, normalized: &str) -> Result<Option<Item>> {
        let translation = &self.options.translation;
        if let Some(item) = self
            .storage
            .find_item_by_reference_or_alias(reference, normalized, translation)?
        {
            return Ok(Some(item));
        }
        match canonicalize_reference(reference) {
            Some(canonical) => self.storage.find_item_by_key(&ItemKey::new(&canonical, translation)),
            None => Ok(None),
        }
    }

    fn find_item(&self, reference: &str) -> Result<Item> {
        let reference = reference.trim();
        self.find_local_item(reference, &normalize_reference(reference))?
            .ok_or_else(|| Error::NotFound {
                what: format!("item {reference}"),
            })
    }

    fn tracked(&self, reference: &str) -> Result<(Item, Progress)> {
        let item = self.find_item(reference)?;
        let progress = self
            .storage
            .find_active_progress(&self.owner_id, &item.id)?
            .ok_or_else(|| Error::NotFound {
                what: format!("active progress for {reference}"),
            })?;
        Ok((item, progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Phase, QueueStatus};
    use crate::storage::Change;
    use crate::remote::MemoryRemote;
    use crate::sync::testing::RecordingObserver;

    const OWNER: &str = "owner_1";

    fn session<'a>(
        storage: &'a mut SqliteStorage,
        remote: Option<&'a MemoryRemote>,
    ) -> OwnerSession<'a, MemoryRemote, RecordingObserver> {
        OwnerSession::new(storage, remote, RecordingObserver::default(), OWNER, SessionOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_offline_add_requires_manual_text() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut session = session(&mut storage, None);

        let err = session.add_item("jn 3:16", None).await.unwrap_err();
        assert!(matches!(err, Error::ManualTextRequired { .. }));

        let outcome = session
            .add_item("jn 3:16", Some("For God so loved the world"))
            .await
            .unwrap();
        assert_eq!(outcome.action, WriteAction::Manual);
        assert_eq!(outcome.item.canonical_reference, "John 3:16");
        assert!(!outcome.item.verified);
        assert_eq!(outcome.progress.phase, Phase::P0);
        assert_eq!(outcome.progress.next_due_date, session.today());
        assert!(outcome.warning.is_none());
        // Progress is never queued; the next push carries it
        assert_eq!(session.queue_status().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_add_mirrors_lookup_and_rejects_duplicate() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.add_passage("John 3:16", DEFAULT_TRANSLATION, "For God so loved the world");
        let mut session = session(&mut storage, Some(&remote));

        let outcome = session.add_item("jn 3:16", None).await.unwrap();
        assert_eq!(outcome.action, WriteAction::Mirrored);
        assert!(outcome.item.verified);
        assert_eq!(outcome.item.canonical_reference, "John 3:16");
        assert_eq!(remote.progress_rows().len(), 1);

        // Second add resolves through the alias without asking the remote
        let err = session.add_item("JN 3:16", None).await.unwrap_err();
        match err {
            Error::Duplicate { existing, on_remote } => {
                assert_eq!(existing.id, outcome.progress.id);
                assert!(!on_remote);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(remote.calls().lookups, 1);
    }

    #[tokio::test]
    async fn test_add_reactivates_archived_progress_via_alias() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut session = session(&mut storage, None);

        session.add_item("John 3:16", Some("text")).await.unwrap();
        assert!(matches!(
            session.add_item("jn 3:16", None).await.unwrap_err(),
            Error::Duplicate { .. }
        ));
        let archived = session.archive_item("John 3:16").await.unwrap();
        assert!(archived.progress.archived);

        let outcome = session.add_item("jn 3:16", None).await.unwrap();
        assert_eq!(outcome.action, WriteAction::Reactivated);
        assert_eq!(outcome.progress.id, archived.progress.id);
        assert_eq!(outcome.progress.phase, Phase::P0);
        assert_eq!(outcome.progress.phase_progress_count, 0);
        assert_eq!(outcome.progress.current_streak, 0);
        assert!(!outcome.progress.archived);
        assert_eq!(outcome.progress.next_due_date, session.today());
    }

    #[tokio::test]
    async fn test_unreachable_lookup_falls_back_to_manual() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let mut session = session(&mut storage, Some(&remote));

        let err = session.add_item("Psalm 23:1", None).await.unwrap_err();
        assert!(matches!(err, Error::ManualTextRequired { .. }));

        let outcome = session
            .add_item("Psalm 23:1", Some("The Lord is my shepherd"))
            .await
            .unwrap();
        assert_eq!(outcome.action, WriteAction::Manual);
        assert!(outcome.warning.unwrap().contains("recall sync"));
        assert_eq!(session.queue_status().unwrap().pending, 0);

        remote.set_online(true);
        let run = session.sync().await.unwrap();
        assert!(run.report.push.is_clean());
        assert_eq!(remote.progress_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_validation_error() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        let mut session = session(&mut storage, Some(&remote));

        let err = session.add_item("Hezekiah 4:2", Some("text")).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(session.list(true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_review_updates_schedule_and_queues() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut session = session(&mut storage, None);
        session.add_item("John 3:16", Some("text")).await.unwrap();

        let report = session.record_review("John 3:16", true, Some(30)).await.unwrap();
        assert!(report.event.counted);
        assert_eq!(report.progress.current_streak, 1);
        assert_eq!(report.progress.best_streak, 1);
        assert_eq!(report.progress.phase_progress_count, 1);
        assert_eq!(report.progress.next_due_date, session.today() + chrono::Duration::days(1));

        // Not due any more: a second success is recorded but not counted
        let again = session.record_review("John 3:16", true, None).await.unwrap();
        assert!(!again.event.counted);
        assert_eq!(again.progress.phase_progress_count, 1);

        // One queued operation per review
        let status = session.queue_status().unwrap();
        assert_eq!(status.pending, 2);
        assert!(status.operations.iter().all(|op| op.operation.kind() == "record_review"));
    }

    #[tokio::test]
    async fn test_failed_review_resets_streak() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut session = session(&mut storage, None);
        session.add_item("John 3:16", Some("text")).await.unwrap();
        session.record_review("John 3:16", true, None).await.unwrap();

        let report = session.record_review("John 3:16", false, None).await.unwrap();
        assert_eq!(report.progress.current_streak, 0);
        assert_eq!(report.progress.best_streak, 1);
        assert_eq!(report.progress.phase_progress_count, 0);
    }

    #[tokio::test]
    async fn test_resume_rules() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut session = session(&mut storage, None);
        session.add_item("John 3:16", Some("text")).await.unwrap();

        assert!(matches!(
            session.resume("John 3:16").await.unwrap_err(),
            Error::Duplicate { .. }
        ));
        assert!(matches!(
            session.resume("Romans 8:28").await.unwrap_err(),
            Error::NotFound { .. }
        ));

        session.archive_item("John 3:16").await.unwrap();
        let resumed = session.resume("jn 3:16").await.unwrap();
        assert!(!resumed.progress.archived);
        assert_eq!(session.due_today().unwrap().len(), 1);

        let history = session.history("John 3:16", 10).unwrap();
        let changes: Vec<Change> = history.entries.iter().map(|e| e.change).collect();
        assert_eq!(changes, vec![Change::Created, Change::Archived, Change::Reactivated]);
        assert!(matches!(
            session.history("Romans 8:28", 10).unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_sync_flushes_queue_without_duplicates() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.set_online(false);

        {
            let mut offline = session(&mut storage, Some(&remote));
            offline.add_item("John 3:16", Some("text")).await.unwrap();
            offline.record_review("John 3:16", true, None).await.unwrap();
        }

        remote.set_online(true);
        let mut online = session(&mut storage, Some(&remote));
        let run = online.sync().await.unwrap();
        // The push pass delivered the queued review, so nothing was flushed
        assert_eq!(run.acknowledged, 1);
        assert!(run.flush.is_none());
        assert!(run.report.push.is_clean());
        assert!(run.report.pull.is_clean());

        let status = online.queue_status().unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.failed, 0);

        let rows = remote.progress_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].progress.current_streak, 1);
        assert_eq!(remote.review_events(&rows[0].item).len(), 1);
    }

    #[tokio::test]
    async fn test_sync_requires_remote() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut session = session(&mut storage, None);
        assert!(session.sync().await.unwrap_err().is_connectivity());
    }

    #[tokio::test]
    async fn test_verify_confirms_manual_items() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();

        {
            let mut offline = session(&mut storage, None);
            offline.add_item("jn 3:16", Some("typed from memory")).await.unwrap();
            offline.add_item("Hezekiah 1:1", Some("not a book")).await.unwrap();
        }

        remote.add_passage("John 3:16", DEFAULT_TRANSLATION, "For God so loved the world");
        let mut online = session(&mut storage, Some(&remote));
        let report = online.verify_items().await.unwrap();
        assert_eq!(report.verified, vec!["John 3:16".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert!(!report.aborted);

        let entries = online.list(false).unwrap();
        let john = entries
            .iter()
            .find(|e| e.item.canonical_reference == "John 3:16")
            .unwrap();
        assert!(john.item.verified);
        assert_eq!(john.item.body_text, "For God so loved the world");
    }

    #[tokio::test]
    async fn test_failed_operations_can_be_cleared() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.fail_reference("John 3:16");
        {
            let mut offline = session(&mut storage, None);
            offline.add_item("John 3:16", Some("text")).await.unwrap();
            offline.record_review("John 3:16", true, None).await.unwrap();
        }

        let options = SessionOptions {
            queue: QueueSettings {
                max_retries: 0,
                ..QueueSettings::default()
            },
            ..SessionOptions::default()
        };
        let mut session: OwnerSession<'_, MemoryRemote, RecordingObserver> =
            OwnerSession::new(&mut storage, Some(&remote), RecordingObserver::default(), OWNER, options).unwrap();
        let outcome = session.flush_queue(true).await.unwrap().unwrap();
        assert_eq!(outcome.failed(), 1);

        let status = session.queue_status().unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.operations[0].status, QueueStatus::Failed);
        assert_eq!(session.clear_failed().unwrap(), 1);
        assert_eq!(session.queue_status().unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_offline_review_merges_with_newer_remote_on_sync() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.add_passage("John 3:16", DEFAULT_TRANSLATION, "For God so loved the world");
        let mut session = session(&mut storage, Some(&remote));

        let added = session.add_item("John 3:16", None).await.unwrap();
        session.sync().await.unwrap();

        // Another device moved the record ahead
        let early = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let mut advanced = remote.progress_rows()[0].progress.clone();
        advanced.phase = Phase::P2;
        advanced.best_streak = 20;
        advanced.next_due_date = early;
        advanced.updated_at = Utc::now().timestamp_millis();
        remote.seed_progress(&added.item, &advanced);

        remote.set_online(false);
        let report = session.record_review("John 3:16", false, None).await.unwrap();
        assert!(report.warning.is_some());
        assert_eq!(report.progress.best_streak, 0);

        remote.set_online(true);
        let run = session.sync().await.unwrap();
        assert!(run.report.push.is_clean());

        let rows = remote.progress_rows();
        assert_eq!(rows.len(), 1);
        let on_remote = &rows[0].progress;
        assert_eq!(on_remote.phase, Phase::P2);
        assert_eq!(on_remote.best_streak, 20);
        assert_eq!(on_remote.next_due_date, early);
        assert_eq!(remote.review_events(&added.item.key()).len(), 1);

        let local = &session.list(false).unwrap()[0].progress;
        assert!(local.same_state(on_remote));
        assert_eq!(session.queue_status().unwrap().operations.len(), 0);
    }

    #[tokio::test]
    async fn test_online_review_keeps_remote_gains() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.add_passage("John 3:16", DEFAULT_TRANSLATION, "For God so loved the world");
        let mut session = session(&mut storage, Some(&remote));
        let added = session.add_item("John 3:16", None).await.unwrap();

        let mut advanced = remote.progress_rows()[0].progress.clone();
        advanced.best_streak = 12;
        advanced.updated_at = Utc::now().timestamp_millis();
        remote.seed_progress(&added.item, &advanced);

        let report = session.record_review("John 3:16", true, None).await.unwrap();
        assert!(report.warning.is_none());
        assert_eq!(report.progress.best_streak, 12);
        assert_eq!(remote.progress_rows()[0].progress.best_streak, 12);
    }

    #[tokio::test]
    async fn test_add_rejects_progress_tracked_on_another_device() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.add_passage("John 3:16", DEFAULT_TRANSLATION, "For God so loved the world");
        let item = Item {
            verified: true,
            ..Item::manual("John 3:16".into(), "For God so loved the world".into(), DEFAULT_TRANSLATION.into())
        };
        let mut elsewhere = Progress::new(OWNER, &item.id, chrono::NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());
        elsewhere.best_streak = 7;
        let seeded = remote.seed_progress(&item, &elsewhere);

        {
            let mut session = session(&mut storage, Some(&remote));
            match session.add_item("jn 3:16", None).await.unwrap_err() {
                Error::Duplicate { existing, on_remote } => {
                    assert!(on_remote);
                    assert_eq!(existing.id, seeded.progress.id);
                    assert_eq!(existing.best_streak, 7);
                }
                other => panic!("expected duplicate, got {other:?}"),
            }
            assert!(session.list(true).unwrap().is_empty());
            assert!(session.queue_status().unwrap().operations.is_empty());
        }

        assert!(storage.find_item_by_key(&item.key()).unwrap().is_none());
        assert_eq!(remote.progress_rows().len(), 1);
    }
}
