//! Bidirectional incremental sync.
//!
//! A cycle runs a push pass (local -> remote) and then a pull pass
//! (remote -> local). Records are matched across replicas by
//! `(owner, ItemKey)`, never by id. Each record is committed locally on its
//! own, so a failure part-way through a pass leaves earlier records
//! applied; the pass reports per-record counts and only a clean pass
//! advances its watermark.
//!
//! Watermarks:
//! - push: local clock at the start of the pass
//! - pull: highest remote `updated_at` seen

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Item, ItemKey, Progress, ReviewEvent};
use crate::remote::{RemoteProgress, RemoteStore};
use crate::storage::{Direction, SqliteStorage};

use super::conflict::{resolve, MergePolicy};
use super::observer::SyncObserver;
use super::types::{PassReport, SyncReport, Watermarks};

/// Default review dedup window: ten seconds either side.
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 10_000;

/// Actor recorded on audit events written by sync.
const SYNC_ACTOR: &str = "sync";

/// Tunables for a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub merge: MergePolicy,
    /// Local and remote review events with the same outcome this close
    /// together (ms) are the same review.
    pub dedup_window_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge: MergePolicy::default(),
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
        }
    }
}

/// What happened to one record.
enum RecordOutcome {
    Synced,
    Skipped,
}

/// Sync engine bound to one owner's local store and a remote.
pub struct SyncEngine<'a, R: RemoteStore, O: SyncObserver> {
    storage: &'a mut SqliteStorage,
    remote: &'a R,
    observer: &'a O,
    config: SyncConfig,
}

impl<'a, R: RemoteStore, O: SyncObserver> SyncEngine<'a, R, O> {
    pub fn new(storage: &'a mut SqliteStorage, remote: &'a R, observer: &'a O, config: SyncConfig) -> Self {
        Self {
            storage,
            remote,
            observer,
            config,
        }
    }

    /// Run a push pass and then a pull pass for `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns an error only for local storage failures while reading
    /// watermarks; per-record failures are reported in the passes.
    pub async fn run_cycle(&mut self, owner_id: &str) -> Result<SyncReport> {
        let push = self.push(owner_id).await?;
        let pull = self.pull(owner_id).await?;

        let new_watermark = Watermarks {
            push: self.storage.get_watermark(owner_id, Direction::Push)?,
            pull: self.storage.get_watermark(owner_id, Direction::Pull)?,
        };

        Ok(SyncReport {
            owner_id: owner_id.to_string(),
            push,
            pull,
            new_watermark,
        })
    }

    // ====
    // Push
    // ====

    /// Push local progress and review events changed since the push watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    pub async fn push(&mut self, owner_id: &str) -> Result<PassReport> {
        let started = Utc::now().timestamp_millis();
        let since = self.storage.get_watermark(owner_id, Direction::Push)?.unwrap_or(0);
        let mut report = PassReport::default();

        let rows = self.storage.progress_updated_since(owner_id, since)?;
        debug!(owner = owner_id, since, rows = rows.len(), "Push pass");

        for local in &rows {
            match self.push_progress(owner_id, local).await {
                Ok(RecordOutcome::Synced) => report.synced += 1,
                Ok(RecordOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_connectivity() => {
                    report.record_abort(&e);
                    break;
                }
                Err(e) => report.record_failure(&local.id, &e),
            }
        }

        if !report.aborted {
            let events = self.storage.review_events_since(owner_id, since)?;
            self.push_review_events(owner_id, events, &mut report).await?;
        }

        if report.is_clean() {
            self.storage.set_watermark(owner_id, Direction::Push, started)?;
        }
        self.observer.on_pass_complete(owner_id, Direction::Push, &report);
        Ok(report)
    }

    /// Bring the remote copy of one local progress record up to date.
    ///
    /// Same rules as the push pass: a missing remote row is created, an
    /// identical one is left alone, and a diverged one is merged first so
    /// fields the remote gained elsewhere survive. Returns the local record
    /// as it stands afterwards.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id, any remote error, or a local
    /// storage error.
    pub async fn mirror_progress(&mut self, owner_id: &str, progress_id: &str) -> Result<Progress> {
        let local = self.local_progress(progress_id)?;
        if let RecordOutcome::Synced = self.push_progress(owner_id, &local).await? {
            debug!(owner = owner_id, progress = progress_id, "Mirrored progress");
        }
        self.local_progress(progress_id)
    }

    async fn push_progress(&mut self, owner_id: &str, local: &Progress) -> Result<RecordOutcome> {
        let item = self.local_item(&local.item_id)?;
        let key = item.key();

        let Some(remote_row) = self.remote.find_progress(owner_id, &key).await? else {
            self.remote.upsert_progress(owner_id, &item, local).await?;
            return Ok(RecordOutcome::Synced);
        };

        if remote_row.progress.same_state(local) {
            return Ok(RecordOutcome::Skipped);
        }

        let merged = self.merge_into_local(local, &remote_row.progress, &key)?;
        self.remote.upsert_progress(owner_id, &item, &merged).await?;
        Ok(RecordOutcome::Synced)
    }

    async fn push_review_events(
        &mut self,
        owner_id: &str,
        events: Vec<ReviewEvent>,
        report: &mut PassReport,
    ) -> Result<()> {
        // Group by progress, keeping chronological order inside each group
        let mut groups: Vec<(String, Vec<ReviewEvent>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for event in events {
            let slot = *index.entry(event.progress_id.clone()).or_insert_with(|| {
                groups.push((event.progress_id.clone(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(event);
        }

        for (progress_id, group) in groups {
            match self.push_review_group(owner_id, &progress_id, &group).await {
                Ok((synced, skipped)) => {
                    report.synced += synced;
                    report.skipped += skipped;
                }
                Err(e) if e.is_connectivity() => {
                    report.record_abort(&e);
                    break;
                }
                Err(e) => report.record_failure(&progress_id, &e),
            }
        }
        Ok(())
    }

    /// Push one progress record's new review events, skipping those the
    /// remote already has. Matching is one-to-one: each remote event can
    /// absorb at most one local event, and local events take the nearest
    /// unclaimed remote event with the same outcome inside the window.
    async fn push_review_group(
        &mut self,
        owner_id: &str,
        progress_id: &str,
        group: &[ReviewEvent],
    ) -> Result<(usize, usize)> {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            return Ok((0, 0));
        };
        let progress = self.local_progress(progress_id)?;
        let key = self.local_item(&progress.item_id)?.key();

        let window = self.config.dedup_window_ms;
        let remote_events = self
            .remote
            .review_events_between(owner_id, &key, first.created_at - window, last.created_at + window)
            .await?;

        let matched = match_review_events(group, &remote_events, window);
        let mut synced = 0;
        let mut skipped = 0;
        for (event, duplicate) in group.iter().zip(matched) {
            if duplicate {
                debug!(owner = owner_id, event = %event.id, "Review event already on remote");
                skipped += 1;
            } else {
                self.remote.insert_review_event(owner_id, &key, event).await?;
                synced += 1;
            }
        }
        Ok((synced, skipped))
    }

    // ====
    // Pull
    // ====

    /// Pull remote progress changed since the pull watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read or written
    /// outside per-record work.
    pub async fn pull(&mut self, owner_id: &str) -> Result<PassReport> {
        let since = self.storage.get_watermark(owner_id, Direction::Pull)?.unwrap_or(0);
        let mut report = PassReport::default();

        let rows = match self.remote.pull_progress_since(owner_id, since).await {
            Ok(rows) => rows,
            Err(e) if e.is_connectivity() => {
                report.record_abort(&e);
                self.observer.on_pass_complete(owner_id, Direction::Pull, &report);
                return Ok(report);
            }
            Err(e) => {
                report.record_failure("pull", &e);
                self.observer.on_pass_complete(owner_id, Direction::Pull, &report);
                return Ok(report);
            }
        };
        debug!(owner = owner_id, since, rows = rows.len(), "Pull pass");

        let mut highest = since;
        for row in current_rows(rows) {
            match self.pull_row(owner_id, &row).await {
                Ok(RecordOutcome::Synced) => report.synced += 1,
                Ok(RecordOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_connectivity() => {
                    report.record_abort(&e);
                    break;
                }
                Err(e) => report.record_failure(&row.progress.id, &e),
            }
            highest = highest.max(row.progress.updated_at);
        }

        if report.is_clean() && highest > since {
            self.storage.set_watermark(owner_id, Direction::Pull, highest)?;
        }
        self.observer.on_pass_complete(owner_id, Direction::Pull, &report);
        Ok(report)
    }

    async fn pull_row(&mut self, owner_id: &str, row: &RemoteProgress) -> Result<RecordOutcome> {
        let item = match self.storage.find_item_by_key(&row.item)? {
            Some(item) => item,
            None => self
                .remote
                .fetch_item(&row.item)
                .await?
                .ok_or_else(|| Error::Remote(format!("remote has no item for {}", row.item)))?,
        };

        let Some(local) = self.storage.find_current_progress(owner_id, &item.id)? else {
            let mirrored = Progress {
                id: format!("prog_{}", &uuid::Uuid::new_v4().to_string()[..12]),
                owner_id: owner_id.to_string(),
                item_id: item.id.clone(),
                ..row.progress.clone()
            };
            self.storage.mirror_remote_progress(&item, &mirrored, SYNC_ACTOR)?;
            return Ok(RecordOutcome::Synced);
        };

        if local.same_state(&row.progress) {
            return Ok(RecordOutcome::Skipped);
        }

        let merged = self.merge_into_local(&local, &row.progress, &row.item)?;
        if !merged.same_state(&row.progress) {
            self.remote.upsert_progress(owner_id, &item, &merged).await?;
        }
        Ok(RecordOutcome::Synced)
    }

    // ======
    // Shared
    // ======

    fn local_progress(&self, progress_id: &str) -> Result<Progress> {
        self.storage
            .get_progress(progress_id)?
            .ok_or_else(|| Error::NotFound {
                what: format!("progress {progress_id}"),
            })
    }

    fn local_item(&self, item_id: &str) -> Result<Item> {
        self.storage.get_item(item_id)?.ok_or_else(|| Error::NotFound {
            what: format!("item {item_id}"),
        })
    }

    /// Resolve a diverged pair and commit the result locally in one unit.
    fn merge_into_local(&mut self, local: &Progress, remote: &Progress, key: &ItemKey) -> Result<Progress> {
        let resolution = resolve(local, remote, &self.config.merge).inspect_err(|e| {
            warn!(record = %local.id, error = %e, "Merge produced an invalid record");
        })?;

        if !resolution.conflicts.is_empty() {
            self.observer
                .on_conflict(&local.owner_id, key, &resolution.conflicts);
        }
        if resolution.changes_local() {
            self.storage
                .apply_merge(&local.id, &resolution.patch, &resolution.conflicts, SYNC_ACTOR)?;
        }
        Ok(resolution.merged)
    }
}

/// Keep, per item, only the row the remote itself would consider current
/// (active over archived, then newest), oldest first.
fn current_rows(rows: Vec<RemoteProgress>) -> Vec<RemoteProgress> {
    let mut by_key: HashMap<ItemKey, RemoteProgress> = HashMap::new();
    for row in rows {
        match by_key.get(&row.item) {
            Some(current)
                if (!current.progress.archived && row.progress.archived)
                    || (current.progress.archived == row.progress.archived
                        && current.progress.updated_at >= row.progress.updated_at) => {}
            _ => {
                by_key.insert(row.item.clone(), row);
            }
        }
    }
    let mut rows: Vec<RemoteProgress> = by_key.into_values().collect();
    rows.sort_by_key(|r| r.progress.updated_at);
    rows
}

/// For each local event (chronological), whether it matches a remote event.
pub(crate) fn match_review_events(local: &[ReviewEvent], remote: &[ReviewEvent], window_ms: i64) -> Vec<bool> {
    let mut claimed = vec![false; remote.len()];
    local
        .iter()
        .map(|event| {
            let nearest = remote
                .iter()
                .enumerate()
                .filter(|(i, r)| {
                    !claimed[*i]
                        && r.succeeded == event.succeeded
                        && (r.created_at - event.created_at).abs() <= window_ms
                })
                .min_by_key(|(_, r)| (r.created_at - event.created_at).abs())
                .map(|(i, _)| i);
            match nearest {
                Some(i) => {
                    claimed[i] = true;
                    true
                }
                None => false,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Phase, ProgressPatch};
    use crate::remote::MemoryRemote;
    use crate::sync::observer::testing::RecordingObserver;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn review_at(progress_id: &str, created_at: i64, succeeded: bool) -> ReviewEvent {
        let mut event = ReviewEvent::new("owner", progress_id, succeeded, true, None);
        event.created_at = created_at;
        event
    }

    fn seeded_local(storage: &mut SqliteStorage, reference: &str) -> (Item, Progress) {
        let item = Item::manual(reference.into(), "text".into(), "KJV".into());
        storage.create_item(&item, "owner").unwrap();
        let progress = Progress::new("owner", &item.id, date(2024, 6, 10));
        storage.create_progress(&progress, "owner").unwrap();
        (item, progress)
    }

    #[test]
    fn test_match_review_events_one_to_one() {
        const T: i64 = 1_000_000;
        let local = [review_at("p", T, true), review_at("p", T + 5_000, true)];
        let remote = [review_at("r", T + 2_000, true)];
        assert_eq!(match_review_events(&local, &remote, 10_000), vec![true, false]);
    }

    #[test]
    fn test_match_review_events_requires_same_outcome_and_window() {
        const T: i64 = 1_000_000;
        let local = [review_at("p", T, true), review_at("p", T + 60_000, false)];
        let remote = [review_at("r", T + 1_000, false), review_at("r", T + 75_000, false)];
        assert_eq!(match_review_events(&local, &remote, 10_000), vec![false, false]);
    }

    #[tokio::test]
    async fn test_push_skips_duplicate_review_event() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        let observer = RecordingObserver::default();
        let (item, progress) = seeded_local(&mut storage, "John 3:16");

        let t = Utc::now().timestamp_millis();
        storage
            .append_review_event(&review_at(&progress.id, t, true), "owner")
            .unwrap();
        storage
            .append_review_event(&review_at(&progress.id, t + 5_000, true), "owner")
            .unwrap();

        // The remote already has the progress row and one event at T+2s
        remote.seed_progress(&item, &progress);
        remote.seed_review(&item.key(), &review_at("remote", t + 2_000, true));

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        let report = engine.push("owner").await.unwrap();
        assert!(report.is_clean());

        assert_eq!(remote.review_events(&item.key()).len(), 2);
        assert_eq!(remote.calls().review_inserts, 1);
    }

    #[tokio::test]
    async fn test_push_creates_remote_and_advances_watermark() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        let observer = RecordingObserver::default();
        let (item, progress) = seeded_local(&mut storage, "John 3:16");

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        let report = engine.push("owner").await.unwrap();
        assert_eq!(report.synced, 1);

        let rows = remote.progress_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item, item.key());
        assert_ne!(rows[0].progress.id, progress.id);
        assert!(storage.get_watermark("owner", Direction::Push).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pull_merges_documented_scenario() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        let observer = RecordingObserver::default();
        let (item, progress) = seeded_local(&mut storage, "John 3:16");

        let local = storage
            .update_progress(
                &progress.id,
                &ProgressPatch {
                    phase: Some(Phase::P1),
                    best_streak: Some(5),
                    next_due_date: Some(date(2024, 6, 10)),
                    updated_at: Some(1_000),
                    ..Default::default()
                },
                "owner",
            )
            .unwrap();

        let mut remote_progress = local.clone();
        remote_progress.phase = Phase::P0;
        remote_progress.best_streak = 8;
        remote_progress.next_due_date = date(2024, 6, 8);
        remote_progress.updated_at = 2_000;
        remote.seed_progress(&item, &remote_progress);

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        let report = engine.pull("owner").await.unwrap();
        assert_eq!(report.synced, 1);

        let merged = storage.get_progress(&progress.id).unwrap().unwrap();
        assert_eq!(merged.phase, Phase::P1);
        assert_eq!(merged.best_streak, 8);
        assert_eq!(merged.next_due_date, date(2024, 6, 8));

        // Merged state was written back to the remote
        let rows = remote.progress_rows();
        assert!(rows[0].progress.same_state(&merged));
        assert!(!observer.conflicts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_mirrors_unknown_records() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        let observer = RecordingObserver::default();

        let item = Item {
            verified: true,
            ..Item::manual("Psalm 23:1".into(), "The Lord is my shepherd".into(), "KJV".into())
        };
        let stored = remote.seed_progress(&item, &Progress::new("owner", &item.id, date(2024, 6, 10)));

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        let report = engine.pull("owner").await.unwrap();
        assert_eq!(report.synced, 1);

        let local_item = storage.find_item_by_key(&item.key()).unwrap().unwrap();
        assert_eq!(local_item.id, stored.progress.item_id);
        assert!(local_item.verified);
        let local = storage.find_active_progress("owner", &local_item.id).unwrap().unwrap();
        assert_ne!(local.id, stored.progress.id);
        assert_eq!(
            storage.get_watermark("owner", Direction::Pull).unwrap(),
            Some(stored.progress.updated_at)
        );
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        let observer = RecordingObserver::default();
        let (item, progress) = seeded_local(&mut storage, "John 3:16");
        seeded_local(&mut storage, "Romans 8:28");

        let mut diverged = progress.clone();
        diverged.best_streak = 9;
        diverged.next_due_date = date(2024, 6, 1);
        diverged.updated_at = progress.updated_at + 1;
        remote.seed_progress(&item, &diverged);

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        engine.run_cycle("owner").await.unwrap();
        let local_after_first = storage.progress_updated_since("owner", 0).unwrap();
        let remote_after_first = remote.progress_rows();
        let upserts_after_first = remote.calls().upserts;

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        let second = engine.run_cycle("owner").await.unwrap();
        assert_eq!(second.push.synced, 0);
        assert_eq!(second.pull.synced, 0);
        assert_eq!(remote.calls().upserts, upserts_after_first);
        assert_eq!(storage.progress_updated_since("owner", 0).unwrap(), local_after_first);
        assert_eq!(remote.progress_rows(), remote_after_first);
    }

    #[tokio::test]
    async fn test_offline_push_keeps_watermark() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let observer = RecordingObserver::default();
        seeded_local(&mut storage, "John 3:16");
        seeded_local(&mut storage, "John 3:17");

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        let report = engine.run_cycle("owner").await.unwrap();
        assert!(report.push.aborted);
        assert!(report.pull.aborted);
        assert_eq!(report.new_watermark, Watermarks::default());
    }

    #[tokio::test]
    async fn test_record_failure_does_not_stop_pass() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let remote = MemoryRemote::new();
        remote.fail_reference("John 3:16");
        let observer = RecordingObserver::default();
        seeded_local(&mut storage, "John 3:16");
        seeded_local(&mut storage, "John 3:17");

        let mut engine = SyncEngine::new(&mut storage, &remote, &observer, SyncConfig::default());
        let report = engine.push("owner").await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 1);
        assert!(!report.aborted);
        assert_eq!(storage.get_watermark("owner", Direction::Push).unwrap(), None);
    }
}
