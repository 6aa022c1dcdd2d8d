//! SQLite storage implementation (the local replica).
//!
//! This module provides the always-writable local store. It follows the
//! MutationContext pattern: every write goes through [`SqliteStorage::mutate`],
//! which runs one IMMEDIATE transaction, records audit events, and commits
//! or rolls back as a unit. Mutation closures are synchronous, so no network
//! call can ever run while the write lock is held.

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{
    Alias, Assignment, Item, ItemKey, Operation, Phase, Progress, ProgressPatch, QueueStatus,
    QueuedOperation, ReviewEvent,
};
use crate::storage::events::{self, AuditEntry, Change, Entity};
use crate::storage::schema::apply_schema;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// Context for a mutation operation, collecting audit entries that are
/// written in the same transaction as the mutation itself.
pub struct MutationContext {
    /// Name of the operation being performed.
    pub op_name: String,
    /// Actor performing the operation (owner id, or "sync").
    pub actor: String,
    /// Entries to append at the end of the transaction.
    pub entries: Vec<AuditEntry>,
}

impl MutationContext {
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            entries: Vec::new(),
        }
    }

    /// Record a change for this operation.
    pub fn record(&mut self, entity: Entity, entity_id: &str, change: Change) {
        self.entries
            .push(AuditEntry::new(entity, entity_id, change, &self.actor));
    }

    /// Record a change with a detail line (e.g. the field a merge overrode).
    pub fn record_detail(&mut self, entity: Entity, entity_id: &str, change: Change, detail: &str) {
        self.entries
            .push(AuditEntry::new(entity, entity_id, change, &self.actor).with_detail(detail));
    }
}

/// Sync direction a watermark belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

/// A due progress record together with its item, for review listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DueEntry {
    pub progress: Progress,
    pub item: Item,
}

/// Counts shown by `recall status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OwnerCounts {
    pub active: usize,
    pub archived: usize,
    pub due_today: usize,
    pub unverified_items: usize,
    pub review_events: usize,
}

const PROGRESS_COLUMNS: &str = "id, owner_id, item_id, phase, phase_progress_count, last_activity_at, \
     next_due_date, assigned_weekday, assigned_week_parity, assigned_day_of_month, archived, \
     current_streak, best_streak, created_at, updated_at";

const ITEM_COLUMNS: &str =
    "id, canonical_reference, body_text, source_translation, verified, created_at, updated_at";

const REVIEW_COLUMNS: &str =
    "id, owner_id, progress_id, succeeded, counted, duration_s, created_at";

const QUEUE_COLUMNS: &str =
    "id, owner_id, payload, queued_at, retry_count, status, last_error";

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(timeout_ms.unwrap_or(5000)))?;

        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// This method:
    /// 1. Begins an IMMEDIATE transaction (for write locking)
    /// 2. Executes the mutation closure
    /// 3. Appends audit entries
    /// 4. Commits (or rolls back on error, when the transaction is dropped)
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. Nothing is applied in that case.
    pub fn mutate<F, R>(&mut self, op: &str, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let mut ctx = MutationContext::new(op, actor);

        let result = f(&tx, &mut ctx)?;

        for entry in &ctx.entries {
            events::append(&tx, entry)?;
        }

        tx.commit()?;

        Ok(result)
    }

    // ===============
    // Item Operations
    // ===============

    /// Find an item by direct identity, then by alias.
    ///
    /// Direct identity compares the trimmed input against the canonical
    /// reference case-insensitively; the alias pass compares the normalized
    /// key. Both are restricted to `translation`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_item_by_reference_or_alias(
        &self,
        reference: &str,
        normalized_key: &str,
        translation: &str,
    ) -> Result<Option<Item>> {
        let direct = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM items
                     WHERE canonical_reference = ?1 COLLATE NOCASE AND source_translation = ?2"
                ),
                rusqlite::params![reference.trim(), translation],
                map_item_row,
            )
            .optional()?;

        if direct.is_some() {
            return Ok(direct);
        }

        let aliased = self
            .conn
            .query_row(
                "SELECT i.id, i.canonical_reference, i.body_text, i.source_translation, i.verified, i.created_at, i.updated_at
                 FROM aliases a JOIN items i ON i.id = a.item_id
                 WHERE a.normalized_key = ?1 AND i.source_translation = ?2
                 ORDER BY i.verified DESC, a.created_at ASC
                 LIMIT 1",
                rusqlite::params![normalized_key, translation],
                map_item_row,
            )
            .optional()?;

        Ok(aliased)
    }

    /// Get an item by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_item(&self, id: &str) -> Result<Option<Item>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                [id],
                map_item_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Find an item by its cross-replica identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_item_by_key(&self, key: &ItemKey) -> Result<Option<Item>> {
        let item = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM items
                     WHERE canonical_reference = ?1 AND source_translation = ?2"
                ),
                rusqlite::params![key.canonical_reference, key.source_translation],
                map_item_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Create an item.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (including an identity clash).
    pub fn create_item(&mut self, item: &Item, actor: &str) -> Result<()> {
        self.mutate("create_item", actor, |tx, ctx| {
            insert_item(tx, item)?;
            ctx.record(Entity::Item, &item.id, Change::Created);
            Ok(())
        })
    }

    /// Create an alias unless the same key already points at the item.
    ///
    /// Returns `true` if a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn create_alias_if_absent(&mut self, alias: &Alias, actor: &str) -> Result<bool> {
        self.mutate("create_alias", actor, |tx, ctx| {
            let inserted = insert_alias_if_absent(tx, alias)?;
            if inserted {
                ctx.record(Entity::Alias, &alias.id, Change::Created);
            }
            Ok(inserted)
        })
    }

    /// Unverified items referenced by an owner's progress records.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn unverified_items_for_owner(&self, owner_id: &str) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT i.id, i.canonical_reference, i.body_text, i.source_translation, i.verified, i.created_at, i.updated_at
             FROM items i JOIN progress p ON p.item_id = i.id
             WHERE p.owner_id = ?1 AND i.verified = 0
             ORDER BY i.created_at ASC",
        )?;
        let rows = stmt.query_map([owner_id], map_item_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Replace an item's text with the confirmed text and mark it verified.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist or the update fails.
    pub fn mark_item_verified(
        &mut self,
        item_id: &str,
        canonical_reference: &str,
        body_text: &str,
        actor: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("verify_item", actor, |tx, ctx| {
            let updated = tx.execute(
                "UPDATE items SET canonical_reference = ?1, body_text = ?2, verified = 1, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![canonical_reference, body_text, now, item_id],
            )?;
            if updated == 0 {
                return Err(Error::NotFound {
                    what: format!("item {item_id}"),
                });
            }
            ctx.record(Entity::Item, item_id, Change::Verified);
            Ok(())
        })
    }

    // ===================
    // Progress Operations
    // ===================

    /// Get a progress record by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_progress(&self, id: &str) -> Result<Option<Progress>> {
        let progress = self
            .conn
            .query_row(
                &format!("SELECT {PROGRESS_COLUMNS} FROM progress WHERE id = ?1"),
                [id],
                map_progress_row,
            )
            .optional()?;
        Ok(progress)
    }

    /// Find the owner's non-archived progress for an item.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_active_progress(&self, owner_id: &str, item_id: &str) -> Result<Option<Progress>> {
        let progress = self
            .conn
            .query_row(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM progress
                     WHERE owner_id = ?1 AND item_id = ?2 AND archived = 0"
                ),
                rusqlite::params![owner_id, item_id],
                map_progress_row,
            )
            .optional()?;
        Ok(progress)
    }

    /// Find the owner's current progress for an item: the active one if
    /// any, otherwise the most recently updated archived one.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_current_progress(&self, owner_id: &str, item_id: &str) -> Result<Option<Progress>> {
        let progress = self
            .conn
            .query_row(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM progress
                     WHERE owner_id = ?1 AND item_id = ?2
                     ORDER BY archived ASC, updated_at DESC
                     LIMIT 1"
                ),
                rusqlite::params![owner_id, item_id],
                map_progress_row,
            )
            .optional()?;
        Ok(progress)
    }

    /// Create a progress record.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, including when an active
    /// record already exists for the same owner and item.
    pub fn create_progress(&mut self, progress: &Progress, actor: &str) -> Result<()> {
        self.mutate("create_progress", actor, |tx, ctx| {
            insert_progress(tx, progress)?;
            ctx.record(Entity::Progress, &progress.id, Change::Created);
            Ok(())
        })
    }

    /// Apply a patch to a progress record and return the updated record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist or the update fails.
    pub fn update_progress(&mut self, id: &str, patch: &ProgressPatch, actor: &str) -> Result<Progress> {
        self.mutate("update_progress", actor, |tx, ctx| {
            let updated = patch_progress(tx, id, patch)?;
            ctx.record(Entity::Progress, id, Change::Updated);
            Ok(updated)
        })
    }

    /// Archive a progress record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist or the update fails.
    pub fn archive_progress(&mut self, id: &str, actor: &str) -> Result<Progress> {
        let now = chrono::Utc::now().timestamp_millis();
        let patch = ProgressPatch {
            archived: Some(true),
            updated_at: Some(now),
            ..Default::default()
        };
        self.mutate("archive_progress", actor, |tx, ctx| {
            let updated = patch_progress(tx, id, &patch)?;
            ctx.record(Entity::Progress, id, Change::Archived);
            Ok(updated)
        })
    }

    /// Reactivate an archived record: back to p0, count and streak 0,
    /// assignment cleared, due `today`. `best_streak` is kept.
    ///
    /// When `alias` is given it is created in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist, another active record
    /// exists for the pair, or the update fails.
    pub fn reactivate_progress(
        &mut self,
        id: &str,
        today: NaiveDate,
        alias: Option<&Alias>,
        actor: &str,
    ) -> Result<Progress> {
        let patch = ProgressPatch::reactivation(today, chrono::Utc::now().timestamp_millis());
        self.mutate("reactivate_progress", actor, |tx, ctx| {
            let updated = patch_progress(tx, id, &patch)?;
            if let Some(alias) = alias {
                if insert_alias_if_absent(tx, alias)? {
                    ctx.record(Entity::Alias, &alias.id, Change::Created);
                }
            }
            ctx.record(Entity::Progress, id, Change::Reactivated);
            Ok(updated)
        })
    }

    /// Create a progress record for an existing item, plus an alias.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; nothing is applied in that case.
    pub fn create_progress_with_alias(
        &mut self,
        progress: &Progress,
        alias: Option<&Alias>,
        actor: &str,
    ) -> Result<()> {
        self.mutate("create_progress", actor, |tx, ctx| {
            insert_progress(tx, progress)?;
            if let Some(alias) = alias {
                if insert_alias_if_absent(tx, alias)? {
                    ctx.record(Entity::Alias, &alias.id, Change::Created);
                }
            }
            ctx.record(Entity::Progress, &progress.id, Change::Created);
            Ok(())
        })
    }

    /// Create an item, its alias, and a progress record as one unit.
    ///
    /// If an item with the same identity already exists locally it is
    /// reused and the progress is attached to it; the returned item is the
    /// one actually stored.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is applied in that case.
    pub fn create_item_with_progress(
        &mut self,
        item: &Item,
        alias: Option<&Alias>,
        progress: &Progress,
        actor: &str,
    ) -> Result<(Item, Progress)> {
        self.mutate("create_item_with_progress", actor, |tx, ctx| {
            let stored = match find_item_by_key_tx(tx, &item.key())? {
                Some(existing) => existing,
                None => {
                    insert_item(tx, item)?;
                    ctx.record(Entity::Item, &item.id, Change::Created);
                    item.clone()
                }
            };

            let mut progress = progress.clone();
            progress.item_id.clone_from(&stored.id);
            insert_progress(tx, &progress)?;
            ctx.record(Entity::Progress, &progress.id, Change::Created);

            if let Some(alias) = alias {
                let alias = Alias {
                    item_id: stored.id.clone(),
                    ..alias.clone()
                };
                if insert_alias_if_absent(tx, &alias)? {
                    ctx.record(Entity::Alias, &alias.id, Change::Created);
                }
            }

            Ok((stored, progress))
        })
    }

    /// Append a review event and apply the scheduling patch it produced,
    /// as one unit.
    ///
    /// # Errors
    ///
    /// Returns an error if either write fails; nothing is applied in that case.
    pub fn record_review(
        &mut self,
        event: &ReviewEvent,
        patch: &ProgressPatch,
        actor: &str,
    ) -> Result<Progress> {
        self.mutate("record_review", actor, |tx, ctx| {
            insert_review_event(tx, event)?;
            let updated = patch_progress(tx, &event.progress_id, patch)?;
            let outcome = if event.succeeded { "passed" } else { "failed" };
            ctx.record_detail(Entity::Progress, &event.progress_id, Change::Reviewed, outcome);
            Ok(updated)
        })
    }

    /// Append a review event on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn append_review_event(&mut self, event: &ReviewEvent, actor: &str) -> Result<()> {
        self.mutate("append_review_event", actor, |tx, ctx| {
            insert_review_event(tx, event)?;
            ctx.record(Entity::Review, &event.id, Change::Created);
            Ok(())
        })
    }

    /// Apply a merge patch produced by conflict resolution, recording one
    /// audit comment per overridden field.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist or the update fails.
    pub fn apply_merge(
        &mut self,
        id: &str,
        patch: &ProgressPatch,
        conflicts: &[String],
        actor: &str,
    ) -> Result<Progress> {
        self.mutate("apply_merge", actor, |tx, ctx| {
            let updated = patch_progress(tx, id, patch)?;
            for conflict in conflicts {
                ctx.record_detail(Entity::Progress, id, Change::Merged, conflict);
            }
            Ok(updated)
        })
    }

    /// Mirror a remote progress row (and its item, if new) locally.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is applied in that case.
    pub fn mirror_remote_progress(&mut self, item: &Item, progress: &Progress, actor: &str) -> Result<Progress> {
        self.mutate("mirror_remote_progress", actor, |tx, ctx| {
            let stored = match find_item_by_key_tx(tx, &item.key())? {
                Some(existing) => existing,
                None => {
                    insert_item(tx, item)?;
                    ctx.record(Entity::Item, &item.id, Change::Created);
                    item.clone()
                }
            };
            let mut progress = progress.clone();
            progress.item_id = stored.id;
            insert_progress(tx, &progress)?;
            ctx.record(Entity::Progress, &progress.id, Change::Mirrored);
            Ok(progress)
        })
    }

    /// Audit trail of one progress record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn progress_history(&self, progress_id: &str, limit: u32) -> Result<Vec<AuditEntry>> {
        Ok(events::history(&self.conn, Entity::Progress, progress_id, limit)?)
    }

    /// List an owner's progress records with their items.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_progress(&self, owner_id: &str, include_archived: bool) -> Result<Vec<DueEntry>> {
        let sql = format!(
            "SELECT {}, {} FROM progress p JOIN items i ON i.id = p.item_id
             WHERE p.owner_id = ?1 AND (?2 OR p.archived = 0)
             ORDER BY p.next_due_date ASC, i.canonical_reference ASC",
            prefixed("p", PROGRESS_COLUMNS),
            prefixed("i", ITEM_COLUMNS)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![owner_id, include_archived], map_entry_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Non-archived progress due on or before `today`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn due_progress(&self, owner_id: &str, today: NaiveDate) -> Result<Vec<DueEntry>> {
        let sql = format!(
            "SELECT {}, {} FROM progress p JOIN items i ON i.id = p.item_id
             WHERE p.owner_id = ?1 AND p.archived = 0 AND p.next_due_date <= ?2
             ORDER BY p.next_due_date ASC, p.phase ASC",
            prefixed("p", PROGRESS_COLUMNS),
            prefixed("i", ITEM_COLUMNS)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![owner_id, format_date(today)], map_entry_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Progress rows updated strictly after `since` (Unix ms), oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn progress_updated_since(&self, owner_id: &str, since: i64) -> Result<Vec<Progress>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress
             WHERE owner_id = ?1 AND updated_at > ?2
             ORDER BY updated_at ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![owner_id, since], map_progress_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Assignments of the owner's non-archived progress in `phase`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn assignments_in_phase(&self, owner_id: &str, phase: Phase) -> Result<Vec<Assignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT assigned_weekday, assigned_week_parity, assigned_day_of_month
             FROM progress
             WHERE owner_id = ?1 AND phase = ?2 AND archived = 0",
        )?;
        let rows = stmt.query_map(rusqlite::params![owner_id, phase.as_str()], |row| {
            Ok(Assignment {
                weekday: row.get(0)?,
                week_parity: row.get(1)?,
                day_of_month: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Counts for the status view.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn owner_counts(&self, owner_id: &str, today: NaiveDate) -> Result<OwnerCounts> {
        let count = |sql: &str, params: &[&dyn rusqlite::ToSql]| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, params, |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        let today = format_date(today);

        Ok(OwnerCounts {
            active: count(
                "SELECT COUNT(*) FROM progress WHERE owner_id = ?1 AND archived = 0",
                &[&owner_id],
            )?,
            archived: count(
                "SELECT COUNT(*) FROM progress WHERE owner_id = ?1 AND archived = 1",
                &[&owner_id],
            )?,
            due_today: count(
                "SELECT COUNT(*) FROM progress WHERE owner_id = ?1 AND archived = 0 AND next_due_date <= ?2",
                &[&owner_id, &today],
            )?,
            unverified_items: self.unverified_items_for_owner(owner_id)?.len(),
            review_events: count(
                "SELECT COUNT(*) FROM review_events WHERE owner_id = ?1",
                &[&owner_id],
            )?,
        })
    }

    // =======================
    // Review Event Operations
    // =======================

    /// Review events created strictly after `since` (Unix ms), oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn review_events_since(&self, owner_id: &str, since: i64) -> Result<Vec<ReviewEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_events
             WHERE owner_id = ?1 AND created_at > ?2
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![owner_id, since], map_review_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// All review events for one progress record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn review_events_for_progress(&self, progress_id: &str) -> Result<Vec<ReviewEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_events
             WHERE progress_id = ?1
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([progress_id], map_review_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // ==========
    // Sync State
    // ==========

    /// Read the watermark for one direction (Unix ms).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_watermark(&self, owner_id: &str, direction: Direction) -> Result<Option<i64>> {
        let watermark = self
            .conn
            .query_row(
                "SELECT watermark FROM sync_state WHERE owner_id = ?1 AND direction = ?2",
                rusqlite::params![owner_id, direction.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(watermark)
    }

    /// Advance the watermark for one direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn set_watermark(&mut self, owner_id: &str, direction: Direction, watermark: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO sync_state (owner_id, direction, watermark, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id, direction) DO UPDATE SET
               watermark = excluded.watermark,
               updated_at = excluded.updated_at",
            rusqlite::params![owner_id, direction.as_str(), watermark, now],
        )?;
        Ok(())
    }

    // ===========================================
    // Queue Storage (used only by sync::BatchQueue)
    // ===========================================

    pub(crate) fn queue_insert(&mut self, op: &QueuedOperation) -> Result<()> {
        let payload = serde_json::to_string(&op.operation)?;
        self.conn.execute(
            "INSERT INTO queued_operations (id, owner_id, kind, payload, queued_at, retry_count, status, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                op.id,
                op.owner_id,
                op.operation.kind(),
                payload,
                op.queued_at,
                op.retry_count,
                op.status.as_str(),
                op.last_error,
            ],
        )?;
        Ok(())
    }

    /// Claim pending operations, oldest first, by moving them to `processing`
    /// in one transaction.
    pub(crate) fn queue_claim_pending(&mut self, owner_id: &str, limit: usize) -> Result<Vec<QueuedOperation>> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let claimed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queued_operations
                 WHERE owner_id = ?1 AND status = 'pending'
                 ORDER BY queued_at ASC, rowid ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![owner_id, i64::try_from(limit).unwrap_or(i64::MAX)],
                map_queue_row,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for op in &claimed {
            tx.execute(
                "UPDATE queued_operations SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
                [&op.id],
            )?;
        }
        tx.commit()?;

        Ok(claimed
            .into_iter()
            .map(|mut op| {
                op.status = QueueStatus::Processing;
                op
            })
            .collect())
    }

    pub(crate) fn queue_delete(&mut self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM queued_operations WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        self.conn.execute(&sql, params.as_slice())?;
        Ok(())
    }

    /// Return a claimed operation to the queue after a failure, or mark it
    /// permanently failed once `max_retries` is exceeded. Returns the new status.
    pub(crate) fn queue_release_failed(
        &mut self,
        id: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<QueueStatus> {
        let retry_count: u32 = self.conn.query_row(
            "SELECT retry_count FROM queued_operations WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let retry_count = retry_count + 1;
        let status = if retry_count > max_retries {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };
        self.conn.execute(
            "UPDATE queued_operations SET retry_count = ?1, status = ?2, last_error = ?3 WHERE id = ?4",
            rusqlite::params![retry_count, status.as_str(), error, id],
        )?;
        Ok(status)
    }

    /// Put operations left in `processing` by an interrupted flush back to `pending`.
    pub(crate) fn queue_reset_processing(&mut self, owner_id: &str) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE queued_operations SET status = 'pending' WHERE owner_id = ?1 AND status = 'processing'",
            [owner_id],
        )?;
        Ok(n)
    }

    pub(crate) fn queue_list(&self, owner_id: &str) -> Result<Vec<QueuedOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queued_operations
             WHERE owner_id = ?1
             ORDER BY queued_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([owner_id], map_queue_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Drop pending operations queued at or before `through` (Unix ms).
    pub(crate) fn queue_delete_pending_through(&mut self, owner_id: &str, through: i64) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM queued_operations WHERE owner_id = ?1 AND status = 'pending' AND queued_at <= ?2",
            rusqlite::params![owner_id, through],
        )?;
        Ok(n)
    }

    pub(crate) fn queue_clear_failed(&mut self, owner_id: &str) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM queued_operations WHERE owner_id = ?1 AND status = 'failed'",
            [owner_id],
        )?;
        Ok(n)
    }
}

// ==============
// Transaction helpers
// ==============

fn insert_item(conn: &Connection, item: &Item) -> Result<()> {
    conn.execute(
        "INSERT INTO items (id, canonical_reference, body_text, source_translation, verified, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            item.id,
            item.canonical_reference,
            item.body_text,
            item.source_translation,
            item.verified,
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(())
}

fn find_item_by_key_tx(conn: &Connection, key: &ItemKey) -> Result<Option<Item>> {
    let item = conn
        .query_row(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items
                 WHERE canonical_reference = ?1 AND source_translation = ?2"
            ),
            rusqlite::params![key.canonical_reference, key.source_translation],
            map_item_row,
        )
        .optional()?;
    Ok(item)
}

fn insert_alias_if_absent(conn: &Connection, alias: &Alias) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO aliases (id, normalized_key, item_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![alias.id, alias.normalized_key, alias.item_id, alias.created_at],
    )?;
    Ok(inserted > 0)
}

fn insert_progress(conn: &Connection, p: &Progress) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO progress ({PROGRESS_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        rusqlite::params![
            p.id,
            p.owner_id,
            p.item_id,
            p.phase.as_str(),
            p.phase_progress_count,
            p.last_activity_at,
            format_date(p.next_due_date),
            p.assignment.weekday,
            p.assignment.week_parity,
            p.assignment.day_of_month,
            p.archived,
            p.current_streak,
            p.best_streak,
            p.created_at,
            p.updated_at,
        ],
    )?;
    Ok(())
}

/// Read-modify-write of one progress row inside the caller's transaction.
fn patch_progress(conn: &Connection, id: &str, patch: &ProgressPatch) -> Result<Progress> {
    let mut progress = conn
        .query_row(
            &format!("SELECT {PROGRESS_COLUMNS} FROM progress WHERE id = ?1"),
            [id],
            map_progress_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound {
            what: format!("progress {id}"),
        })?;

    progress.apply(patch);
    if patch.updated_at.is_none() {
        progress.updated_at = chrono::Utc::now().timestamp_millis();
    }

    conn.execute(
        "UPDATE progress SET
           phase = ?1,
           phase_progress_count = ?2,
           last_activity_at = ?3,
           next_due_date = ?4,
           assigned_weekday = ?5,
           assigned_week_parity = ?6,
           assigned_day_of_month = ?7,
           archived = ?8,
           current_streak = ?9,
           best_streak = MAX(best_streak, ?10),
           updated_at = ?11
         WHERE id = ?12",
        rusqlite::params![
            progress.phase.as_str(),
            progress.phase_progress_count,
            progress.last_activity_at,
            format_date(progress.next_due_date),
            progress.assignment.weekday,
            progress.assignment.week_parity,
            progress.assignment.day_of_month,
            progress.archived,
            progress.current_streak,
            progress.best_streak,
            progress.updated_at,
            id,
        ],
    )?;

    Ok(progress)
}

fn insert_review_event(conn: &Connection, event: &ReviewEvent) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO review_events ({REVIEW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        rusqlite::params![
            event.id,
            event.owner_id,
            event.progress_id,
            event.succeeded,
            event.counted,
            event.duration_s,
            event.created_at,
        ],
    )?;
    Ok(())
}

// ==============
// Row mapping
// ==============

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn prefixed(alias: &str, columns: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn map_item_row(row: &rusqlite::Row) -> rusqlite::Result<Item> {
    map_item_at(row, 0)
}

fn map_item_at(row: &rusqlite::Row, offset: usize) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(offset)?,
        canonical_reference: row.get(offset + 1)?,
        body_text: row.get(offset + 2)?,
        source_translation: row.get(offset + 3)?,
        verified: row.get(offset + 4)?,
        created_at: row.get(offset + 5)?,
        updated_at: row.get(offset + 6)?,
    })
}

fn map_progress_row(row: &rusqlite::Row) -> rusqlite::Result<Progress> {
    let phase_str: String = row.get(3)?;
    let phase = Phase::parse(&phase_str)
        .ok_or_else(|| conversion_error(3, format!("unknown phase '{phase_str}'")))?;
    let due_str: String = row.get(6)?;
    let next_due_date = NaiveDate::parse_from_str(&due_str, "%Y-%m-%d")
        .map_err(|e| conversion_error(6, format!("bad due date '{due_str}': {e}")))?;

    Ok(Progress {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        item_id: row.get(2)?,
        phase,
        phase_progress_count: row.get(4)?,
        last_activity_at: row.get(5)?,
        next_due_date,
        assignment: Assignment {
            weekday: row.get(7)?,
            week_parity: row.get(8)?,
            day_of_month: row.get(9)?,
        },
        archived: row.get(10)?,
        current_streak: row.get(11)?,
        best_streak: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn map_entry_row(row: &rusqlite::Row) -> rusqlite::Result<DueEntry> {
    Ok(DueEntry {
        progress: map_progress_row(row)?,
        item: map_item_at(row, 15)?,
    })
}

fn map_review_row(row: &rusqlite::Row) -> rusqlite::Result<ReviewEvent> {
    Ok(ReviewEvent {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        progress_id: row.get(2)?,
        succeeded: row.get(3)?,
        counted: row.get(4)?,
        duration_s: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_queue_row(row: &rusqlite::Row) -> rusqlite::Result<QueuedOperation> {
    let payload: String = row.get(2)?;
    let operation: Operation = serde_json::from_str(&payload)
        .map_err(|e| conversion_error(2, format!("bad queued payload: {e}")))?;
    let status: String = row.get(5)?;

    Ok(QueuedOperation {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        operation,
        queued_at: row.get(3)?,
        retry_count: row.get(4)?,
        status: QueueStatus::parse(&status),
        last_error: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seeded() -> (SqliteStorage, Item) {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let item = Item::manual("John 3:16".into(), "For God so loved".into(), "KJV".into());
        storage.create_item(&item, "owner").unwrap();
        (storage, item)
    }

    #[test]
    fn test_open_memory() {
        assert!(SqliteStorage::open_memory().is_ok());
    }

    #[test]
    fn test_find_item_by_reference_or_alias() {
        let (mut storage, item) = seeded();
        storage
            .create_alias_if_absent(&Alias::new("jn 3:16".into(), item.id.clone()), "owner")
            .unwrap();

        let direct = storage
            .find_item_by_reference_or_alias("john 3:16", "john 3:16", "KJV")
            .unwrap();
        assert_eq!(direct.map(|i| i.id), Some(item.id.clone()));

        let aliased = storage
            .find_item_by_reference_or_alias("Jn 3:16", "jn 3:16", "KJV")
            .unwrap();
        assert_eq!(aliased.map(|i| i.id), Some(item.id.clone()));

        let other_translation = storage
            .find_item_by_reference_or_alias("jn 3:16", "jn 3:16", "ESV")
            .unwrap();
        assert!(other_translation.is_none());
    }

    #[test]
    fn test_alias_created_once() {
        let (mut storage, item) = seeded();
        assert!(storage
            .create_alias_if_absent(&Alias::new("jn 3:16".into(), item.id.clone()), "owner")
            .unwrap());
        assert!(!storage
            .create_alias_if_absent(&Alias::new("jn 3:16".into(), item.id.clone()), "owner")
            .unwrap());
    }

    #[test]
    fn test_progress_roundtrip_and_patch() {
        let (mut storage, item) = seeded();
        let progress = Progress::new("owner", &item.id, date(2024, 6, 1));
        storage.create_progress(&progress, "owner").unwrap();

        let patch = ProgressPatch {
            phase: Some(Phase::P1),
            assignment: Some(Assignment {
                weekday: Some(3),
                ..Default::default()
            }),
            next_due_date: Some(date(2024, 6, 6)),
            best_streak: Some(4),
            ..Default::default()
        };
        let updated = storage.update_progress(&progress.id, &patch, "owner").unwrap();
        assert_eq!(updated.phase, Phase::P1);

        let stored = storage.get_progress(&progress.id).unwrap().unwrap();
        assert_eq!(stored, updated);
        assert_eq!(stored.assignment.weekday, Some(3));
        assert_eq!(stored.next_due_date, date(2024, 6, 6));
        assert_eq!(stored.best_streak, 4);
    }

    #[test]
    fn test_second_active_progress_rejected() {
        let (mut storage, item) = seeded();
        storage
            .create_progress(&Progress::new("owner", &item.id, date(2024, 6, 1)), "owner")
            .unwrap();
        let second = storage.create_progress(&Progress::new("owner", &item.id, date(2024, 6, 1)), "owner");
        assert!(second.is_err());

        // A different owner is independent
        assert!(storage
            .create_progress(&Progress::new("other", &item.id, date(2024, 6, 1)), "other")
            .is_ok());
    }

    #[test]
    fn test_archive_and_reactivate() {
        let (mut storage, item) = seeded();
        let mut progress = Progress::new("owner", &item.id, date(2024, 1, 1));
        progress.phase = Phase::P2;
        progress.current_streak = 4;
        progress.best_streak = 7;
        storage.create_progress(&progress, "owner").unwrap();

        storage.archive_progress(&progress.id, "owner").unwrap();
        assert!(storage.find_active_progress("owner", &item.id).unwrap().is_none());
        let current = storage.find_current_progress("owner", &item.id).unwrap().unwrap();
        assert!(current.archived);

        let alias = Alias::new("jn 3:16".into(), item.id.clone());
        let reactivated = storage
            .reactivate_progress(&progress.id, date(2024, 6, 10), Some(&alias), "owner")
            .unwrap();
        assert_eq!(reactivated.phase, Phase::P0);
        assert_eq!(reactivated.current_streak, 0);
        assert_eq!(reactivated.best_streak, 7);
        assert_eq!(reactivated.next_due_date, date(2024, 6, 10));

        let trail = storage.progress_history(&progress.id, 10).unwrap();
        let changes: Vec<Change> = trail.iter().map(|e| e.change).collect();
        assert_eq!(changes, vec![Change::Created, Change::Archived, Change::Reactivated]);
    }

    #[test]
    fn test_create_item_with_progress_rolls_back_on_failure() {
        let (mut storage, item) = seeded();
        let existing = Progress::new("owner", &item.id, date(2024, 6, 1));
        storage.create_progress(&existing, "owner").unwrap();

        // Same identity as the stored item, so the new progress clashes with the active one
        let clone_item = Item::manual("John 3:16".into(), "text".into(), "KJV".into());
        let alias = Alias::new("john3:16".into(), clone_item.id.clone());
        let result = storage.create_item_with_progress(
            &clone_item,
            Some(&alias),
            &Progress::new("owner", &clone_item.id, date(2024, 6, 1)),
            "owner",
        );
        assert!(result.is_err());

        let aliases: i64 = storage
            .conn()
            .query_row("SELECT COUNT(*) FROM aliases", [], |row| row.get(0))
            .unwrap();
        assert_eq!(aliases, 0);
    }

    #[test]
    fn test_record_review_is_atomic() {
        let (mut storage, item) = seeded();
        let progress = Progress::new("owner", &item.id, date(2024, 6, 1));
        storage.create_progress(&progress, "owner").unwrap();

        let orphan = ReviewEvent::new("owner", "missing_progress", true, true, None);
        let result = storage.record_review(&orphan, &ProgressPatch::default(), "owner");
        assert!(result.is_err());
        assert!(storage.review_events_for_progress("missing_progress").unwrap().is_empty());

        let event = ReviewEvent::new("owner", &progress.id, true, true, Some(42));
        let patch = ProgressPatch {
            phase_progress_count: Some(1),
            current_streak: Some(1),
            best_streak: Some(1),
            ..Default::default()
        };
        let updated = storage.record_review(&event, &patch, "owner").unwrap();
        assert_eq!(updated.phase_progress_count, 1);
        let events = storage.review_events_for_progress(&progress.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration_s, Some(42));
    }

    #[test]
    fn test_due_progress_and_assignments() {
        let (mut storage, item) = seeded();
        let other = Item::manual("Psalm 23:1".into(), "The Lord is my shepherd".into(), "KJV".into());
        storage.create_item(&other, "owner").unwrap();

        let due = Progress::new("owner", &item.id, date(2024, 6, 1));
        let mut later = Progress::new("owner", &other.id, date(2024, 6, 20));
        later.phase = Phase::P1;
        later.assignment.weekday = Some(4);
        storage.create_progress(&due, "owner").unwrap();
        storage.create_progress(&later, "owner").unwrap();

        let entries = storage.due_progress("owner", date(2024, 6, 10)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].item.canonical_reference, "John 3:16");

        let weekly = storage.assignments_in_phase("owner", Phase::P1).unwrap();
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].weekday, Some(4));

        let counts = storage.owner_counts("owner", date(2024, 6, 10)).unwrap();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.due_today, 1);
        assert_eq!(counts.unverified_items, 2);
    }

    #[test]
    fn test_watermarks() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        assert_eq!(storage.get_watermark("owner", Direction::Push).unwrap(), None);
        storage.set_watermark("owner", Direction::Push, 100).unwrap();
        storage.set_watermark("owner", Direction::Push, 200).unwrap();
        assert_eq!(storage.get_watermark("owner", Direction::Push).unwrap(), Some(200));
        assert_eq!(storage.get_watermark("owner", Direction::Pull).unwrap(), None);
    }

    #[test]
    fn test_mark_item_verified() {
        let (mut storage, item) = seeded();
        storage
            .mark_item_verified(&item.id, "John 3:16", "For God so loved the world", "owner")
            .unwrap();
        let stored = storage.get_item(&item.id).unwrap().unwrap();
        assert!(stored.verified);
        assert_eq!(stored.body_text, "For God so loved the world");
        assert!(storage.mark_item_verified("nope", "x", "y", "owner").is_err());
    }
}
