//! Database schema definitions.
//!
//! The base DDL describes the current table shapes and is idempotent.
//! Databases created by older builds are brought forward by the additive
//! migrations in [`super::migrations`], which run right after it.

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the Recall database.
///
/// Timestamps are INTEGER Unix milliseconds; calendar dates
/// (`next_due_date`) are TEXT `YYYY-MM-DD` in the owner's timezone.
pub const SCHEMA_SQL: &str = r#"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Core Tables
-- ====================

-- Items: canonical memorization content, shared across owners
CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    canonical_reference TEXT NOT NULL,
    body_text TEXT NOT NULL,
    source_translation TEXT NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (canonical_reference, source_translation)
);

CREATE INDEX IF NOT EXISTS idx_items_reference ON items(canonical_reference COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_items_unverified ON items(verified) WHERE verified = 0;

-- Aliases: alternate spellings resolving to one item
CREATE TABLE IF NOT EXISTS aliases (
    id TEXT PRIMARY KEY,
    normalized_key TEXT NOT NULL,
    item_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (normalized_key, item_id),
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_aliases_key ON aliases(normalized_key);

-- Progress: one owner's scheduling state for one item
CREATE TABLE IF NOT EXISTS progress (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    phase TEXT NOT NULL DEFAULT 'p0' CHECK (phase IN ('p0', 'p1', 'p2', 'p3')),
    phase_progress_count INTEGER NOT NULL DEFAULT 0,
    last_activity_at INTEGER NOT NULL,
    next_due_date TEXT NOT NULL,
    assigned_weekday INTEGER CHECK (assigned_weekday BETWEEN 0 AND 6),
    assigned_week_parity INTEGER CHECK (assigned_week_parity IN (0, 1)),
    assigned_day_of_month INTEGER CHECK (assigned_day_of_month BETWEEN 1 AND 28),
    archived INTEGER NOT NULL DEFAULT 0,
    current_streak INTEGER NOT NULL DEFAULT 0,
    best_streak INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (item_id) REFERENCES items(id)
);

CREATE INDEX IF NOT EXISTS idx_progress_owner_item ON progress(owner_id, item_id);
CREATE INDEX IF NOT EXISTS idx_progress_owner_updated ON progress(owner_id, updated_at);
CREATE INDEX IF NOT EXISTS idx_progress_owner_due ON progress(owner_id, archived, next_due_date);

-- Review events: append-only
CREATE TABLE IF NOT EXISTS review_events (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    progress_id TEXT NOT NULL,
    succeeded INTEGER NOT NULL,
    counted INTEGER NOT NULL,
    duration_s INTEGER,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (progress_id) REFERENCES progress(id)
);

CREATE INDEX IF NOT EXISTS idx_review_events_owner_created ON review_events(owner_id, created_at);
CREATE INDEX IF NOT EXISTS idx_review_events_progress ON review_events(progress_id);

-- Append-only: reject rewrites of history
CREATE TRIGGER IF NOT EXISTS review_events_no_update
BEFORE UPDATE ON review_events
BEGIN
    SELECT RAISE(ABORT, 'review events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS review_events_no_delete
BEFORE DELETE ON review_events
BEGIN
    SELECT RAISE(ABORT, 'review events are append-only');
END;

-- ====================
-- Sync Tables
-- ====================

-- Queued remote write intents, accessed only through the batch queue
CREATE TABLE IF NOT EXISTS queued_operations (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    queued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_owner_status ON queued_operations(owner_id, status, queued_at);

-- Per-owner, per-direction watermarks
CREATE TABLE IF NOT EXISTS sync_state (
    owner_id TEXT NOT NULL,
    direction TEXT NOT NULL CHECK (direction IN ('push', 'pull')),
    watermark INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (owner_id, direction)
);

-- ====================
-- Audit
-- ====================

-- Local mutation history, shown by `recall history`
CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    change TEXT NOT NULL,
    actor TEXT NOT NULL,
    detail TEXT,
    at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity, entity_id, at);
"#;

/// Apply the schema to the database.
///
/// This uses `execute_batch` to run the entire DDL script.
/// It is idempotent because all statements use `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    super::migrations::run_migrations(conn)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_apply_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("Failed to apply schema");

        let tables = table_names(&conn);
        for expected in [
            "items",
            "aliases",
            "progress",
            "review_events",
            "queued_operations",
            "sync_state",
            "audit_log",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("First apply failed");
        apply_schema(&conn).expect("Second apply failed");
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let fk_enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);
    }

    #[test]
    fn test_one_active_progress_per_owner_item() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO items (id, canonical_reference, body_text, source_translation, created_at, updated_at)
             VALUES ('item1', 'John 3:16', 'text', 'KJV', 0, 0)",
            [],
        )
        .unwrap();

        let insert = |id: &str, archived: i32| {
            conn.execute(
                "INSERT INTO progress (id, owner_id, item_id, last_activity_at, next_due_date, archived, created_at, updated_at)
                 VALUES (?1, 'owner', 'item1', 0, '2024-06-01', ?2, 0, 0)",
                rusqlite::params![id, archived],
            )
        };

        assert!(insert("p_archived", 1).is_ok());
        assert!(insert("p_active", 0).is_ok());
        assert!(insert("p_second_active", 0).is_err());
        assert!(insert("p_second_archived", 1).is_ok());
    }

    #[test]
    fn test_review_events_are_append_only() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO items (id, canonical_reference, body_text, source_translation, created_at, updated_at)
                 VALUES ('item1', 'John 3:16', 'text', 'KJV', 0, 0);
             INSERT INTO progress (id, owner_id, item_id, last_activity_at, next_due_date, created_at, updated_at)
                 VALUES ('prog1', 'owner', 'item1', 0, '2024-06-01', 0, 0);
             INSERT INTO review_events (id, owner_id, progress_id, succeeded, counted, created_at)
                 VALUES ('rev1', 'owner', 'prog1', 1, 1, 0);",
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE review_events SET succeeded = 0 WHERE id = 'rev1'", [])
            .is_err());
        assert!(conn
            .execute("DELETE FROM review_events WHERE id = 'rev1'", [])
            .is_err());
    }
}
