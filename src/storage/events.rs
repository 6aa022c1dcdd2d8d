//! Audit trail of local mutations.
//!
//! Every write through [`super::SqliteStorage::mutate`] appends entries here
//! in the same transaction, so `recall history` can show how a progress
//! record reached its current state, including which fields a sync merge
//! took from the remote.

use rusqlite::{Connection, Result};
use serde::Serialize;

/// Kind of record an audit entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Item,
    Alias,
    Progress,
    Review,
}

impl Entity {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Alias => "alias",
            Self::Progress => "progress",
            Self::Review => "review",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "item" => Some(Self::Item),
            "alias" => Some(Self::Alias),
            "progress" => Some(Self::Progress),
            "review" => Some(Self::Review),
            _ => None,
        }
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created,
    Verified,
    Updated,
    Archived,
    Reactivated,
    Reviewed,
    /// A sync merge overrode a local field; the detail names it.
    Merged,
    /// Copied verbatim from the remote replica.
    Mirrored,
}

impl Change {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Verified => "verified",
            Self::Updated => "updated",
            Self::Archived => "archived",
            Self::Reactivated => "reactivated",
            Self::Reviewed => "reviewed",
            Self::Merged => "merged",
            Self::Mirrored => "mirrored",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "verified" => Self::Verified,
            "updated" => Self::Updated,
            "archived" => Self::Archived,
            "reactivated" => Self::Reactivated,
            "reviewed" => Self::Reviewed,
            "merged" => Self::Merged,
            "mirrored" => Self::Mirrored,
            _ => return None,
        })
    }
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub entity: Entity,
    pub entity_id: String,
    pub change: Change,
    /// Owner id for user actions, "sync" for merges and mirrors
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Unix milliseconds
    pub at: i64,
}

impl AuditEntry {
    #[must_use]
    pub fn new(entity: Entity, entity_id: &str, change: Change, actor: &str) -> Self {
        Self {
            entity,
            entity_id: entity_id.to_string(),
            change,
            actor: actor.to_string(),
            detail: None,
            at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

/// Append an entry.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn append(conn: &Connection, entry: &AuditEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (entity, entity_id, change, actor, detail, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            entry.entity.as_str(),
            entry.entity_id,
            entry.change.as_str(),
            entry.actor,
            entry.detail,
            entry.at,
        ],
    )?;
    Ok(())
}

/// The most recent `limit` entries for one entity, oldest first.
///
/// Entries written by a newer build with unknown kinds are skipped.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn history(conn: &Connection, entity: Entity, entity_id: &str, limit: u32) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT entity, entity_id, change, actor, detail, at FROM (
             SELECT seq, entity, entity_id, change, actor, detail, at
             FROM audit_log
             WHERE entity = ?1 AND entity_id = ?2
             ORDER BY at DESC, seq DESC
             LIMIT ?3
         ) ORDER BY at, seq",
    )?;

    let rows = stmt.query_map(rusqlite::params![entity.as_str(), entity_id, limit], |row| {
        let entity: String = row.get(0)?;
        let change: String = row.get(2)?;
        let (Some(entity), Some(change)) = (Entity::parse(&entity), Change::parse(&change)) else {
            return Ok(None);
        };
        Ok(Some(AuditEntry {
            entity,
            entity_id: row.get(1)?,
            change,
            actor: row.get(3)?,
            detail: row.get(4)?,
            at: row.get(5)?,
        }))
    })?;

    rows.filter_map(Result::transpose).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::apply_schema;

    #[test]
    fn test_history_is_oldest_first_and_bounded() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        for (at, change) in [(1, Change::Created), (2, Change::Reviewed), (3, Change::Merged)] {
            let mut entry = AuditEntry::new(Entity::Progress, "prog_1", change, "sync");
            entry.at = at;
            append(&conn, &entry.with_detail("best_streak")).unwrap();
        }
        append(&conn, &AuditEntry::new(Entity::Progress, "prog_2", Change::Created, "o1")).unwrap();

        let entries = history(&conn, Entity::Progress, "prog_1", 2).unwrap();
        let changes: Vec<Change> = entries.iter().map(|e| e.change).collect();
        assert_eq!(changes, vec![Change::Reviewed, Change::Merged]);
        assert_eq!(entries[1].detail.as_deref(), Some("best_streak"));
    }

    #[test]
    fn test_history_skips_unknown_kinds() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO audit_log (entity, entity_id, change, actor, at)
             VALUES ('progress', 'prog_1', 'teleported', 'o1', 1)",
            [],
        )
        .unwrap();
        append(&conn, &AuditEntry::new(Entity::Progress, "prog_1", Change::Archived, "o1")).unwrap();

        let entries = history(&conn, Entity::Progress, "prog_1", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].change, Change::Archived);
    }
}
