//! Field-level merge of a local and a remote progress record.
//!
//! Each field has its own rule, so concurrent progress made on different
//! devices is combined rather than one whole record replacing the other:
//!
//! | field                                  | rule                                         |
//! |----------------------------------------|----------------------------------------------|
//! | `best_streak`                          | max                                          |
//! | `phase`, `phase_progress_count`        | more advanced phase; if equal, remote only when newer by more than the grace window |
//! | `current_streak`, `last_activity_at`   | side with newer `updated_at`                 |
//! | `next_due_date`                        | earlier date                                 |
//! | `assignment`                           | remote only when newer by more than the grace window, or when the phase came from remote |
//! | `archived`                             | side with newer `updated_at`                 |
//! | `updated_at`                           | max                                          |
//!
//! Ties on `updated_at` keep the local value.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Progress, ProgressPatch};

/// Default grace window: one hour.
pub const DEFAULT_GRACE_WINDOW_MS: i64 = 60 * 60 * 1000;

/// Tunables for conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicy {
    /// Minimum lead (ms) the remote's `updated_at` must have before an
    /// equally valid remote value replaces the local one.
    pub grace_window_ms: i64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            grace_window_ms: DEFAULT_GRACE_WINDOW_MS,
        }
    }
}

/// Result of merging one pair of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Changes to apply to the local record. Empty when local already
    /// holds the merged state.
    pub patch: ProgressPatch,
    /// The merged record (local ids, merged state).
    pub merged: Progress,
    /// One human-readable line per field where the replicas disagreed.
    pub conflicts: Vec<String>,
}

impl Resolution {
    /// Whether the local row needs a write.
    #[must_use]
    pub fn changes_local(&self) -> bool {
        !self.patch.is_empty() || self.patch.updated_at.is_some()
    }
}

/// Merge `remote` into `local`.
///
/// # Errors
///
/// Returns `Error::Conflict` if the merged record breaks a merge
/// guarantee (streak regression or a due date later than either side).
/// That indicates a bug in the rules; the caller should fail this record
/// only.
pub fn resolve(local: &Progress, remote: &Progress, policy: &MergePolicy) -> Result<Resolution> {
    let mut merged = local.clone();
    let mut conflicts = Vec::new();

    let remote_newer = remote.updated_at > local.updated_at;
    let remote_newer_beyond_grace = remote.updated_at - local.updated_at > policy.grace_window_ms;

    // best_streak
    if remote.best_streak != local.best_streak {
        merged.best_streak = local.best_streak.max(remote.best_streak);
        conflicts.push(describe(
            "best_streak",
            &local.best_streak,
            &remote.best_streak,
            merged.best_streak == remote.best_streak,
        ));
    }

    // phase and phase_progress_count travel together
    let take_remote_phase = match remote.phase.cmp(&local.phase) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => remote_newer_beyond_grace,
    };
    if remote.phase != local.phase || remote.phase_progress_count != local.phase_progress_count {
        if take_remote_phase {
            merged.phase = remote.phase;
            merged.phase_progress_count = remote.phase_progress_count;
        }
        conflicts.push(describe(
            "phase",
            &format!("{}/{}", local.phase, local.phase_progress_count),
            &format!("{}/{}", remote.phase, remote.phase_progress_count),
            take_remote_phase,
        ));
    }

    // newer-wins fields
    if remote.current_streak != local.current_streak {
        if remote_newer {
            merged.current_streak = remote.current_streak;
        }
        conflicts.push(describe("current_streak", &local.current_streak, &remote.current_streak, remote_newer));
    }
    if remote.last_activity_at != local.last_activity_at {
        if remote_newer {
            merged.last_activity_at = remote.last_activity_at;
        }
        conflicts.push(describe(
            "last_activity_at",
            &local.last_activity_at,
            &remote.last_activity_at,
            remote_newer,
        ));
    }
    if remote.archived != local.archived {
        if remote_newer {
            merged.archived = remote.archived;
        }
        conflicts.push(describe("archived", &local.archived, &remote.archived, remote_newer));
    }

    // next_due_date: earlier wins
    if remote.next_due_date != local.next_due_date {
        merged.next_due_date = local.next_due_date.min(remote.next_due_date);
        conflicts.push(describe(
            "next_due_date",
            &local.next_due_date,
            &remote.next_due_date,
            merged.next_due_date == remote.next_due_date,
        ));
    }

    // assignment belongs to a phase: follow the phase when it came from remote
    if remote.assignment != local.assignment {
        let take_remote = remote_newer_beyond_grace || (take_remote_phase && remote.phase != local.phase);
        if take_remote {
            merged.assignment = remote.assignment;
        }
        conflicts.push(describe(
            "assignment",
            &format!("{:?}", local.assignment),
            &format!("{:?}", remote.assignment),
            take_remote,
        ));
    }

    merged.updated_at = local.updated_at.max(remote.updated_at);

    check_guarantees(local, remote, &merged)?;

    let patch = diff(local, &merged);
    Ok(Resolution {
        patch,
        merged,
        conflicts,
    })
}

fn describe<T: std::fmt::Display + ?Sized>(field: &str, local: &T, remote: &T, took_remote: bool) -> String {
    if took_remote {
        format!("{field}: local {local} -> remote {remote}")
    } else {
        format!("{field}: kept local {local} over remote {remote}")
    }
}

fn check_guarantees(local: &Progress, remote: &Progress, merged: &Progress) -> Result<()> {
    if merged.best_streak < local.best_streak.max(remote.best_streak) {
        return Err(Error::Conflict {
            record: local.id.clone(),
            message: "merged best_streak regressed".to_string(),
        });
    }
    if merged.next_due_date != local.next_due_date.min(remote.next_due_date) {
        return Err(Error::Conflict {
            record: local.id.clone(),
            message: "merged next_due_date is not the earlier date".to_string(),
        });
    }
    Ok(())
}

/// Patch taking `local` to `merged`.
fn diff(local: &Progress, merged: &Progress) -> ProgressPatch {
    fn changed<T: PartialEq + Copy>(before: T, after: T) -> Option<T> {
        (before != after).then_some(after)
    }

    ProgressPatch {
        phase: changed(local.phase, merged.phase),
        phase_progress_count: changed(local.phase_progress_count, merged.phase_progress_count),
        last_activity_at: changed(local.last_activity_at, merged.last_activity_at),
        next_due_date: changed(local.next_due_date, merged.next_due_date),
        assignment: changed(local.assignment, merged.assignment),
        archived: changed(local.archived, merged.archived),
        current_streak: changed(local.current_streak, merged.current_streak),
        best_streak: changed(local.best_streak, merged.best_streak),
        updated_at: changed(local.updated_at, merged.updated_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Assignment, Phase};
    use chrono::NaiveDate;

    const HOUR: i64 = 60 * 60 * 1000;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(phase: Phase, best: u32, due: NaiveDate, updated_at: i64) -> Progress {
        let mut p = Progress::new("owner", "item", due);
        p.phase = phase;
        p.best_streak = best;
        p.next_due_date = due;
        p.last_activity_at = 0;
        p.updated_at = updated_at;
        p
    }

    #[test]
    fn test_documented_merge_scenario() {
        let local = record(Phase::P1, 5, date(2024, 6, 10), 1_000);
        let remote = record(Phase::P0, 8, date(2024, 6, 8), 2_000);

        let resolution = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert_eq!(resolution.merged.phase, Phase::P1);
        assert_eq!(resolution.merged.best_streak, 8);
        assert_eq!(resolution.merged.next_due_date, date(2024, 6, 8));
        assert_eq!(resolution.patch.phase, None);
        assert_eq!(resolution.patch.best_streak, Some(8));
        assert!(resolution
            .conflicts
            .iter()
            .any(|c| c == "best_streak: local 5 -> remote 8"));
    }

    #[test]
    fn test_equal_phase_within_grace_keeps_local() {
        let mut local = record(Phase::P1, 3, date(2024, 6, 10), 10 * HOUR);
        local.phase_progress_count = 2;
        let mut remote = record(Phase::P1, 3, date(2024, 6, 10), 10 * HOUR + HOUR / 2);
        remote.phase_progress_count = 3;

        let resolution = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert_eq!(resolution.merged.phase_progress_count, 2);

        remote.updated_at = 12 * HOUR;
        let resolution = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert_eq!(resolution.merged.phase_progress_count, 3);
    }

    #[test]
    fn test_assignment_needs_grace_lead() {
        let mut local = record(Phase::P1, 0, date(2024, 6, 10), 10 * HOUR);
        local.assignment = Assignment {
            weekday: Some(1),
            ..Default::default()
        };
        let mut remote = local.clone();
        remote.assignment.weekday = Some(4);
        remote.updated_at = 10 * HOUR + 10;

        let kept = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert_eq!(kept.merged.assignment.weekday, Some(1));

        remote.updated_at = 12 * HOUR;
        let adopted = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert_eq!(adopted.merged.assignment.weekday, Some(4));
    }

    #[test]
    fn test_assignment_follows_adopted_phase() {
        let local = record(Phase::P0, 0, date(2024, 6, 10), 10 * HOUR);
        let mut remote = record(Phase::P1, 0, date(2024, 6, 10), 10 * HOUR);
        remote.assignment.weekday = Some(2);

        let resolution = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert_eq!(resolution.merged.phase, Phase::P1);
        assert_eq!(resolution.merged.assignment.weekday, Some(2));
    }

    #[test]
    fn test_newer_wins_for_streak_and_archived() {
        let mut local = record(Phase::P0, 4, date(2024, 6, 10), 1_000);
        local.current_streak = 4;
        let mut remote = local.clone();
        remote.current_streak = 0;
        remote.archived = true;
        remote.updated_at = 1_001;

        let resolution = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert_eq!(resolution.merged.current_streak, 0);
        assert!(resolution.merged.archived);
        assert_eq!(resolution.merged.best_streak, 4);
        assert_eq!(resolution.merged.updated_at, 1_001);
    }

    #[test]
    fn test_identical_records_need_no_write() {
        let local = record(Phase::P2, 6, date(2024, 6, 10), 5_000);
        let remote = local.clone();
        let resolution = resolve(&local, &remote, &MergePolicy::default()).unwrap();
        assert!(!resolution.changes_local());
        assert!(resolution.conflicts.is_empty());
    }

    #[test]
    fn test_merge_is_stable_when_repeated() {
        let local = record(Phase::P1, 5, date(2024, 6, 10), 1_000);
        let remote = record(Phase::P0, 8, date(2024, 6, 8), 2_000);
        let first = resolve(&local, &remote, &MergePolicy::default()).unwrap();

        let mut merged_remote = first.merged.clone();
        merged_remote.id = remote.id.clone();
        let second = resolve(&first.merged, &merged_remote, &MergePolicy::default()).unwrap();
        assert!(!second.changes_local());
    }
}
