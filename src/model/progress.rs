//! Progress model: one owner's scheduling state for one item.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Review-frequency tier.
///
/// Ordered from least to most advanced, so `Phase::P2 > Phase::P1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Daily
    P0,
    /// Weekly
    P1,
    /// Biweekly
    P2,
    /// Monthly (terminal)
    P3,
}

impl Phase {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "p0",
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "p0" | "daily" => Some(Self::P0),
            "p1" | "weekly" => Some(Self::P1),
            "p2" | "biweekly" => Some(Self::P2),
            "p3" | "monthly" => Some(Self::P3),
            _ => None,
        }
    }

    /// The phase after this one, or `None` at the terminal phase.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::P0 => Some(Self::P1),
            Self::P1 => Some(Self::P2),
            Self::P2 => Some(Self::P3),
            Self::P3 => None,
        }
    }

    /// Human label used in CLI output.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::P0 => "daily",
            Self::P1 => "weekly",
            Self::P2 => "biweekly",
            Self::P3 => "monthly",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot a progress record is pinned to within its phase.
///
/// Which fields are meaningful depends on the phase: weekly uses `weekday`,
/// biweekly uses `weekday` and `week_parity`, monthly uses `day_of_month`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    /// 0 = Monday .. 6 = Sunday
    pub weekday: Option<u8>,
    /// 0 or 1, counted from a fixed epoch week
    pub week_parity: Option<u8>,
    /// 1..=28
    pub day_of_month: Option<u8>,
}

impl Assignment {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weekday.is_none() && self.week_parity.is_none() && self.day_of_month.is_none()
    }
}

/// A progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub id: String,
    pub owner_id: String,
    pub item_id: String,
    pub phase: Phase,
    /// Successful counted reviews since entering the current phase
    pub phase_progress_count: u32,
    /// Unix milliseconds
    pub last_activity_at: i64,
    pub next_due_date: NaiveDate,
    pub assignment: Assignment,
    pub archived: bool,
    pub current_streak: u32,
    /// Never decreases for the lifetime of the record
    pub best_streak: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Progress {
    /// Create a fresh progress record in phase p0, due on `today`.
    pub fn new(owner_id: &str, item_id: &str, today: NaiveDate) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("prog_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            owner_id: owner_id.to_string(),
            item_id: item_id.to_string(),
            phase: Phase::P0,
            phase_progress_count: 0,
            last_activity_at: now,
            next_due_date: today,
            assignment: Assignment::default(),
            archived: false,
            current_streak: 0,
            best_streak: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether two records carry the same synchronized state.
    ///
    /// Ids, item ids and timestamps other than `last_activity_at` are
    /// excluded: they differ legitimately between replicas.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.phase == other.phase
            && self.phase_progress_count == other.phase_progress_count
            && self.last_activity_at == other.last_activity_at
            && self.next_due_date == other.next_due_date
            && self.assignment == other.assignment
            && self.archived == other.archived
            && self.current_streak == other.current_streak
            && self.best_streak == other.best_streak
    }

    /// Apply a patch in place.
    pub fn apply(&mut self, patch: &ProgressPatch) {
        if let Some(phase) = patch.phase {
            self.phase = phase;
        }
        if let Some(count) = patch.phase_progress_count {
            self.phase_progress_count = count;
        }
        if let Some(at) = patch.last_activity_at {
            self.last_activity_at = at;
        }
        if let Some(due) = patch.next_due_date {
            self.next_due_date = due;
        }
        if let Some(assignment) = patch.assignment {
            self.assignment = assignment;
        }
        if let Some(archived) = patch.archived {
            self.archived = archived;
        }
        if let Some(streak) = patch.current_streak {
            self.current_streak = streak;
        }
        if let Some(best) = patch.best_streak {
            self.best_streak = self.best_streak.max(best);
        }
        if let Some(at) = patch.updated_at {
            self.updated_at = at;
        }
    }
}

/// Partial update to a progress record. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPatch {
    pub phase: Option<Phase>,
    pub phase_progress_count: Option<u32>,
    pub last_activity_at: Option<i64>,
    pub next_due_date: Option<NaiveDate>,
    pub assignment: Option<Assignment>,
    pub archived: Option<bool>,
    pub current_streak: Option<u32>,
    pub best_streak: Option<u32>,
    pub updated_at: Option<i64>,
}

impl ProgressPatch {
    /// True if the patch changes no field other than `updated_at`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.phase_progress_count.is_none()
            && self.last_activity_at.is_none()
            && self.next_due_date.is_none()
            && self.assignment.is_none()
            && self.archived.is_none()
            && self.current_streak.is_none()
            && self.best_streak.is_none()
    }

    /// Patch that restarts a record at p0, due `today`.
    ///
    /// Used both for reactivating an archived record and for re-adding an
    /// item the owner had dropped. `best_streak` is left alone.
    #[must_use]
    pub fn reactivation(today: NaiveDate, now: i64) -> Self {
        Self {
            phase: Some(Phase::P0),
            phase_progress_count: Some(0),
            last_activity_at: Some(now),
            next_due_date: Some(today),
            assignment: Some(Assignment::default()),
            archived: Some(false),
            current_streak: Some(0),
            best_streak: None,
            updated_at: Some(now),
        }
    }
}
