//! Spaced-repetition scheduling.
//!
//! Everything here is a pure function of its inputs: the caller supplies
//! "today" in the owner's timezone and, for phase entry, the assignments
//! already held by the owner's other records. Nothing reads the clock
//! except [`today_in`].

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Assignment, Phase, Progress, ProgressPatch};

/// Monday 1970-01-05, the first Monday after the Unix epoch. Week parity
/// is counted from here so it never depends on a record's own history.
const PARITY_EPOCH: (i32, u32, u32) = (1970, 1, 5);

/// Highest day-of-month slot; every month has a 28th.
pub const MAX_DAY_OF_MONTH: u8 = 28;

/// Successful counted reviews needed to leave each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseThresholds {
    pub p0: u32,
    pub p1: u32,
    pub p2: u32,
}

impl Default for PhaseThresholds {
    fn default() -> Self {
        Self { p0: 7, p1: 4, p2: 4 }
    }
}

impl PhaseThresholds {
    /// Threshold for leaving `phase`; `None` for the terminal phase.
    #[must_use]
    pub const fn for_phase(&self, phase: Phase) -> Option<u32> {
        match phase {
            Phase::P0 => Some(self.p0),
            Phase::P1 => Some(self.p1),
            Phase::P2 => Some(self.p2),
            Phase::P3 => None,
        }
    }
}

/// Current calendar date in the owner's timezone.
#[must_use]
pub fn today_in(offset: &FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(offset).date_naive()
}

/// Calendar date of a Unix-millisecond instant in the owner's timezone.
#[must_use]
pub fn local_date(at_ms: i64, offset: &FixedOffset) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp_millis(at_ms).map(|t| t.with_timezone(offset).date_naive())
}

/// Weekday index, 0 = Monday.
#[must_use]
pub fn weekday_index(date: NaiveDate) -> u8 {
    u8::try_from(date.weekday().num_days_from_monday()).unwrap_or(0)
}

/// Parity (0 or 1) of the week containing `date`, counted from a fixed epoch.
#[must_use]
pub fn week_parity(date: NaiveDate) -> u8 {
    let epoch = NaiveDate::from_ymd_opt(PARITY_EPOCH.0, PARITY_EPOCH.1, PARITY_EPOCH.2)
        .unwrap_or(NaiveDate::MIN);
    let weeks = (date - epoch).num_days().div_euclid(7);
    u8::from(weeks.rem_euclid(2) == 1)
}

/// Next due date for a record in `phase` pinned to `assignment`.
///
/// The result is always strictly after `today`. When the assignment lacks
/// the fields the phase needs, the phase's nominal period is used instead.
#[must_use]
pub fn next_due_date(phase: Phase, assignment: &Assignment, today: NaiveDate) -> NaiveDate {
    match phase {
        Phase::P0 => today + Duration::days(1),
        Phase::P1 => match assignment.weekday {
            Some(weekday) => next_weekday(today, weekday),
            None => today + Duration::days(7),
        },
        Phase::P2 => match (assignment.weekday, assignment.week_parity) {
            (Some(weekday), Some(parity)) => next_weekday_with_parity(today, weekday, parity),
            _ => today + Duration::days(14),
        },
        Phase::P3 => match assignment.day_of_month {
            Some(day) => next_day_of_month(today, day),
            None => today + Duration::days(30),
        },
    }
}

fn next_weekday(today: NaiveDate, weekday: u8) -> NaiveDate {
    let current = i64::from(weekday_index(today));
    let target = i64::from(weekday.min(6));
    let mut ahead = (target - current).rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    today + Duration::days(ahead)
}

fn next_weekday_with_parity(today: NaiveDate, weekday: u8, parity: u8) -> NaiveDate {
    let first = next_weekday(today, weekday);
    if week_parity(first) == parity.min(1) {
        first
    } else {
        first + Duration::days(7)
    }
}

fn next_day_of_month(today: NaiveDate, day: u8) -> NaiveDate {
    let day = u32::from(day.clamp(1, MAX_DAY_OF_MONTH));
    let this_month = today.with_day(day).unwrap_or(today);
    if this_month > today {
        return this_month;
    }
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(today + Duration::days(30))
}

/// Least-occupied slot for a record entering `phase`.
///
/// `existing` holds the assignments of the owner's other non-archived
/// records already in `phase`. Ties go to the lowest slot index. Daily
/// records need no slot.
#[must_use]
pub fn optimal_assignment(phase: Phase, existing: &[Assignment]) -> Assignment {
    match phase {
        Phase::P0 => Assignment::default(),
        Phase::P1 => {
            let mut counts = [0usize; 7];
            for a in existing {
                if let Some(w) = a.weekday.filter(|w| *w < 7) {
                    counts[usize::from(w)] += 1;
                }
            }
            Assignment {
                weekday: Some(least_occupied(&counts)),
                ..Default::default()
            }
        }
        Phase::P2 => {
            let mut counts = [0usize; 14];
            for a in existing {
                if let (Some(w), Some(p)) = (a.weekday, a.week_parity) {
                    if w < 7 && p < 2 {
                        counts[usize::from(w * 2 + p)] += 1;
                    }
                }
            }
            let slot = least_occupied(&counts);
            Assignment {
                weekday: Some(slot / 2),
                week_parity: Some(slot % 2),
                day_of_month: None,
            }
        }
        Phase::P3 => {
            let mut counts = [0usize; MAX_DAY_OF_MONTH as usize];
            for a in existing {
                if let Some(d) = a.day_of_month.filter(|d| (1..=MAX_DAY_OF_MONTH).contains(d)) {
                    counts[usize::from(d - 1)] += 1;
                }
            }
            Assignment {
                day_of_month: Some(least_occupied(&counts) + 1),
                ..Default::default()
            }
        }
    }
}

fn least_occupied(counts: &[usize]) -> u8 {
    let mut best = 0;
    for (slot, count) in counts.iter().enumerate() {
        if *count < counts[best] {
            best = slot;
        }
    }
    // Slot tables are at most 28 entries long
    u8::try_from(best).unwrap_or(0)
}

/// Whether a review on `today` is eligible to advance phase progress.
#[must_use]
pub fn is_counted(progress: &Progress, today: NaiveDate) -> bool {
    !progress.archived && progress.next_due_date <= today
}

/// Outcome of one review, as the scheduler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub succeeded: bool,
    pub counted: bool,
}

/// Compute the patch a review produces.
///
/// - counted success: count and streak advance; on reaching the phase
///   threshold the record moves to the next phase with a fresh assignment
///   taken from `next_phase_assignments`, and the count resets.
/// - success that was not counted: only activity is touched.
/// - failure: count and current streak reset, phase and assignment stay,
///   and the due date moves one day past the later of today and the
///   current due date.
#[must_use]
pub fn review_transition(
    progress: &Progress,
    outcome: ReviewOutcome,
    today: NaiveDate,
    now: i64,
    thresholds: &PhaseThresholds,
    next_phase_assignments: &[Assignment],
) -> ProgressPatch {
    let mut patch = ProgressPatch {
        last_activity_at: Some(now),
        updated_at: Some(now),
        ..Default::default()
    };

    if !outcome.succeeded {
        patch.phase_progress_count = Some(0);
        patch.current_streak = Some(0);
        patch.next_due_date = Some(progress.next_due_date.max(today) + Duration::days(1));
        return patch;
    }

    if !outcome.counted {
        return patch;
    }

    let count = progress.phase_progress_count + 1;
    let streak = progress.current_streak + 1;
    patch.current_streak = Some(streak);
    patch.best_streak = Some(progress.best_streak.max(streak));

    let advance_to = thresholds
        .for_phase(progress.phase)
        .filter(|threshold| count >= *threshold)
        .and_then(|_| progress.phase.next());

    match advance_to {
        Some(next) => {
            let assignment = optimal_assignment(next, next_phase_assignments);
            patch.phase = Some(next);
            patch.phase_progress_count = Some(0);
            patch.next_due_date = Some(next_due_date(next, &assignment, today));
            patch.assignment = Some(assignment);
        }
        None => {
            patch.phase_progress_count = Some(count);
            patch.next_due_date = Some(next_due_date(progress.phase, &progress.assignment, today));
        }
    }

    patch
}
