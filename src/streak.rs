// Streak and calendar helpers
// All timestamps are microseconds since the unix epoch (SpacetimeDB's native unit)

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

/// Hour (UTC) at which a new activity day starts
pub const DAY_RESET_HOUR_UTC: i64 = 0;

const MICROS_PER_HOUR: i64 = 60 * 60 * 1_000_000;

/// Streak thresholds (days) and the multiplier unlocked at each
const STREAK_TIERS: [(u32, f64); 3] = [
    (90, 1.5),
    (30, 1.25),
    (7, 1.1),
];

/// Persisted streak fields of a learner
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreakState {
    pub current: u32,
    pub longest: u32,
    /// None = never active
    pub last_active_micros: Option<i64>,
}

/// Result of recording activity at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreakUpdate {
    pub state: StreakState,
    /// True if this activity started a new streak (first ever or after a gap)
    pub reset: bool,
    /// True if this is the first activity of the day
    pub new_day: bool,
}

/// Calendar day an instant belongs to, after applying the reset hour
pub fn activity_day(micros: i64) -> NaiveDate {
    let shifted = micros.saturating_sub(DAY_RESET_HOUR_UTC * MICROS_PER_HOUR);
    DateTime::<Utc>::from_timestamp_micros(shifted)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

/// Whole activity days from `last` to `current` (0 if same day or backwards)
pub fn days_between(last_micros: i64, current_micros: i64) -> i64 {
    (activity_day(current_micros) - activity_day(last_micros))
        .num_days()
        .max(0)
}

/// Record activity at `now_micros`
pub fn advance_streak(state: StreakState, now_micros: i64) -> StreakUpdate {
    let (current, reset, new_day) = match state.last_active_micros {
        None => (1, true, true),
        Some(last) => match days_between(last, now_micros) {
            0 => (state.current.max(1), false, false),
            1 => (state.current.saturating_add(1), false, true),
            _ => (1, true, true),
        },
    };

    // Out-of-order timestamps never move last_active backwards
    let last_active = match state.last_active_micros {
        Some(last) if last > now_micros => last,
        _ => now_micros,
    };

    StreakUpdate {
        state: StreakState {
            current,
            longest: state.longest.max(current),
            last_active_micros: Some(last_active),
        },
        reset,
        new_day,
    }
}

/// Streak as seen at `now_micros` without recording activity.
/// A streak survives until the end of the day after the last activity.
pub fn current_streak(state: &StreakState, now_micros: i64) -> u32 {
    match state.last_active_micros {
        Some(last) if days_between(last, now_micros) <= 1 => state.current,
        _ => 0,
    }
}

/// Points multiplier for a streak length (1.0 - 1.5)
pub fn streak_multiplier(streak_days: u32) -> f64 {
    STREAK_TIERS
        .iter()
        .find(|(min_days, _)| streak_days >= *min_days)
        .map(|(_, multiplier)| *multiplier)
        .unwrap_or(1.0)
}

/// ISO week label, e.g. "2026-W42"
pub fn week_label(micros: i64) -> String {
    let week = activity_day(micros).iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Display label for the week a rank evaluation running at `micros` closes.
/// The scheduled run fires at the start of a new week, so look back one day.
/// Only a label: run deduplication uses `last_evaluated_until`.
pub fn evaluated_week_label(micros: i64) -> String {
    week_label(micros.saturating_sub(24 * MICROS_PER_HOUR))
}

/// Whether the last activity falls within `window_days` days before `now_micros`
pub fn active_within(last_active_micros: Option<i64>, now_micros: i64, window_days: u32) -> bool {
    let window = i64::from(window_days) * 24 * MICROS_PER_HOUR;
    match last_active_micros {
        Some(last) => now_micros.saturating_sub(last) <= window,
        None => false,
    }
}

/// Start of the next week (Monday at the reset hour), strictly after `micros`
pub fn next_week_start_micros(micros: i64) -> i64 {
    let day = activity_day(micros);
    let days_to_monday = 7 - u64::from(day.weekday().num_days_from_monday());
    let monday = day
        .checked_add_days(Days::new(days_to_monday))
        .unwrap_or(NaiveDate::MAX);
    monday
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_micros())
        .unwrap_or(i64::MAX)
        .saturating_add(DAY_RESET_HOUR_UTC * MICROS_PER_HOUR)
}

/// Start of the week (Monday at the reset hour) containing `micros`
pub fn week_start_micros(micros: i64) -> i64 {
    next_week_start_micros(micros).saturating_sub(7 * 24 * MICROS_PER_HOUR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * MICROS_PER_HOUR;

    /// 2026-10-19 00:00 UTC (a Monday)
    fn monday() -> i64 {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    #[test]
    fn test_first_activity_starts_streak() {
        let update = advance_streak(StreakState::default(), monday());
        assert_eq!(update.state.current, 1);
        assert_eq!(update.state.longest, 1);
        assert!(update.reset);
        assert!(update.new_day);
    }

    #[test]
    fn test_same_day_keeps_streak() {
        let state = StreakState { current: 4, longest: 9, last_active_micros: Some(monday()) };
        let update = advance_streak(state, monday() + 5 * MICROS_PER_HOUR);
        assert_eq!(update.state.current, 4);
        assert_eq!(update.state.longest, 9);
        assert!(!update.new_day);
    }

    #[test]
    fn test_next_day_extends_streak() {
        let state = StreakState { current: 6, longest: 6, last_active_micros: Some(monday() + 23 * MICROS_PER_HOUR) };
        let update = advance_streak(state, monday() + DAY + MICROS_PER_HOUR);
        assert_eq!(update.state.current, 7);
        assert_eq!(update.state.longest, 7);
        assert!(!update.reset);
    }

    #[test]
    fn test_gap_resets_streak() {
        let state = StreakState { current: 12, longest: 12, last_active_micros: Some(monday()) };
        let update = advance_streak(state, monday() + 2 * DAY);
        assert_eq!(update.state.current, 1);
        assert_eq!(update.state.longest, 12);
        assert!(update.reset);
    }

    #[test]
    fn test_current_streak_decays_after_missed_day() {
        let state = StreakState { current: 5, longest: 5, last_active_micros: Some(monday()) };
        assert_eq!(current_streak(&state, monday() + DAY), 5);
        assert_eq!(current_streak(&state, monday() + 2 * DAY), 0);
        assert_eq!(current_streak(&StreakState::default(), monday()), 0);
    }

    #[test]
    fn test_streak_multiplier_thresholds() {
        assert_eq!(streak_multiplier(0), 1.0);
        assert_eq!(streak_multiplier(6), 1.0);
        assert_eq!(streak_multiplier(7), 1.1);
        assert_eq!(streak_multiplier(29), 1.1);
        assert_eq!(streak_multiplier(30), 1.25);
        assert_eq!(streak_multiplier(89), 1.25);
        assert_eq!(streak_multiplier(90), 1.5);
        assert_eq!(streak_multiplier(400), 1.5);
    }

    #[test]
    fn test_week_label() {
        assert_eq!(week_label(monday()), "2026-W43");
        // Sunday belongs to the previous ISO week
        assert_eq!(week_label(monday() - MICROS_PER_HOUR), "2026-W42");
    }

    #[test]
    fn test_evaluated_week_looks_back_one_day() {
        // A run at Monday 00:00 closes the week that just ended
        assert_eq!(evaluated_week_label(monday()), "2026-W42");
        // A manual run mid-week closes the current week
        assert_eq!(evaluated_week_label(monday() + 3 * DAY), "2026-W43");
    }

    #[test]
    fn test_active_within_window() {
        let now = monday() + 7 * DAY;
        assert!(active_within(Some(monday()), now, 7));
        assert!(!active_within(Some(monday() - 1), now, 7));
        assert!(!active_within(None, now, 7));
    }

    #[test]
    fn test_week_start() {
        assert_eq!(week_start_micros(monday()), monday());
        assert_eq!(week_start_micros(monday() + 2 * DAY + 7), monday());
        assert_eq!(week_start_micros(monday() - MICROS_PER_HOUR), monday() - 7 * DAY);
    }

    #[test]
    fn test_next_week_start() {
        assert_eq!(next_week_start_micros(monday()), monday() + 7 * DAY);
        assert_eq!(next_week_start_micros(monday() - MICROS_PER_HOUR), monday());
        assert_eq!(next_week_start_micros(monday() + 3 * DAY + 5), monday() + 7 * DAY);
    }
}
