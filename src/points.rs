// Chapter completion points
// Pure arithmetic: callers supply the streak and completion history

use crate::streak::streak_multiplier;

/// Share of base points awarded when a chapter is completed again
pub const DEFAULT_REPEAT_RATE: f64 = 0.30;
/// Bonus for the first completion of a chapter
pub const DEFAULT_FIRST_TIME_RATE: f64 = 0.20;
/// Bonus for a near-perfect quiz
pub const DEFAULT_PERFECT_RATE: f64 = 0.15;
pub const DEFAULT_PERFECT_SCORE: u8 = 95;
/// Bonus for finishing well under the expected time
pub const DEFAULT_SPEED_RATE: f64 = 0.10;
pub const DEFAULT_SPEED_RATIO: f64 = 0.75;

/// Tunable point rules (overridable through the points_config table)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointsRules {
    pub repeat_rate: f64,
    pub first_time_rate: f64,
    pub perfect_rate: f64,
    /// Minimum quiz score (0-100) for the perfect bonus
    pub perfect_score: u8,
    pub speed_rate: f64,
    /// Completion must take less than this fraction of the expected time
    pub speed_ratio: f64,
}

impl Default for PointsRules {
    fn default() -> Self {
        Self {
            repeat_rate: DEFAULT_REPEAT_RATE,
            first_time_rate: DEFAULT_FIRST_TIME_RATE,
            perfect_rate: DEFAULT_PERFECT_RATE,
            perfect_score: DEFAULT_PERFECT_SCORE,
            speed_rate: DEFAULT_SPEED_RATE,
            speed_ratio: DEFAULT_SPEED_RATIO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionInput {
    pub points_per_chapter: f64,
    pub is_first_completion: bool,
    /// None = chapter has no quiz
    pub quiz_score: Option<u8>,
    pub completion_seconds: u32,
    /// 0 = no expected time configured (no speed bonus)
    pub expected_seconds: u32,
    /// Streak length including today's activity
    pub streak_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointsBreakdown {
    pub base: u32,
    pub first_time_bonus: u32,
    pub perfect_bonus: u32,
    pub speed_bonus: u32,
    pub multiplier: f64,
    pub total: u32,
    pub repeat: bool,
}

/// Per-chapter share of a course budget (0 for an empty course)
pub fn points_per_chapter(total_points: u32, chapter_count: u32) -> f64 {
    if chapter_count == 0 {
        return 0.0;
    }
    f64::from(total_points) / f64::from(chapter_count)
}

fn round_points(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.round().min(f64::from(u32::MAX)) as u32
}

fn share(base: u32, rate: f64) -> u32 {
    round_points(f64::from(base) * rate)
}

/// Whether a completion time qualifies for the speed bonus
pub fn is_fast_completion(completion_seconds: u32, expected_seconds: u32, speed_ratio: f64) -> bool {
    expected_seconds > 0 && f64::from(completion_seconds) < f64::from(expected_seconds) * speed_ratio
}

/// Points for one chapter completion
pub fn calculate_chapter_points(input: &CompletionInput, rules: &PointsRules) -> PointsBreakdown {
    let base = round_points(input.points_per_chapter);

    if !input.is_first_completion {
        return PointsBreakdown {
            base,
            first_time_bonus: 0,
            perfect_bonus: 0,
            speed_bonus: 0,
            multiplier: 1.0,
            total: share(base, rules.repeat_rate),
            repeat: true,
        };
    }

    let first_time_bonus = share(base, rules.first_time_rate);

    let perfect_bonus = match input.quiz_score {
        Some(score) if score >= rules.perfect_score => share(base, rules.perfect_rate),
        _ => 0,
    };

    let speed_bonus = if is_fast_completion(input.completion_seconds, input.expected_seconds, rules.speed_ratio) {
        share(base, rules.speed_rate)
    } else {
        0
    };

    let multiplier = streak_multiplier(input.streak_days);
    let subtotal = base
        .saturating_add(first_time_bonus)
        .saturating_add(perfect_bonus)
        .saturating_add(speed_bonus);

    PointsBreakdown {
        base,
        first_time_bonus,
        perfect_bonus,
        speed_bonus,
        multiplier,
        total: round_points(f64::from(subtotal) * multiplier),
        repeat: false,
    }
}
