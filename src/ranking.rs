// Weekly rank evaluation rules
// Zones come from weekly standings; a learner moves at most one tier per run

use spacetimedb::SpacetimeType;
use std::collections::BTreeMap;

use crate::streak::{active_within, current_streak, week_start_micros, StreakState};

/// Last standing position in the promotion zone
pub const DEFAULT_PROMOTION_CUTOFF: u32 = 10;
/// Last standing position in the safe zone (everything below is demotion)
pub const DEFAULT_SAFE_CUTOFF: u32 = 50;
/// Weeks a new learner is protected from demotion
pub const DEFAULT_IMMUNITY_WEEKS: u8 = 2;
/// A learner counts as active if seen within this many days of the run
pub const DEFAULT_ACTIVE_WINDOW_DAYS: u32 = 7;

/// Rank ladder, lowest first
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RankTier {
    Bronze,
    Silver,
    Gold,
    Diamond,
    Legendary,
}

impl RankTier {
    pub const ALL: [RankTier; 5] = [
        RankTier::Bronze,
        RankTier::Silver,
        RankTier::Gold,
        RankTier::Diamond,
        RankTier::Legendary,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RankTier::Bronze => "bronze",
            RankTier::Silver => "silver",
            RankTier::Gold => "gold",
            RankTier::Diamond => "diamond",
            RankTier::Legendary => "legendary",
        }
    }

    pub fn from_name(name: &str) -> Option<RankTier> {
        RankTier::ALL
            .iter()
            .copied()
            .find(|tier| tier.name().eq_ignore_ascii_case(name.trim()))
    }

    fn index(&self) -> usize {
        *self as usize
    }

    /// One tier up, or None at the top
    pub fn promoted(&self) -> Option<RankTier> {
        RankTier::ALL.get(self.index() + 1).copied()
    }

    /// One tier down, or None at the bottom
    pub fn demoted(&self) -> Option<RankTier> {
        self.index().checked_sub(1).map(|i| RankTier::ALL[i])
    }
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Promotion,
    Safe,
    Demotion,
}

impl Zone {
    pub fn name(&self) -> &'static str {
        match self {
            Zone::Promotion => "promotion",
            Zone::Safe => "safe",
            Zone::Demotion => "demotion",
        }
    }
}

/// Tunable evaluation rules (overridable through the points_config table)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationRules {
    pub promotion_cutoff: u32,
    pub safe_cutoff: u32,
    pub active_window_days: u32,
}

impl Default for EvaluationRules {
    fn default() -> Self {
        Self {
            promotion_cutoff: DEFAULT_PROMOTION_CUTOFF,
            safe_cutoff: DEFAULT_SAFE_CUTOFF,
            active_window_days: DEFAULT_ACTIVE_WINDOW_DAYS,
        }
    }
}

/// A learner taking part in a weekly evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<Id> {
    pub id: Id,
    pub weekly_points: u32,
    pub total_points: u64,
}

/// Candidate with its 1-based standing position and zone
#[derive(Debug, Clone, PartialEq)]
pub struct Standing<Id> {
    pub candidate: Candidate<Id>,
    pub position: u32,
    pub zone: Zone,
}

/// Why a decision did or did not change the rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Promoted,
    Demoted,
    Safe,
    /// Promotion zone but already at the top tier
    AtTop,
    /// Demotion zone but already at the bottom tier
    AtBottom,
    /// Demotion zone but protected by immunity weeks
    Immune,
    /// Global or per-learner rank freeze
    Frozen,
}

impl DecisionReason {
    pub fn name(&self) -> &'static str {
        match self {
            DecisionReason::Promoted => "promoted",
            DecisionReason::Demoted => "demoted",
            DecisionReason::Safe => "safe",
            DecisionReason::AtTop => "at_top",
            DecisionReason::AtBottom => "at_bottom",
            DecisionReason::Immune => "immune",
            DecisionReason::Frozen => "frozen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankDecision {
    pub from: RankTier,
    pub to: RankTier,
    pub reason: DecisionReason,
}

impl RankDecision {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Zone for a 1-based standing position
pub fn zone_for_position(position: u32, rules: &EvaluationRules) -> Zone {
    if position <= rules.promotion_cutoff {
        Zone::Promotion
    } else if position <= rules.safe_cutoff {
        Zone::Safe
    } else {
        Zone::Demotion
    }
}

/// Order candidates by weekly points (desc), total points (desc), id (asc)
/// and assign positions and zones. Positions are unique: ties are broken,
/// not shared, so zone sizes stay exact.
pub fn order_standings<Id: Ord>(mut candidates: Vec<Candidate<Id>>, rules: &EvaluationRules) -> Vec<Standing<Id>> {
    candidates.sort_by(|a, b| {
        b.weekly_points
            .cmp(&a.weekly_points)
            .then(b.total_points.cmp(&a.total_points))
            .then(a.id.cmp(&b.id))
    });

    candidates
        .into_iter()
        .enumerate()
        .map(|(i, candidate)| {
            let position = (i + 1) as u32;
            Standing {
                candidate,
                position,
                zone: zone_for_position(position, rules),
            }
        })
        .collect()
}

/// Rank outcome for one learner in one weekly run
pub fn decide(current: RankTier, zone: Zone, immunity_weeks: u8, frozen: bool) -> RankDecision {
    let (to, reason) = if frozen {
        (current, DecisionReason::Frozen)
    } else {
        match zone {
            Zone::Promotion => match current.promoted() {
                Some(next) => (next, DecisionReason::Promoted),
                None => (current, DecisionReason::AtTop),
            },
            Zone::Safe => (current, DecisionReason::Safe),
            Zone::Demotion if immunity_weeks > 0 => (current, DecisionReason::Immune),
            Zone::Demotion => match current.demoted() {
                Some(prev) => (prev, DecisionReason::Demoted),
                None => (current, DecisionReason::AtBottom),
            },
        }
    };

    RankDecision { from: current, to, reason }
}

/// Immunity left after taking part in one evaluation
pub fn remaining_immunity(immunity_weeks: u8) -> u8 {
    immunity_weeks.saturating_sub(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    /// Admin-triggered run
    Manual,
}

impl RunTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

/// Whether a run at `now_micros` goes ahead.
/// Scheduled runs always do, so every scheduled week resets weekly points.
/// A manual run is a no-op once any run has closed a period in the current week.
pub fn should_run(trigger: RunTrigger, last_evaluated_until: Option<i64>, now_micros: i64) -> bool {
    match (trigger, last_evaluated_until) {
        (RunTrigger::Scheduled, _) | (RunTrigger::Manual, None) => true,
        (RunTrigger::Manual, Some(last)) => last < week_start_micros(now_micros),
    }
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    RankPromoted,
    RankDemoted,
    /// Would have been demoted but immunity applied
    DemotionBlocked,
}

/// Notification sent for a decision, if any
pub fn notification_kind(reason: DecisionReason) -> Option<NotificationKind> {
    match reason {
        DecisionReason::Promoted => Some(NotificationKind::RankPromoted),
        DecisionReason::Demoted => Some(NotificationKind::RankDemoted),
        DecisionReason::Immune => Some(NotificationKind::DemotionBlocked),
        DecisionReason::Safe | DecisionReason::AtTop | DecisionReason::AtBottom | DecisionReason::Frozen => None,
    }
}

/// Learner state the weekly evaluation reads
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerSnapshot<Id> {
    pub id: Id,
    pub rank: RankTier,
    pub weekly_points: u32,
    pub total_points: u64,
    pub streak: StreakState,
    pub immunity_weeks: u8,
    pub rank_frozen: bool,
}

/// New learner state after a weekly evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerOutcome<Id> {
    pub id: Id,
    /// Weekly points being closed out (reset to 0 by the run)
    pub weekly_points: u32,
    /// (position, zone); None = inactive this period
    pub placement: Option<(u32, Zone)>,
    pub decision: Option<RankDecision>,
    pub rank: RankTier,
    pub immunity_weeks: u8,
    pub current_streak: u32,
    /// Whether the stored learner row differs from the outcome
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvaluationSummary {
    pub participants: u32,
    pub promoted: u32,
    pub demoted: u32,
    pub immune: u32,
    pub frozen: u32,
    /// Rows that could not be written (filled in by the caller)
    pub failed: u32,
    /// Learners whose non-zero weekly points were reset
    pub reset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPlan<Id> {
    /// One outcome per input learner, in input order
    pub outcomes: Vec<LearnerOutcome<Id>>,
    pub summary: EvaluationSummary,
}

/// Plan a weekly evaluation without touching storage.
/// Active learners are ordered, zoned and decided; they use up one week of
/// immunity. Everyone's weekly points reset and lapsed streaks drop to 0.
pub fn plan_evaluation<Id: Ord + Clone>(
    learners: &[LearnerSnapshot<Id>],
    now_micros: i64,
    rules: &EvaluationRules,
    global_freeze: bool,
) -> EvaluationPlan<Id> {
    let candidates: Vec<Candidate<Id>> = learners
        .iter()
        .filter(|l| active_within(l.streak.last_active_micros, now_micros, rules.active_window_days))
        .map(|l| Candidate {
            id: l.id.clone(),
            weekly_points: l.weekly_points,
            total_points: l.total_points,
        })
        .collect();

    let placements: BTreeMap<Id, (u32, Zone)> = order_standings(candidates, rules)
        .into_iter()
        .map(|s| (s.candidate.id, (s.position, s.zone)))
        .collect();

    let mut summary = EvaluationSummary {
        participants: placements.len() as u32,
        ..Default::default()
    };

    let outcomes = learners
        .iter()
        .map(|l| {
            let placement = placements.get(&l.id).copied();
            let decision = placement
                .map(|(_, zone)| decide(l.rank, zone, l.immunity_weeks, global_freeze || l.rank_frozen));

            if let Some(decision) = decision {
                match decision.reason {
                    DecisionReason::Promoted => summary.promoted += 1,
                    DecisionReason::Demoted => summary.demoted += 1,
                    DecisionReason::Immune => summary.immune += 1,
                    DecisionReason::Frozen => summary.frozen += 1,
                    DecisionReason::Safe | DecisionReason::AtTop | DecisionReason::AtBottom => {}
                }
            }
            if l.weekly_points > 0 {
                summary.reset += 1;
            }

            let rank = decision.map(|d| d.to).unwrap_or(l.rank);
            let immunity_weeks = match placement {
                Some(_) => remaining_immunity(l.immunity_weeks),
                None => l.immunity_weeks,
            };
            let streak = current_streak(&l.streak, now_micros);

            LearnerOutcome {
                id: l.id.clone(),
                weekly_points: l.weekly_points,
                placement,
                decision,
                rank,
                immunity_weeks,
                current_streak: streak,
                changed: rank != l.rank
                    || immunity_weeks != l.immunity_weeks
                    || l.weekly_points > 0
                    || streak != l.streak.current,
            }
        })
        .collect();

    EvaluationPlan { outcomes, summary }
}
