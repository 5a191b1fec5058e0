use spacetimedb::{
    ReducerContext, Identity, Table, Timestamp, ScheduleAt,
    table, reducer, view,
    client_visibility_filter, Filter,
};
use serde_json::json;
use std::collections::HashMap;

mod leaderboard;
mod points;
mod ranking;
mod streak;

// Import bulk restore reducers for disaster recovery
mod restore;

use leaderboard::{rank_rows, Board, BoardRow, LEADERBOARD_SIZE};
use points::{calculate_chapter_points, points_per_chapter, CompletionInput, PointsRules};
use ranking::{
    notification_kind, plan_evaluation, should_run, EvaluationRules, LearnerOutcome, LearnerSnapshot,
    NotificationKind, RankTier, RunTrigger, Zone,
};
use streak::{advance_streak, evaluated_week_label, next_week_start_micros, StreakState};

// ==================== CONSTANTS ====================

/// Singleton row id of points_config
const CONFIG_ID: u32 = 0;

const MAX_NAME_LEN: usize = 32;

const MAX_QUIZ_SCORE: u8 = 100;

// ==================== HELPER FUNCTIONS ====================

/// Short identity prefix for logs
fn short_id(identity: &Identity) -> String {
    let hex = identity.to_string();
    hex[..8.min(hex.len())].to_string()
}

fn micros(ts: Timestamp) -> i64 {
    ts.to_micros_since_unix_epoch()
}

fn is_admin(ctx: &ReducerContext) -> bool {
    ctx.db.admin().identity().find(&ctx.sender).is_some()
}

/// Reject callers that are not in the admin table
fn require_admin(ctx: &ReducerContext, action: &str) -> Result<(), String> {
    if is_admin(ctx) {
        return Ok(());
    }
    log::warn!("Unauthorized {} attempt by {}", action, ctx.sender);
    Err(format!("Unauthorized: only admins can {}", action))
}

/// Get the calling learner
fn get_learner(ctx: &ReducerContext) -> Result<Learner, String> {
    ctx.db.learner()
        .identity()
        .find(&ctx.sender)
        .ok_or("Learner not registered".to_string())
}

fn parse_identity(identity_hex: &str) -> Result<Identity, String> {
    Identity::from_hex(identity_hex.trim())
        .map_err(|e| format!("Invalid identity hex '{}': {:?}", identity_hex, e))
}

/// Current config, falling back to defaults if init has not written it yet
fn load_config(ctx: &ReducerContext) -> PointsConfig {
    ctx.db.points_config()
        .id()
        .find(&CONFIG_ID)
        .unwrap_or_else(PointsConfig::defaults)
}

fn validate_name(name: &str) -> Result<String, String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Name must not be empty".to_string());
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(format!("Name must be at most {} characters", MAX_NAME_LEN));
    }
    Ok(trimmed.to_string())
}

/// Trimmed course/chapter title, rejecting blank ones
fn validate_title(kind: &str, title: &str) -> Result<String, String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(format!("{} title must not be empty", kind));
    }
    Ok(trimmed.to_string())
}

fn rate_in_range(label: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} must be between 0 and 1, got {}", label, value))
    }
}

/// Check a config row before it is stored
fn validate_config(config: &PointsConfig) -> Result<(), String> {
    rate_in_range("repeat_rate", config.repeat_rate)?;
    rate_in_range("first_time_rate", config.first_time_rate)?;
    rate_in_range("perfect_rate", config.perfect_rate)?;
    rate_in_range("speed_rate", config.speed_rate)?;
    if !(config.speed_ratio.is_finite() && config.speed_ratio > 0.0 && config.speed_ratio <= 1.0) {
        return Err(format!("speed_ratio must be in (0, 1], got {}", config.speed_ratio));
    }
    if config.perfect_score > MAX_QUIZ_SCORE {
        return Err(format!("perfect_score must be at most {}", MAX_QUIZ_SCORE));
    }
    if config.promotion_cutoff > config.safe_cutoff {
        return Err(format!(
            "promotion_cutoff ({}) must not exceed safe_cutoff ({})",
            config.promotion_cutoff, config.safe_cutoff
        ));
    }
    if config.active_window_days == 0 {
        return Err("active_window_days must be at least 1".to_string());
    }
    Ok(())
}

// ==================== TABLES ====================

/// Learner profile with points, streak and rank state
/// PRIVATE: Clients read their own row via the my_learner view
#[table(name = learner)]
#[derive(Clone, Debug)]
pub struct Learner {
    #[primary_key]
    pub identity: Identity,

    /// Display name
    pub name: String,

    pub rank: RankTier,

    /// Lifetime points
    pub total_points: u64,

    /// Points since the last weekly evaluation
    pub weekly_points: u32,

    pub current_streak: u32,
    pub longest_streak: u32,

    /// Last chapter completion (None = never active)
    pub last_active: Option<Timestamp>,

    /// Weekly evaluations left during which demotion is skipped
    pub immunity_weeks: u8,

    /// Per-learner rank freeze (admin)
    pub rank_frozen: bool,

    pub joined_at: Timestamp,
}

impl Learner {
    fn streak_state(&self) -> StreakState {
        StreakState {
            current: self.current_streak,
            longest: self.longest_streak,
            last_active_micros: self.last_active.map(micros),
        }
    }

    fn snapshot(&self) -> LearnerSnapshot<Identity> {
        LearnerSnapshot {
            id: self.identity,
            rank: self.rank,
            weekly_points: self.weekly_points,
            total_points: self.total_points,
            streak: self.streak_state(),
            immunity_weeks: self.immunity_weeks,
            rank_frozen: self.rank_frozen,
        }
    }
}

/// Identities allowed to call admin reducers
#[table(name = admin)]
pub struct Admin {
    #[primary_key]
    pub identity: Identity,
}

#[table(name = course, public)]
pub struct Course {
    #[primary_key]
    pub id: u64,
    pub title: String,
}

#[table(name = chapter, public)]
pub struct Chapter {
    #[primary_key]
    pub id: u64,

    #[index(btree)]
    pub course_id: u64,

    pub title: String,

    /// Order within the course
    pub position: u32,

    /// Expected time to complete; 0 = no speed bonus
    pub expected_minutes: u32,
}

/// Admin-assigned point budget, divided evenly across a course's chapters
#[table(name = course_points, public)]
pub struct CoursePoints {
    #[primary_key]
    pub course_id: u64,
    pub total_points: u32,
    pub updated_at: Timestamp,
}

/// Every chapter completion with the points it earned
#[table(name = chapter_completion)]
pub struct ChapterCompletion {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub learner: Identity,

    #[index(btree)]
    pub chapter_id: u64,

    pub course_id: u64,

    pub completed_at: Timestamp,

    /// Quiz score 0-100 (None = no quiz)
    pub quiz_score: Option<u8>,

    pub completion_seconds: u32,

    /// Streak length at completion time
    pub streak_days: u32,

    pub base_points: u32,
    pub first_time_bonus: u32,
    pub perfect_bonus: u32,
    pub speed_bonus: u32,
    pub multiplier: f64,

    /// Points actually awarded
    pub points: u32,

    /// Repeat completion (reduced points, no bonuses)
    pub repeat: bool,
}

/// Runtime-tunable rules (singleton row, id = 0)
#[table(name = points_config, public)]
#[derive(Clone)]
pub struct PointsConfig {
    #[primary_key]
    pub id: u32,

    pub repeat_rate: f64,
    pub first_time_rate: f64,
    pub perfect_rate: f64,
    pub perfect_score: u8,
    pub speed_rate: f64,
    pub speed_ratio: f64,

    pub promotion_cutoff: u32,
    pub safe_cutoff: u32,
    pub active_window_days: u32,

    /// Immunity granted at registration
    pub new_learner_immunity_weeks: u8,

    /// Global rank freeze: evaluations still run and reset weekly points,
    /// but no rank changes
    pub rank_freeze: bool,

    /// End of the last evaluated period (None = never evaluated)
    pub last_evaluated_until: Option<Timestamp>,
}

impl PointsConfig {
    fn defaults() -> Self {
        let points = PointsRules::default();
        let evaluation = EvaluationRules::default();
        Self {
            id: CONFIG_ID,
            repeat_rate: points.repeat_rate,
            first_time_rate: points.first_time_rate,
            perfect_rate: points.perfect_rate,
            perfect_score: points.perfect_score,
            speed_rate: points.speed_rate,
            speed_ratio: points.speed_ratio,
            promotion_cutoff: evaluation.promotion_cutoff,
            safe_cutoff: evaluation.safe_cutoff,
            active_window_days: evaluation.active_window_days,
            new_learner_immunity_weeks: ranking::DEFAULT_IMMUNITY_WEEKS,
            rank_freeze: false,
            last_evaluated_until: None,
        }
    }

    fn points_rules(&self) -> PointsRules {
        PointsRules {
            repeat_rate: self.repeat_rate,
            first_time_rate: self.first_time_rate,
            perfect_rate: self.perfect_rate,
            perfect_score: self.perfect_score,
            speed_rate: self.speed_rate,
            speed_ratio: self.speed_ratio,
        }
    }

    fn evaluation_rules(&self) -> EvaluationRules {
        EvaluationRules {
            promotion_cutoff: self.promotion_cutoff,
            safe_cutoff: self.safe_cutoff,
            active_window_days: self.active_window_days,
        }
    }
}

/// One row per weekly evaluation run
#[table(name = weekly_evaluation, public)]
pub struct WeeklyEvaluation {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// ISO week label of the closed week, e.g. "2026-W42"
    #[index(btree)]
    pub week: String,

    /// Previous run (None = first run ever)
    pub period_start: Option<Timestamp>,

    /// End of the evaluated period
    pub ran_at: Timestamp,

    /// "scheduled" or "manual"
    pub trigger: String,

    pub participants: u32,
    pub promoted: u32,
    pub demoted: u32,
    pub immune: u32,
    pub frozen: u32,
    pub failed: u32,

    /// Learners whose weekly points were reset
    pub reset: u32,
}

/// Rank changes applied by weekly evaluations
#[table(name = rank_history, public)]
pub struct RankHistory {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub learner: Identity,

    pub week: String,
    pub from_rank: RankTier,
    pub to_rank: RankTier,
    pub zone: Zone,
    pub position: u32,
    pub weekly_points: u32,
    pub changed_at: Timestamp,
}

/// In-app notifications
/// Public with RLS: each client only sees its own rows
#[table(name = notification, public)]
pub struct Notification {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub learner: Identity,

    pub kind: NotificationKind,

    pub message: String,

    /// JSON: {week, fromRank, toRank, position, weeklyPoints}
    pub payload: String,

    pub created_at: Timestamp,

    pub read: bool,
}

/// Denormalized standings for clients
#[table(name = leaderboard_entry, public)]
pub struct LeaderboardEntry {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub board: Board,

    /// 1-based, ties share a position
    pub position: u32,

    pub learner: Identity,
    pub learner_name: String,
    pub rank: RankTier,
    pub score: u64,
}

/// Schedule table for the weekly rank update (one-shot, re-armed each run)
#[table(name = weekly_rank_schedule, scheduled(run_weekly_rank_update))]
pub struct WeeklyRankSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

// ==================== VIEWS ====================

/// View: Returns only the caller's learner row
#[view(name = my_learner, public)]
fn my_learner(ctx: &spacetimedb::ViewContext) -> Option<Learner> {
    ctx.db.learner().identity().find(ctx.sender)
}

// ==================== ROW LEVEL SECURITY ====================

#[client_visibility_filter]
const NOTIFICATION_VISIBILITY: Filter = Filter::Sql(
    "SELECT * FROM notification WHERE learner = :sender"
);

// ==================== LIFECYCLE ====================

/// Initialize module - admin, default config and the weekly schedule
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.admin().identity().find(&ctx.sender).is_none() {
        ctx.db.admin().insert(Admin { identity: ctx.sender });
    }

    if ctx.db.points_config().id().find(&CONFIG_ID).is_none() {
        ctx.db.points_config().insert(PointsConfig::defaults());
    }

    // Avoid duplicate schedules on hot-reload
    if ctx.db.weekly_rank_schedule().iter().count() == 0 {
        schedule_next_weekly_run(ctx);
    }

    log::info!("Course points module initialized successfully");
}

fn schedule_next_weekly_run(ctx: &ReducerContext) {
    let next = Timestamp::from_micros_since_unix_epoch(next_week_start_micros(micros(ctx.timestamp)));
    ctx.db.weekly_rank_schedule().insert(WeeklyRankSchedule {
        id: 0, // auto_inc
        scheduled_at: ScheduleAt::Time(next.into()),
    });
    log::info!("[WEEKLY] next run scheduled at_micros={}", micros(next));
}

// ==================== LEARNER REDUCERS ====================

/// Register the caller as a learner, or rename an existing learner
#[reducer]
pub fn register_learner(ctx: &ReducerContext, name: String) -> Result<(), String> {
    let name = validate_name(&name)?;

    if let Some(mut existing) = ctx.db.learner().identity().find(&ctx.sender) {
        existing.name = name;
        ctx.db.learner().identity().update(existing);
        return Ok(());
    }

    let config = load_config(ctx);
    let learner = Learner {
        identity: ctx.sender,
        name,
        rank: RankTier::Bronze,
        total_points: 0,
        weekly_points: 0,
        current_streak: 0,
        longest_streak: 0,
        last_active: None,
        immunity_weeks: config.new_learner_immunity_weeks,
        rank_frozen: false,
        joined_at: ctx.timestamp,
    };
    log::info!("[LEARNER] registered learner=\"{}\" id={} immunity_weeks={}",
        learner.name, short_id(&ctx.sender), learner.immunity_weeks);
    ctx.db.learner().insert(learner);
    Ok(())
}

/// Record a chapter completion and award points
#[reducer]
pub fn complete_chapter(
    ctx: &ReducerContext,
    chapter_id: u64,
    quiz_score: Option<u8>,
    completion_seconds: u32,
) -> Result<(), String> {
    let mut learner = get_learner(ctx)?;

    if let Some(score) = quiz_score {
        if score > MAX_QUIZ_SCORE {
            return Err(format!("Quiz score {} out of range 0-{}", score, MAX_QUIZ_SCORE));
        }
    }

    let chapter = ctx.db.chapter()
        .id()
        .find(&chapter_id)
        .ok_or(format!("Chapter {} not found", chapter_id))?;

    let chapter_count = ctx.db.chapter().course_id().filter(&chapter.course_id).count() as u32;
    let budget = match ctx.db.course_points().course_id().find(&chapter.course_id) {
        Some(cp) => cp.total_points,
        None => {
            log::warn!("[POINTS] course:{} has no point budget, awarding 0", chapter.course_id);
            0
        }
    };

    let is_first_completion = !ctx.db.chapter_completion()
        .learner()
        .filter(&ctx.sender)
        .any(|c| c.chapter_id == chapter_id);

    let now = micros(ctx.timestamp);
    let streak = advance_streak(learner.streak_state(), now);

    let config = load_config(ctx);
    let breakdown = calculate_chapter_points(
        &CompletionInput {
            points_per_chapter: points_per_chapter(budget, chapter_count),
            is_first_completion,
            quiz_score,
            completion_seconds,
            expected_seconds: chapter.expected_minutes.saturating_mul(60),
            streak_days: streak.state.current,
        },
        &config.points_rules(),
    );

    ctx.db.chapter_completion().insert(ChapterCompletion {
        id: 0, // auto_inc
        learner: ctx.sender,
        chapter_id,
        course_id: chapter.course_id,
        completed_at: ctx.timestamp,
        quiz_score,
        completion_seconds,
        streak_days: streak.state.current,
        base_points: breakdown.base,
        first_time_bonus: breakdown.first_time_bonus,
        perfect_bonus: breakdown.perfect_bonus,
        speed_bonus: breakdown.speed_bonus,
        multiplier: breakdown.multiplier,
        points: breakdown.total,
        repeat: breakdown.repeat,
    });

    learner.current_streak = streak.state.current;
    learner.longest_streak = streak.state.longest;
    learner.last_active = streak.state.last_active_micros.map(Timestamp::from_micros_since_unix_epoch);
    learner.weekly_points = learner.weekly_points.saturating_add(breakdown.total);
    learner.total_points = learner.total_points.saturating_add(u64::from(breakdown.total));

    if streak.reset && streak.state.longest > 1 {
        log::info!("[STREAK] restarted learner=\"{}\" longest={}", learner.name, streak.state.longest);
    }

    // Wide event: one canonical log per completion
    log::info!("[POINTS] learner=\"{}\" id={} chapter={} course={} first={} base={} first_bonus={} perfect_bonus={} speed_bonus={} streak={} new_day={} multiplier={} awarded={} weekly={} total={}",
        learner.name, short_id(&ctx.sender), chapter_id, chapter.course_id, is_first_completion,
        breakdown.base, breakdown.first_time_bonus, breakdown.perfect_bonus, breakdown.speed_bonus,
        streak.state.current, streak.new_day, breakdown.multiplier, breakdown.total,
        learner.weekly_points, learner.total_points);

    ctx.db.learner().identity().update(learner);
    refresh_all_boards(ctx);
    Ok(())
}

/// Mark one of the caller's notifications as read
#[reducer]
pub fn mark_notification_read(ctx: &ReducerContext, notification_id: u64) -> Result<(), String> {
    let mut notification = ctx.db.notification()
        .id()
        .find(&notification_id)
        .ok_or(format!("Notification {} not found", notification_id))?;

    if notification.learner != ctx.sender {
        log::warn!("{} attempted to read notification {} of another learner", ctx.sender, notification_id);
        return Err("Unauthorized".to_string());
    }

    if !notification.read {
        notification.read = true;
        ctx.db.notification().id().update(notification);
    }
    Ok(())
}

// ==================== ADMIN REDUCERS ====================

#[reducer]
pub fn add_admin(ctx: &ReducerContext, identity_hex: String) -> Result<(), String> {
    require_admin(ctx, "add admins")?;
    let identity = parse_identity(&identity_hex)?;
    if ctx.db.admin().identity().find(&identity).is_none() {
        ctx.db.admin().insert(Admin { identity });
        log::info!("[ADMIN] add_admin identity:{} by:{}", short_id(&identity), short_id(&ctx.sender));
    }
    Ok(())
}

#[reducer]
pub fn upsert_course(ctx: &ReducerContext, course_id: u64, title: String) -> Result<(), String> {
    require_admin(ctx, "edit courses")?;
    let title = validate_title("Course", &title)?;

    let course = Course { id: course_id, title };
    if ctx.db.course().id().find(&course_id).is_some() {
        ctx.db.course().id().update(course);
    } else {
        ctx.db.course().insert(course);
    }
    Ok(())
}

#[reducer]
pub fn upsert_chapter(
    ctx: &ReducerContext,
    chapter_id: u64,
    course_id: u64,
    title: String,
    position: u32,
    expected_minutes: u32,
) -> Result<(), String> {
    require_admin(ctx, "edit chapters")?;
    let title = validate_title("Chapter", &title)?;
    if ctx.db.course().id().find(&course_id).is_none() {
        return Err(format!("Course {} not found", course_id));
    }

    let chapter = Chapter {
        id: chapter_id,
        course_id,
        title,
        position,
        expected_minutes,
    };
    if ctx.db.chapter().id().find(&chapter_id).is_some() {
        ctx.db.chapter().id().update(chapter);
    } else {
        ctx.db.chapter().insert(chapter);
    }
    Ok(())
}

/// Set a course's point budget
#[reducer]
pub fn set_course_points(ctx: &ReducerContext, course_id: u64, total_points: u32) -> Result<(), String> {
    require_admin(ctx, "set course points")?;
    if ctx.db.course().id().find(&course_id).is_none() {
        return Err(format!("Course {} not found", course_id));
    }

    let row = CoursePoints { course_id, total_points, updated_at: ctx.timestamp };
    if ctx.db.course_points().course_id().find(&course_id).is_some() {
        ctx.db.course_points().course_id().update(row);
    } else {
        ctx.db.course_points().insert(row);
    }

    let chapters = ctx.db.chapter().course_id().filter(&course_id).count() as u32;
    log::info!("[ADMIN] set_course_points course:{} total:{} chapters:{} per_chapter:{:.2}",
        course_id, total_points, chapters, points_per_chapter(total_points, chapters));
    Ok(())
}

/// Update the chapter points rules
#[reducer]
pub fn update_points_rules(
    ctx: &ReducerContext,
    repeat_rate: f64,
    first_time_rate: f64,
    perfect_rate: f64,
    perfect_score: u8,
    speed_rate: f64,
    speed_ratio: f64,
) -> Result<(), String> {
    require_admin(ctx, "update points rules")?;

    let mut config = load_config(ctx);
    config.repeat_rate = repeat_rate;
    config.first_time_rate = first_time_rate;
    config.perfect_rate = perfect_rate;
    config.perfect_score = perfect_score;
    config.speed_rate = speed_rate;
    config.speed_ratio = speed_ratio;
    validate_config(&config)?;

    log::info!("[ADMIN] update_points_rules repeat:{} first:{} perfect:{}@{} speed:{}@{} by:{}",
        repeat_rate, first_time_rate, perfect_rate, perfect_score, speed_rate, speed_ratio, short_id(&ctx.sender));
    store_config(ctx, config);
    Ok(())
}

/// Update the weekly evaluation rules
#[reducer]
pub fn update_evaluation_rules(
    ctx: &ReducerContext,
    promotion_cutoff: u32,
    safe_cutoff: u32,
    active_window_days: u32,
    new_learner_immunity_weeks: u8,
) -> Result<(), String> {
    require_admin(ctx, "update evaluation rules")?;

    let mut config = load_config(ctx);
    config.promotion_cutoff = promotion_cutoff;
    config.safe_cutoff = safe_cutoff;
    config.active_window_days = active_window_days;
    config.new_learner_immunity_weeks = new_learner_immunity_weeks;
    validate_config(&config)?;

    log::info!("[ADMIN] update_evaluation_rules promotion:{} safe:{} window_days:{} immunity:{} by:{}",
        promotion_cutoff, safe_cutoff, active_window_days, new_learner_immunity_weeks, short_id(&ctx.sender));
    store_config(ctx, config);
    Ok(())
}

fn store_config(ctx: &ReducerContext, config: PointsConfig) {
    if ctx.db.points_config().id().find(&CONFIG_ID).is_some() {
        ctx.db.points_config().id().update(config);
    } else {
        ctx.db.points_config().insert(config);
    }
}

/// Freeze or unfreeze all rank changes
#[reducer]
pub fn set_rank_freeze(ctx: &ReducerContext, frozen: bool) -> Result<(), String> {
    require_admin(ctx, "freeze ranks")?;
    let mut config = load_config(ctx);
    config.rank_freeze = frozen;
    store_config(ctx, config);
    log::info!("[ADMIN] set_rank_freeze frozen:{} by:{}", frozen, short_id(&ctx.sender));
    Ok(())
}

/// Freeze or unfreeze one learner's rank
#[reducer]
pub fn set_learner_rank_freeze(ctx: &ReducerContext, identity_hex: String, frozen: bool) -> Result<(), String> {
    require_admin(ctx, "freeze learner ranks")?;
    let identity = parse_identity(&identity_hex)?;
    let mut learner = ctx.db.learner()
        .identity()
        .find(&identity)
        .ok_or(format!("Learner {} not found", identity_hex))?;
    learner.rank_frozen = frozen;
    log::info!("[ADMIN] set_learner_rank_freeze learner=\"{}\" frozen:{}", learner.name, frozen);
    ctx.db.learner().identity().update(learner);
    Ok(())
}

#[reducer]
pub fn refresh_leaderboards(ctx: &ReducerContext) -> Result<(), String> {
    require_admin(ctx, "refresh leaderboards")?;
    refresh_all_boards(ctx);
    Ok(())
}

/// Run the weekly evaluation immediately (no-op if a run already closed a period this week)
#[reducer]
pub fn run_weekly_rank_update_now(ctx: &ReducerContext) -> Result<(), String> {
    require_admin(ctx, "run the weekly rank update")?;
    evaluate_week(ctx, RunTrigger::Manual);
    Ok(())
}

// ==================== WEEKLY EVALUATION ====================

/// Scheduled weekly rank update
#[reducer]
pub fn run_weekly_rank_update(ctx: &ReducerContext, _schedule: WeeklyRankSchedule) -> Result<(), String> {
    // Only allow scheduler to call this, not clients
    if ctx.sender != ctx.identity() {
        log::warn!("Client {} attempted to call run_weekly_rank_update", ctx.sender);
        return Err("Unauthorized: scheduler only".to_string());
    }

    evaluate_week(ctx, RunTrigger::Scheduled);
    schedule_next_weekly_run(ctx);
    Ok(())
}

fn evaluate_week(ctx: &ReducerContext, trigger: RunTrigger) {
    let now = micros(ctx.timestamp);
    let week = evaluated_week_label(now);
    let mut config = load_config(ctx);
    let period_start = config.last_evaluated_until;

    if !should_run(trigger, period_start.map(micros), now) {
        log::warn!("[WEEKLY] skipped week={} trigger={} reason=already_evaluated last_until_micros={}",
            week, trigger.name(), period_start.map(micros).unwrap_or_default());
        return;
    }

    let learners: Vec<Learner> = ctx.db.learner().iter().collect();
    let snapshots: Vec<LearnerSnapshot<Identity>> = learners.iter().map(Learner::snapshot).collect();
    let plan = plan_evaluation(&snapshots, now, &config.evaluation_rules(), config.rank_freeze);
    let mut summary = plan.summary;

    // Closing standings, before weekly points reset
    write_board(ctx, Board::LastWeek, &learners);

    for outcome in plan.outcomes.iter().filter(|o| o.changed) {
        if let Err(e) = apply_outcome(ctx, outcome, &week) {
            // One bad row must not stop the rest of the run
            summary.failed += 1;
            log::error!("[WEEKLY] learner:{} failed week={} error:{}", short_id(&outcome.id), week, e);
        }
    }

    refresh_all_boards(ctx);

    ctx.db.weekly_evaluation().insert(WeeklyEvaluation {
        id: 0, // auto_inc
        week: week.clone(),
        period_start,
        ran_at: ctx.timestamp,
        trigger: trigger.name().to_string(),
        participants: summary.participants,
        promoted: summary.promoted,
        demoted: summary.demoted,
        immune: summary.immune,
        frozen: summary.frozen,
        failed: summary.failed,
        reset: summary.reset,
    });

    let global_freeze = config.rank_freeze;
    config.last_evaluated_until = Some(ctx.timestamp);
    store_config(ctx, config);

    // Wide event: one canonical log per weekly run
    log::info!("[WEEKLY] evaluated week={} trigger={} learners={} participants={} promoted={} demoted={} immune={} frozen={} failed={} reset={} global_freeze={}",
        week, trigger.name(), learners.len(), summary.participants, summary.promoted, summary.demoted,
        summary.immune, summary.frozen, summary.failed, summary.reset, global_freeze);
}

/// Write one learner's weekly outcome: rank, immunity, reset, history, notification
fn apply_outcome(ctx: &ReducerContext, outcome: &LearnerOutcome<Identity>, week: &str) -> Result<(), String> {
    let mut learner = ctx.db.learner()
        .identity()
        .find(&outcome.id)
        .ok_or("Learner disappeared during evaluation".to_string())?;

    learner.rank = outcome.rank;
    learner.immunity_weeks = outcome.immunity_weeks;
    learner.weekly_points = 0;
    learner.current_streak = outcome.current_streak;

    if let (Some(decision), Some((position, zone))) = (outcome.decision, outcome.placement) {
        if decision.changed() {
            ctx.db.rank_history().insert(RankHistory {
                id: 0, // auto_inc
                learner: learner.identity,
                week: week.to_string(),
                from_rank: decision.from,
                to_rank: decision.to,
                zone,
                position,
                weekly_points: outcome.weekly_points,
                changed_at: ctx.timestamp,
            });
            log::info!("[RANK] learner=\"{}\" from={} to={} zone={} position={} weekly_points={}",
                learner.name, decision.from.name(), decision.to.name(), zone.name(),
                position, outcome.weekly_points);
        } else {
            log::debug!("[RANK] learner=\"{}\" unchanged rank={} reason={} position={}",
                learner.name, decision.to.name(), decision.reason.name(), position);
        }

        if let Some(kind) = notification_kind(decision.reason) {
            let placement = Placement { position, zone, weekly_points: outcome.weekly_points };
            notify_rank_outcome(ctx, &learner, kind, &placement, decision.from, week);
        }
    }

    ctx.db.learner().identity().update(learner);
    Ok(())
}

/// Where a learner finished in the closed week
struct Placement {
    position: u32,
    zone: Zone,
    weekly_points: u32,
}

fn notify_rank_outcome(
    ctx: &ReducerContext,
    learner: &Learner,
    kind: NotificationKind,
    placement: &Placement,
    from: RankTier,
    week: &str,
) {
    let message = match kind {
        NotificationKind::RankPromoted => format!("Promoted to {}! You finished #{} this week.", learner.rank.name(), placement.position),
        NotificationKind::RankDemoted => format!("Dropped to {}. Earn more points this week to climb back.", learner.rank.name()),
        NotificationKind::DemotionBlocked => format!(
            "You stayed {} thanks to new-learner protection ({} week(s) left).",
            learner.rank.name(),
            learner.immunity_weeks
        ),
    };

    let payload = json!({
        "week": week,
        "fromRank": from.name(),
        "toRank": learner.rank.name(),
        "zone": placement.zone.name(),
        "position": placement.position,
        "weeklyPoints": placement.weekly_points,
    });

    ctx.db.notification().insert(Notification {
        id: 0, // auto_inc
        learner: learner.identity,
        kind,
        message,
        payload: payload.to_string(),
        created_at: ctx.timestamp,
        read: false,
    });
}

// ==================== LEADERBOARDS ====================

fn board_score(board: Board, learner: &Learner) -> u64 {
    match board {
        Board::Weekly | Board::LastWeek => u64::from(learner.weekly_points),
        Board::AllTime => learner.total_points,
    }
}

/// Ranked rows of a board; learners with no score are left off
fn board_rows(board: Board, learners: &[Learner]) -> Vec<BoardRow<Identity>> {
    let scores: Vec<(Identity, u64)> = learners
        .iter()
        .map(|l| (l.identity, board_score(board, l)))
        .filter(|(_, score)| *score > 0)
        .collect();
    rank_rows(scores, LEADERBOARD_SIZE)
}

/// Replace a board's rows with standings computed from `learners`
fn write_board(ctx: &ReducerContext, board: Board, learners: &[Learner]) {
    let stale: Vec<u64> = ctx.db.leaderboard_entry()
        .iter()
        .filter(|e| e.board == board)
        .map(|e| e.id)
        .collect();
    for id in stale {
        ctx.db.leaderboard_entry().id().delete(&id);
    }

    let by_id: HashMap<Identity, &Learner> = learners.iter().map(|l| (l.identity, l)).collect();
    let rows = board_rows(board, learners);
    let count = rows.len();
    for row in rows {
        if let Some(learner) = by_id.get(&row.learner_id) {
            ctx.db.leaderboard_entry().insert(LeaderboardEntry {
                id: 0, // auto_inc
                board,
                position: row.position,
                learner: learner.identity,
                learner_name: learner.name.clone(),
                rank: learner.rank,
                score: row.score,
            });
        }
    }

    log::debug!("[LEADERBOARD] refreshed board={} entries={}", board.name(), count);
}

/// Rebuild the live boards from current learner points
fn refresh_all_boards(ctx: &ReducerContext) {
    let learners: Vec<Learner> = ctx.db.learner().iter().collect();
    write_board(ctx, Board::Weekly, &learners);
    write_board(ctx, Board::AllTime, &learners);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&PointsConfig::defaults()), Ok(()));
    }

    #[test]
    fn test_config_rejects_out_of_range_rates() {
        let mut config = PointsConfig::defaults();
        config.repeat_rate = 1.5;
        assert!(validate_config(&config).is_err());

        let mut config = PointsConfig::defaults();
        config.speed_rate = f64::NAN;
        assert!(validate_config(&config).is_err());

        let mut config = PointsConfig::defaults();
        config.speed_ratio = 0.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_config_rejects_inverted_cutoffs() {
        let mut config = PointsConfig::defaults();
        config.promotion_cutoff = 60;
        config.safe_cutoff = 50;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("promotion_cutoff"));
    }

    #[test]
    fn test_config_rejects_bad_thresholds() {
        let mut config = PointsConfig::defaults();
        config.perfect_score = 101;
        assert!(validate_config(&config).is_err());

        let mut config = PointsConfig::defaults();
        config.active_window_days = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_config_rules_mirror_row() {
        let mut config = PointsConfig::defaults();
        config.perfect_score = 90;
        config.promotion_cutoff = 5;
        assert_eq!(config.points_rules().perfect_score, 90);
        assert_eq!(config.evaluation_rules().promotion_cutoff, 5);
        assert_eq!(config.points_rules().repeat_rate, points::DEFAULT_REPEAT_RATE);
    }

    #[test]
    fn test_validate_title_rejects_blank_for_courses_and_chapters() {
        assert_eq!(validate_title("Chapter", "  Intro  "), Ok("Intro".to_string()));
        assert_eq!(validate_title("Chapter", " \t "), Err("Chapter title must not be empty".to_string()));
        assert_eq!(validate_title("Course", ""), Err("Course title must not be empty".to_string()));
    }

    fn learner(byte: u8, weekly_points: u32, total_points: u64) -> Learner {
        Learner {
            identity: Identity::from_hex(&format!("{:02x}", byte).repeat(32)).unwrap(),
            name: format!("learner{}", byte),
            rank: RankTier::Silver,
            total_points,
            weekly_points,
            current_streak: 2,
            longest_streak: 4,
            last_active: Some(Timestamp::from_micros_since_unix_epoch(1_000)),
            immunity_weeks: 1,
            rank_frozen: false,
            joined_at: Timestamp::from_micros_since_unix_epoch(0),
        }
    }

    #[test]
    fn test_board_scores_by_board() {
        let learners = vec![learner(1, 30, 100), learner(2, 0, 500), learner(3, 30, 50)];

        let weekly = board_rows(Board::Weekly, &learners);
        let got: Vec<_> = weekly.iter().map(|r| (r.learner_id, r.score, r.position)).collect();
        assert_eq!(got, vec![(learners[0].identity, 30, 1), (learners[2].identity, 30, 1)]);

        let all_time = board_rows(Board::AllTime, &learners);
        assert_eq!(all_time[0].learner_id, learners[1].identity);
        assert_eq!(all_time.len(), 3);
    }

    #[test]
    fn test_last_week_board_keeps_points_closed_by_evaluation() {
        let learners = vec![learner(1, 80, 200), learner(2, 20, 900)];
        let closing = board_rows(Board::LastWeek, &learners);

        let snapshots: Vec<_> = learners.iter().map(Learner::snapshot).collect();
        let plan = plan_evaluation(&snapshots, 2_000, &EvaluationRules::default(), false);
        assert!(plan.outcomes.iter().all(|o| o.changed));

        // Live weekly board after the reset is empty, the closing board is not
        let after: Vec<Learner> = learners
            .iter()
            .cloned()
            .map(|l| Learner { weekly_points: 0, ..l })
            .collect();
        assert!(board_rows(Board::Weekly, &after).is_empty());
        assert_eq!(closing.len(), 2);
        assert_eq!(closing[0].learner_id, learners[0].identity);
        assert_eq!(closing[0].score, 80);
    }

    #[test]
    fn test_snapshot_mirrors_learner_row() {
        let row = learner(7, 12, 340);
        let snapshot = row.snapshot();
        assert_eq!(snapshot.id, row.identity);
        assert_eq!(snapshot.weekly_points, 12);
        assert_eq!(snapshot.total_points, 340);
        assert_eq!(snapshot.immunity_weeks, 1);
        assert_eq!(snapshot.streak.last_active_micros, Some(1_000));
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  Ada  "), Ok("Ada".to_string()));
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name(&"é".repeat(MAX_NAME_LEN)).is_ok());
    }
}
