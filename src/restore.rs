// Bulk restore reducers for disaster recovery
// Accept JSON arrays exported from the admin tooling (TypeScript SDK format)

use spacetimedb::{reducer, ReducerContext, Timestamp, Table};
use crate::ranking::RankTier;
use crate::{learner, Learner};
use serde_json::Value;

/// Parse Timestamp from SDK JSON format: {"__timestamp_micros_since_unix_epoch__": "123456"}
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    let micros_str = val.get("__timestamp_micros_since_unix_epoch__")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp field")?;

    let micros: i64 = micros_str.parse()
        .map_err(|e| format!("Invalid timestamp micros: {}", e))?;

    Ok(Timestamp::from_micros_since_unix_epoch(micros))
}

fn parse_u64(entry: &Value, field: &str, i: usize) -> Result<u64, String> {
    entry.get(field)
        .and_then(|v| v.as_u64())
        .ok_or(format!("Learner {}: missing {}", i, field))
}

fn parse_u32(entry: &Value, field: &str, i: usize) -> Result<u32, String> {
    u32::try_from(parse_u64(entry, field, i)?)
        .map_err(|_| format!("Learner {}: {} out of range", i, field))
}

/// Parse one learner from SDK JSON
fn parse_learner(entry: &Value, i: usize) -> Result<Learner, String> {
    let identity_hex = entry.get("identity")
        .and_then(|v| v.as_str())
        .ok_or(format!("Learner {}: missing identity", i))?;

    let rank_name = entry.get("rank")
        .and_then(|v| v.as_str())
        .ok_or(format!("Learner {}: missing rank", i))?;

    let last_active = match entry.get("lastActive") {
        Some(Value::Null) | None => None,
        Some(v) => Some(parse_timestamp_json(v)?),
    };

    let immunity_weeks = entry.get("immunityWeeks").and_then(|v| v.as_u64()).unwrap_or(0);

    Ok(Learner {
        identity: crate::parse_identity(identity_hex)?,
        name: entry.get("name").and_then(|v| v.as_str()).ok_or(format!("Learner {}: missing name", i))?.to_string(),
        rank: RankTier::from_name(rank_name).ok_or(format!("Learner {}: unknown rank '{}'", i, rank_name))?,
        total_points: parse_u64(entry, "totalPoints", i)?,
        weekly_points: parse_u32(entry, "weeklyPoints", i)?,
        current_streak: parse_u32(entry, "currentStreak", i)?,
        longest_streak: parse_u32(entry, "longestStreak", i)?,
        last_active,
        immunity_weeks: immunity_weeks.min(u64::from(u8::MAX)) as u8,
        rank_frozen: entry.get("rankFrozen").and_then(|v| v.as_bool()).unwrap_or(false),
        joined_at: parse_timestamp_json(entry.get("joinedAt").ok_or(format!("Learner {}: missing joinedAt", i))?)?,
    })
}

/// Parse a JSON array of learners; fails on the first bad record
fn parse_learners(json_data: &str) -> Result<Vec<Learner>, String> {
    let data: Value = serde_json::from_str(json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let entries = data.as_array()
        .ok_or("Expected JSON array of learners")?;

    entries.iter()
        .enumerate()
        .map(|(i, entry)| parse_learner(entry, i))
        .collect()
}

/// Bulk restore learner table from JSON array
/// Existing rows with the same identity are replaced
#[reducer]
pub fn bulk_restore_learners(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    crate::require_admin(ctx, "restore learners")?;

    let learners = parse_learners(&json_data)?;

    let mut replaced = 0;
    let count = learners.len();
    for learner in learners {
        if ctx.db.learner().identity().find(&learner.identity).is_some() {
            ctx.db.learner().identity().update(learner);
            replaced += 1;
        } else {
            ctx.db.learner().insert(learner);
        }
    }

    log::info!("[RESTORE] learners restored={} replaced={}", count, replaced);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: &str = "c200f1d4b6b9a2f1f1e4c1d3a7f6b5e4d3c2b1a0f9e8d7c6b5a4f3e2d1c0b9a8";

    fn learner_json(rank: &str) -> String {
        format!(
            r#"[{{
                "identity": "{}",
                "name": "Ada",
                "rank": "{}",
                "totalPoints": 4200,
                "weeklyPoints": 310,
                "currentStreak": 8,
                "longestStreak": 21,
                "lastActive": {{"__timestamp_micros_since_unix_epoch__": "1792368000000000"}},
                "immunityWeeks": 1,
                "joinedAt": {{"__timestamp_micros_since_unix_epoch__": "1790000000000000"}}
            }}]"#,
            IDENTITY, rank
        )
    }

    #[test]
    fn test_parse_timestamp_json() {
        let val: Value = serde_json::from_str(r#"{"__timestamp_micros_since_unix_epoch__": "42"}"#).unwrap();
        assert_eq!(parse_timestamp_json(&val).unwrap().to_micros_since_unix_epoch(), 42);

        let bad: Value = serde_json::from_str(r#"{"micros": 42}"#).unwrap();
        assert!(parse_timestamp_json(&bad).is_err());
    }

    #[test]
    fn test_parse_learners() {
        let learners = parse_learners(&learner_json("Gold")).unwrap();
        assert_eq!(learners.len(), 1);
        let learner = &learners[0];
        assert_eq!(learner.name, "Ada");
        assert_eq!(learner.rank, RankTier::Gold);
        assert_eq!(learner.total_points, 4200);
        assert_eq!(learner.weekly_points, 310);
        assert_eq!(learner.longest_streak, 21);
        assert_eq!(learner.immunity_weeks, 1);
        assert!(!learner.rank_frozen);
        assert_eq!(learner.last_active.map(|t| t.to_micros_since_unix_epoch()), Some(1_792_368_000_000_000));
    }

    #[test]
    fn test_parse_learners_rejects_unknown_rank() {
        let err = parse_learners(&learner_json("platinum")).unwrap_err();
        assert!(err.contains("unknown rank"));
    }

    #[test]
    fn test_parse_learners_rejects_non_array() {
        assert!(parse_learners(r#"{"identity": "x"}"#).is_err());
        assert!(parse_learners("not json").is_err());
    }
}
