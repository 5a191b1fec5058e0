// Leaderboard ordering with shared positions for ties

use spacetimedb::SpacetimeType;

/// Maximum rows kept per board
pub const LEADERBOARD_SIZE: usize = 100;

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    /// Points earned since the last weekly evaluation
    Weekly,
    /// Lifetime points
    AllTime,
    /// Weekly points as they stood when the last evaluation closed the week
    LastWeek,
}

impl Board {
    pub fn name(&self) -> &'static str {
        match self {
            Board::Weekly => "weekly",
            Board::AllTime => "all_time",
            Board::LastWeek => "last_week",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardRow<Id> {
    pub learner_id: Id,
    pub score: u64,
    pub position: u32,
}

/// Sort (learner_id, score) pairs by score desc then id asc, truncate to
/// `limit`, and assign tie-aware positions: equal scores share a position
/// and the next distinct score skips ahead (1, 1, 3).
pub fn rank_rows<Id: Ord>(mut scores: Vec<(Id, u64)>, limit: usize) -> Vec<BoardRow<Id>> {
    scores.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scores.truncate(limit);

    let mut rows: Vec<BoardRow<Id>> = Vec::with_capacity(scores.len());
    for (i, (learner_id, score)) in scores.into_iter().enumerate() {
        let position = match rows.last() {
            Some(prev) if prev.score == score => prev.position,
            _ => (i + 1) as u32,
        };
        rows.push(BoardRow { learner_id, score, position });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, u64)]) -> Vec<(String, u64)> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn test_ties_share_position_and_next_skips() {
        let rows = rank_rows(scores(&[("c", 40), ("a", 90), ("b", 90), ("d", 10)]), 10);
        let got: Vec<_> = rows.iter().map(|r| (r.learner_id.as_str(), r.position)).collect();
        assert_eq!(got, vec![("a", 1), ("b", 1), ("c", 3), ("d", 4)]);
    }

    #[test]
    fn test_limit_truncates_after_sorting() {
        let rows = rank_rows(scores(&[("low", 1), ("high", 100), ("mid", 50)]), 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].learner_id, "high");
        assert_eq!(rows[1].learner_id, "mid");
    }

    #[test]
    fn test_empty_board() {
        assert!(rank_rows(Vec::<(String, u64)>::new(), LEADERBOARD_SIZE).is_empty());
    }
}
