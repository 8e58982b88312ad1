//! # Ranking Engine
//! Pure, deterministic ordering of posts for a sort mode.
//!
//! - Pinned posts skip scoring, keep timestamp-descending order and always
//!   come first.
//! - Every other post gets a raw score (see [`raw_score`]), which is divided
//!   by the sum of raw scores of its source (floored at 1). Sources therefore
//!   compete on their internal distribution, not on absolute volume.
//! - Final order: relative score desc, then upvotes desc, then timestamp desc,
//!   then arrival order.

use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::FeedError;
use crate::model::{Post, SortMode};

pub const DEFAULT_HOT_EPOCH_OFFSET: i64 = 1_134_028_003;
pub const DEFAULT_HOT_DECAY_SECS: f64 = 45_000.0;

/// Tuning values of the `hot` formula. Kept configurable because changing them
/// changes feed ranking.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct HotConstants {
    #[serde(default = "default_epoch_offset")]
    pub hot_epoch_offset: i64,
    #[serde(default = "default_decay_secs")]
    pub hot_decay_secs: f64,
}

fn default_epoch_offset() -> i64 {
    DEFAULT_HOT_EPOCH_OFFSET
}

fn default_decay_secs() -> f64 {
    DEFAULT_HOT_DECAY_SECS
}

impl Default for HotConstants {
    fn default() -> Self {
        Self {
            hot_epoch_offset: DEFAULT_HOT_EPOCH_OFFSET,
            hot_decay_secs: DEFAULT_HOT_DECAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RankingEngine {
    hot: HotConstants,
}

impl RankingEngine {
    pub fn new(hot: HotConstants) -> Self {
        Self { hot }
    }

    /// Rank by a textual sort mode. Unknown modes fail instead of defaulting.
    pub fn rank_named(&self, sort: &str, posts: Vec<Post>) -> Result<Vec<Post>, FeedError> {
        let mode: SortMode = sort.parse()?;
        Ok(self.rank(mode, posts))
    }

    pub fn rank(&self, mode: SortMode, posts: Vec<Post>) -> Vec<Post> {
        let (mut pinned, unpinned): (Vec<Post>, Vec<Post>) =
            posts.into_iter().partition(|p| p.pinned);
        pinned.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let scored = self.relative_scores(mode, &unpinned);
        let mut order: Vec<usize> = (0..unpinned.len()).collect();
        // sort_by is stable: equal keys keep arrival order
        order.sort_by(|&a, &b| {
            let (pa, pb) = (&unpinned[a], &unpinned[b]);
            scored[b]
                .total_cmp(&scored[a])
                .then_with(|| pb.upvote_count.cmp(&pa.upvote_count))
                .then_with(|| pb.timestamp.cmp(&pa.timestamp))
        });

        let mut slots: Vec<Option<Post>> = unpinned.into_iter().map(Some).collect();
        pinned.extend(order.into_iter().filter_map(|i| slots[i].take()));
        pinned
    }

    /// Relative score per post, index-aligned with `posts`.
    pub fn relative_scores(&self, mode: SortMode, posts: &[Post]) -> Vec<f64> {
        let raw: Vec<f64> = posts.iter().map(|p| raw_score(mode, p, &self.hot)).collect();

        let mut totals: HashMap<&str, f64> = HashMap::new();
        for (p, s) in posts.iter().zip(&raw) {
            *totals.entry(p.source_id.as_str()).or_default() += s;
        }

        posts
            .iter()
            .zip(raw)
            .map(|(p, s)| {
                let total = totals.get(p.source_id.as_str()).copied().unwrap_or(1.0);
                // totals below 1 would invert or explode the relative score
                let total = if total < 1.0 { 1.0 } else { total };
                s / total
            })
            .collect()
    }
}

/// Raw, un-normalized score of one post.
pub fn raw_score(mode: SortMode, post: &Post, hot: &HotConstants) -> f64 {
    let up = post.upvote_count;
    let down = post.downvote_count;
    match mode {
        SortMode::New => post.timestamp as f64,
        SortMode::Top(_) => up.saturating_sub(down) as f64,
        SortMode::Active => post.last_activity_timestamp.unwrap_or(post.timestamp) as f64,
        SortMode::Hot => {
            let net = up.saturating_sub(down);
            let order = (net.unsigned_abs().max(1) as f64).log10();
            let sign = match net.cmp(&0) {
                Ordering::Greater => 1.0,
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
            };
            let seconds = post.timestamp.saturating_sub(hot.hot_epoch_offset) as f64;
            round_to(sign * order + seconds / hot.hot_decay_secs, 7)
        }
        SortMode::Controversial(_) => controversy(up, down),
    }
}

/// `(up + down) ^ (min / max)`; the ratio term is 0 when either side has no
/// votes, and a post without any votes scores 0.
fn controversy(up: i64, down: i64) -> f64 {
    let (up, down) = (up.max(0), down.max(0));
    let magnitude = up.saturating_add(down) as f64;
    if magnitude == 0.0 {
        return 0.0;
    }
    let (lo, hi) = (up.min(down), up.max(down));
    let balance = if lo == 0 { 0.0 } else { lo as f64 / hi as f64 };
    magnitude.powf(balance)
}

fn round_to(x: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (x * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(posts: &[Post]) -> Vec<&str> {
        posts.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn pinned_first_in_timestamp_order() {
        let posts = vec![
            Post::new("a", "s", 10).votes(100, 0),
            Post::new("p1", "s", 5).pinned(),
            Post::new("b", "s", 20),
            Post::new("p2", "s", 7).pinned(),
        ];
        let out = RankingEngine::default().rank(SortMode::Top(None), posts);
        assert_eq!(&ids(&out)[..2], &["p2", "p1"]);
    }

    #[test]
    fn top_uses_relative_score() {
        // small source: one post with 3 of its 4 points beats a big source's 60 of 100
        let posts = vec![
            Post::new("big1", "big", 1).votes(60, 0),
            Post::new("big2", "big", 1).votes(40, 0),
            Post::new("small1", "small", 1).votes(3, 0),
            Post::new("small2", "small", 1).votes(1, 0),
        ];
        let out = RankingEngine::default().rank(SortMode::Top(None), posts);
        assert_eq!(ids(&out), vec!["small1", "big1", "big2", "small2"]);
    }

    #[test]
    fn negative_totals_are_floored() {
        let posts = vec![
            Post::new("a", "s", 1).votes(0, 5),
            Post::new("b", "s", 1).votes(1, 0),
        ];
        let rel = RankingEngine::default().relative_scores(SortMode::Top(None), &posts);
        assert_eq!(rel, vec![-5.0, 1.0]);
    }

    #[test]
    fn ties_fall_back_to_upvotes_then_timestamp() {
        // equal relative score 0 (net 0) for all
        let posts = vec![
            Post::new("old", "s", 1).votes(2, 2),
            Post::new("new", "s", 9).votes(2, 2),
            Post::new("loud", "s", 5).votes(9, 9),
        ];
        let out = RankingEngine::default().rank(SortMode::Top(None), posts);
        assert_eq!(ids(&out), vec!["loud", "new", "old"]);
    }

    #[test]
    fn active_prefers_last_activity() {
        let posts = vec![
            Post::new("a", "s", 100),
            Post::new("b", "s", 50).active_at(500),
        ];
        let out = RankingEngine::default().rank(SortMode::Active, posts);
        assert_eq!(ids(&out), vec!["b", "a"]);
    }

    #[test]
    fn hot_formula_matches_reference_values() {
        let hot = HotConstants::default();
        let p = Post::new("a", "s", DEFAULT_HOT_EPOCH_OFFSET + 45_000).votes(101, 1);
        // log10(100) + 1
        assert!((raw_score(SortMode::Hot, &p, &hot) - 3.0).abs() < 1e-9);
        let q = Post::new("b", "s", DEFAULT_HOT_EPOCH_OFFSET).votes(0, 10);
        assert!((raw_score(SortMode::Hot, &q, &hot) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn controversy_edges() {
        assert_eq!(controversy(0, 0), 0.0);
        assert_eq!(controversy(5, 0), 1.0);
        assert!((controversy(10, 10) - 20.0).abs() < 1e-9);
        assert!((controversy(2, 8) - 10f64.powf(0.25)).abs() < 1e-9);
    }

    #[test]
    fn named_modes_validate() {
        let eng = RankingEngine::default();
        assert!(eng.rank_named("topMonth", vec![]).is_ok());
        assert_eq!(
            eng.rank_named("best", vec![]),
            Err(FeedError::InvalidSortMode("best".into()))
        );
    }

    #[test]
    fn extreme_vote_counts_rank_without_overflow() {
        let posts = vec![
            Post::new("max", "s", i64::MAX).votes(i64::MAX, -1),
            Post::new("min", "s", i64::MIN).votes(-1, i64::MAX),
            Post::new("plain", "t", 1_650_000_000).votes(3, 1),
        ];
        let engine = RankingEngine::default();
        for mode in ["new", "top", "hot", "active", "controversial"] {
            let out = engine.rank_named(mode, posts.clone()).unwrap();
            assert_eq!(out.len(), 3, "{mode}");
        }
        let top = engine.rank(SortMode::Top(None), posts);
        assert_eq!(top[0].id, "max");
    }
}
