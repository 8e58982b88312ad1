//! # Feed Assembler
//! Pure merge/rank/filter of every loaded page of a feed's sources, plus the
//! refill plan deciding which sources need another page.
//!
//! Nothing here fetches: [`FeedAssembler::refill_plan`] only says what to
//! load, the caller runs it against the [`PageChainFetcher`].

use std::collections::{HashMap, HashSet};

use crate::fetcher::{ChainSnapshot, PageChainFetcher};
use crate::model::{FeedDefinition, Post};
use crate::ranking::RankingEngine;

/// Chain state of one source of a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChain {
    pub source_id: String,
    pub snapshot: ChainSnapshot,
}

/// Ask the fetcher to extend `source_id` to `min_depth` pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefillRequest {
    pub source_id: String,
    pub min_depth: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeedAssembler {
    ranking: RankingEngine,
}

impl FeedAssembler {
    pub fn new(ranking: RankingEngine) -> Self {
        Self { ranking }
    }

    pub fn chains(&self, def: &FeedDefinition, fetcher: &PageChainFetcher) -> Vec<SourceChain> {
        def.source_ids()
            .map(|id| SourceChain {
                source_id: id.to_string(),
                snapshot: fetcher.snapshot(id, def.sort_mode()),
            })
            .collect()
    }

    /// Ranked, deduplicated posts of all chains, minus `loaded` ids and posts
    /// the feed filter rejects.
    pub fn compute_buffered_feed(
        &self,
        def: &FeedDefinition,
        chains: &[SourceChain],
        loaded: &HashSet<String>,
    ) -> Vec<Post> {
        let mut posts: Vec<Post> = Vec::new();
        let mut slot: HashMap<String, usize> = HashMap::new();
        let all = chains
            .iter()
            .flat_map(|c| c.snapshot.pages())
            .flat_map(|p| p.items.iter());
        for post in all {
            match slot.get(&post.id) {
                // a later sighting of the same id is the newer version
                Some(&i) => posts[i] = post.clone(),
                None => {
                    slot.insert(post.id.clone(), posts.len());
                    posts.push(post.clone());
                }
            }
        }

        let mut ranked = self.ranking.rank(def.sort_mode(), posts);
        ranked.retain(|p| !loaded.contains(&p.id));
        if let Some(filter) = &def.filter {
            ranked.retain(|p| filter.accepts(p));
        }
        ranked
    }

    /// More items can still appear: something is buffered, a source has no
    /// page yet, or some chain continues.
    pub fn compute_has_more(&self, chains: &[SourceChain], buffered: &[Post]) -> bool {
        if !buffered.is_empty() {
            return true;
        }
        chains.iter().any(|c| match &c.snapshot {
            ChainSnapshot::Unlisted => true,
            ChainSnapshot::Unsorted => false,
            ChainSnapshot::Pages { exhausted, .. } => !exhausted,
        })
    }

    /// Sources whose buffered count is at or below the low-water mark and
    /// whose chain continues get one more page.
    pub fn refill_plan(
        &self,
        def: &FeedDefinition,
        chains: &[SourceChain],
        buffered: &[Post],
    ) -> Vec<RefillRequest> {
        let counts = buffered_counts(buffered);
        chains
            .iter()
            .filter_map(|c| match &c.snapshot {
                ChainSnapshot::Pages { pages, exhausted: false } => {
                    let n = counts.get(c.source_id.as_str()).copied().unwrap_or(0);
                    (n <= def.buffer_low_water_mark).then(|| RefillRequest {
                        source_id: c.source_id.clone(),
                        min_depth: pages.len() + 1,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// True once any source has produced at least one page.
    pub fn any_page_loaded(&self, chains: &[SourceChain]) -> bool {
        chains.iter().any(|c| !c.snapshot.pages().is_empty())
    }
}

/// Buffered items per source id.
pub fn buffered_counts(buffered: &[Post]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for p in buffered {
        *counts.entry(p.source_id.as_str()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedFilter, FeedKey, Page, SortMode};

    fn def(sources: &[&str]) -> FeedDefinition {
        FeedDefinition::new(FeedKey::new("acc", SortMode::New, sources.iter().copied(), 25), 50)
    }

    fn chain(source: &str, pages: Vec<Page>, exhausted: bool) -> SourceChain {
        SourceChain {
            source_id: source.into(),
            snapshot: ChainSnapshot::Pages { pages, exhausted },
        }
    }

    fn page(source: &str, range: std::ops::RangeInclusive<i64>, next: Option<&str>) -> Page {
        let items = range.map(|t| Post::new(format!("{source}-{t}"), source, t)).collect();
        Page::new(items, next.map(String::from))
    }

    #[test]
    fn merges_ranks_and_drops_loaded() {
        let d = def(&["a", "b"]);
        let chains = vec![chain("a", vec![page("a", 1..=3, None)], true), chain("b", vec![page("b", 4..=5, None)], true)];
        let asm = FeedAssembler::default();

        let out = asm.compute_buffered_feed(&d, &chains, &HashSet::new());
        assert_eq!(out.len(), 5);
        // b-5 holds the largest share of its source's total
        assert_eq!(out[0].id, "b-5");

        let loaded: HashSet<String> = ["b-5".to_string()].into();
        let out = asm.compute_buffered_feed(&d, &chains, &loaded);
        assert!(out.iter().all(|p| p.id != "b-5"));
    }

    #[test]
    fn later_duplicate_replaces_earlier() {
        let d = def(&["a"]);
        let first = Page::new(vec![Post::new("x", "a", 1).votes(1, 0)], Some("k2".into()));
        let second = Page::new(vec![Post::new("x", "a", 1).votes(9, 0)], None);
        let chains = vec![chain("a", vec![first, second], true)];
        let out = FeedAssembler::default().compute_buffered_feed(&d, &chains, &HashSet::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].upvote_count, 9);
    }

    #[test]
    fn filter_applies_after_ranking() {
        let d = def(&["a"]).with_filter(FeedFilter::new("even", |p| p.timestamp % 2 == 0));
        let chains = vec![chain("a", vec![page("a", 1..=6, None)], true)];
        let out = FeedAssembler::default().compute_buffered_feed(&d, &chains, &HashSet::new());
        let ts: Vec<i64> = out.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![6, 4, 2]);
    }

    #[test]
    fn has_more_cases() {
        let asm = FeedAssembler::default();
        let unlisted = SourceChain {
            source_id: "a".into(),
            snapshot: ChainSnapshot::Unlisted,
        };
        let unsorted = SourceChain {
            source_id: "b".into(),
            snapshot: ChainSnapshot::Unsorted,
        };
        let open = chain("c", vec![page("c", 1..=1, Some("c2"))], false);
        let done = chain("d", vec![page("d", 1..=1, None)], true);
        let waiting = chain("e", vec![], false);
        let one = [Post::new("p", "d", 1)];

        assert!(!asm.compute_has_more(&[], &[]));
        assert!(asm.compute_has_more(&[unlisted], &[]));
        assert!(asm.compute_has_more(&[open], &[]));
        assert!(asm.compute_has_more(&[waiting], &[]));
        assert!(!asm.compute_has_more(&[done.clone(), unsorted], &[]));
        assert!(asm.compute_has_more(&[done], &one));
    }

    #[test]
    fn refill_only_at_or_below_low_water_mark() {
        let asm = FeedAssembler::default();
        let mut d = def(&["a", "b"]);
        d.buffer_low_water_mark = 2;
        let chains = vec![
            chain("a", vec![page("a", 1..=3, Some("a2"))], false),
            chain("b", vec![page("b", 1..=2, Some("b2"))], false),
        ];
        let buffered = asm.compute_buffered_feed(&d, &chains, &HashSet::new());
        let plan = asm.refill_plan(&d, &chains, &buffered);
        assert_eq!(
            plan,
            vec![RefillRequest {
                source_id: "b".into(),
                min_depth: 2
            }]
        );
    }
}
