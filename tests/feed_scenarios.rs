// tests/feed_scenarios.rs
//
// End-to-end behaviour of FeedsService over in-memory sources:
// merge order, low-water-mark refill, fetch dedup across feeds, has_more and
// window monotonicity.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use community_feed::assembler::FeedAssembler;
use community_feed::cache::store::MemoryStoreFactory;
use community_feed::cache::PageCache;
use community_feed::fetcher::PageChainFetcher;
use community_feed::providers::fixture::FixtureSources;
use community_feed::{FeedDefinition, FeedKey, FeedsService, Page, Post, SortMode, SourceListing};

async fn service(src: &Arc<FixtureSources>) -> FeedsService {
    let cache = Arc::new(PageCache::open("scenarios", 500, &MemoryStoreFactory::new()).await);
    let fetcher = Arc::new(PageChainFetcher::new(src.clone(), cache));
    FeedsService::new(fetcher, src.clone(), FeedAssembler::default())
}

fn feed(sources: &[&str], sort: SortMode, page_size: usize) -> FeedDefinition {
    FeedDefinition::new(FeedKey::new("acc", sort, sources.iter().copied(), page_size), 50)
}

/// One page of posts with timestamps `ts`, keyed `<source>-<ts>`.
fn page_of(source: &str, ts: impl Iterator<Item = i64>, next: Option<&str>) -> Page {
    let items = ts.map(|t| Post::new(format!("{source}-{t}"), source, t)).collect();
    Page::new(items, next.map(String::from))
}

fn ids(posts: &[Post]) -> Vec<String> {
    posts.iter().map(|p| p.id.clone()).collect()
}

#[tokio::test]
async fn two_sources_merge_by_timestamp_in_pages_of_25() {
    let src = Arc::new(FixtureSources::new());
    for s in ["a", "b"] {
        src.add_page(s, &format!("{s}-p1"), page_of(s, 1..=100, None));
        src.set_listing(SourceListing::new(s).with_first_page(SortMode::New, format!("{s}-p1")));
    }
    let svc = service(&src).await;
    let key = svc.declare_feed(feed(&["a", "b"], SortMode::New, 25));
    svc.sync(&key).await.unwrap();

    let first = svc.current_items(&key).unwrap();
    assert_eq!(first.len(), 25);
    let mut expected = Vec::new();
    for t in (88..=100).rev() {
        expected.push(format!("a-{t}"));
        expected.push(format!("b-{t}"));
    }
    expected.truncate(25);
    assert_eq!(ids(&first), expected);

    svc.request_more(&key).unwrap();
    let second = svc.current_items(&key).unwrap();
    assert_eq!(second.len(), 50);
    assert_eq!(&second[..25], &first[..]);
    assert_eq!(second[25].id, "b-88");
    assert!(second.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    let unique: HashSet<&str> = second.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(unique.len(), 50);

    // single-page chains are exhausted: nothing else was fetched
    svc.sync(&key).await.unwrap();
    assert_eq!(src.fetch_count(), 2);
}

#[tokio::test]
async fn low_water_mark_pulls_exactly_one_more_page() {
    let src = Arc::new(FixtureSources::new());
    src.add_page("a", "k1", page_of("a", 141..=200, Some("k2")));
    src.add_page("a", "k2", page_of("a", 81..=140, Some("k3")));
    src.add_page("a", "k3", page_of("a", 21..=80, None));
    src.set_listing(SourceListing::new("a").with_first_page(SortMode::New, "k1"));
    let svc = service(&src).await;
    let key = svc.declare_feed(feed(&["a"], SortMode::New, 25));

    svc.sync(&key).await.unwrap();
    assert_eq!(src.fetch_count(), 1);
    // 60 fetched, 25 loaded, 35 buffered: at or below 50
    assert_eq!(svc.buffered_feed(&key).unwrap().len(), 35);

    svc.sync(&key).await.unwrap();
    assert_eq!(src.fetches_of("k2"), 1);
    assert_eq!(src.fetches_of("k3"), 0);
    assert_eq!(svc.buffered_feed(&key).unwrap().len(), 95);

    // well above the mark now
    svc.sync(&key).await.unwrap();
    assert_eq!(src.fetch_count(), 2);
    assert!(svc.has_more(&key).unwrap());
}

#[tokio::test]
async fn feeds_sharing_a_source_fetch_each_page_once() {
    let src = Arc::new(FixtureSources::new());
    src.add_chain("a", SortMode::New, 2, 10);
    src.add_chain("b", SortMode::New, 1, 10);
    let svc = service(&src).await;

    let k1 = svc.declare_feed(feed(&["a"], SortMode::New, 5));
    let k2 = svc.declare_feed(feed(&["a", "b"], SortMode::New, 5));
    let (r1, r2) = tokio::join!(svc.sync(&k1), svc.sync(&k2));
    r1.unwrap();
    r2.unwrap();
    svc.sync(&k1).await.unwrap();
    svc.sync(&k2).await.unwrap();

    assert_eq!(src.fetches_of("a-new-1"), 1);
    assert_eq!(src.fetches_of("a-new-2"), 1);
    assert_eq!(src.fetches_of("b-new-1"), 1);
}

#[tokio::test]
async fn has_more_turns_false_only_when_everything_is_loaded() {
    let src = Arc::new(FixtureSources::new());
    src.add_chain("a", SortMode::Hot, 2, 4);
    let svc = service(&src).await;
    let key = svc.declare_feed(feed(&["a", "late"], SortMode::Hot, 4));

    svc.sync(&key).await.unwrap();
    // "late" has no listing yet
    assert!(svc.has_more(&key).unwrap());

    src.set_listing(SourceListing::new("late"));
    for _ in 0..4 {
        svc.sync(&key).await.unwrap();
        let _ = svc.request_more(&key);
    }
    assert_eq!(svc.current_items(&key).unwrap().len(), 8);
    assert!(svc.buffered_feed(&key).unwrap().is_empty());
    assert!(!svc.has_more(&key).unwrap());
}

#[tokio::test]
async fn feed_without_sources_has_nothing_more() {
    let src = Arc::new(FixtureSources::new());
    let svc = service(&src).await;
    let key = svc.declare_feed(feed(&[], SortMode::New, 5));
    svc.sync(&key).await.unwrap();
    assert!(!svc.has_more(&key).unwrap());
}

#[tokio::test]
async fn loaded_window_only_grows_and_never_reorders() {
    let mut rng = StdRng::seed_from_u64(7);
    let src = Arc::new(FixtureSources::new());
    for s in ["a", "b", "c"] {
        let pages = 4;
        for i in 1..=pages {
            let items = (0..20)
                .map(|j| {
                    Post::new(format!("{s}-{i}-{j}"), s, rng.random_range(1_000..2_000))
                        .votes(rng.random_range(0..50), rng.random_range(0..50))
                })
                .collect();
            let next = (i < pages).then(|| format!("{s}{}", i + 1));
            src.add_page(s, &format!("{s}{i}"), Page::new(items, next));
        }
        src.set_listing(SourceListing::new(s).with_first_page(SortMode::Top(None), format!("{s}1")));
    }
    let svc = service(&src).await;
    let key = svc.declare_feed(feed(&["a", "b", "c"], SortMode::Top(None), 10));

    let mut seen: Vec<Post> = Vec::new();
    for round in 0..20 {
        svc.sync(&key).await.unwrap();
        if round % 2 == 0 {
            svc.request_more(&key).unwrap();
        }
        let now = svc.current_items(&key).unwrap();
        assert!(now.len() >= seen.len());
        assert_eq!(&now[..seen.len()], &seen[..]);
        let unique: HashSet<&str> = now.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(unique.len(), now.len());
        seen = now;
    }
    // one initial page plus ten requests
    assert_eq!(seen.len(), 110);
}
