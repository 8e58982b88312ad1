//! # Feed Data Model
//! Posts, pages, sort modes and the structural feed key.
//!
//! Pages are content-addressed by their fetch key: once a page is observed
//! under a key it never changes. Feeds are identified by a [`FeedKey`] value
//! compared structurally (no string concatenation).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::FeedError;

/// A single listing item from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub source_id: String,
    /// unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub upvote_count: i64,
    #[serde(default)]
    pub downvote_count: i64,
    #[serde(default)]
    pub last_activity_timestamp: Option<i64>,
    #[serde(default)]
    pub pinned: bool,
    /// Author address, used to correlate locally published posts.
    #[serde(default)]
    pub author: Option<String>,
}

impl Post {
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            timestamp,
            upvote_count: 0,
            downvote_count: 0,
            last_activity_timestamp: None,
            pinned: false,
            author: None,
        }
    }

    pub fn votes(mut self, up: i64, down: i64) -> Self {
        self.upvote_count = up;
        self.downvote_count = down;
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn active_at(mut self, ts: i64) -> Self {
        self.last_activity_timestamp = Some(ts);
        self
    }

    pub fn by(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

/// One fetched batch of posts plus the link to the next batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Post>,
    #[serde(default)]
    pub next_page_key: Option<String>,
}

impl Page {
    pub fn new(items: Vec<Post>, next_page_key: Option<String>) -> Self {
        Self {
            items,
            next_page_key,
        }
    }
}

/// Window suffix of the `top` / `controversial` sort variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeWindow {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeWindow {
    fn as_str(self) -> &'static str {
        match self {
            TimeWindow::Hour => "Hour",
            TimeWindow::Day => "Day",
            TimeWindow::Week => "Week",
            TimeWindow::Month => "Month",
            TimeWindow::Year => "Year",
            TimeWindow::All => "All",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Hour" => TimeWindow::Hour,
            "Day" => TimeWindow::Day,
            "Week" => TimeWindow::Week,
            "Month" => TimeWindow::Month,
            "Year" => TimeWindow::Year,
            "All" => TimeWindow::All,
            _ => return None,
        })
    }
}

/// Ranking formula selector. Windowed variants rank like their base mode but
/// are distinct keys when looking up a source's first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SortMode {
    New,
    Hot,
    Active,
    Top(Option<TimeWindow>),
    Controversial(Option<TimeWindow>),
}

impl Default for SortMode {
    fn default() -> Self {
        SortMode::Hot
    }
}

static SORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>new|hot|active|top|controversial)(?P<window>Hour|Day|Week|Month|Year|All)?$")
        .expect("sort mode regex")
});

impl FromStr for SortMode {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FeedError::InvalidSortMode(s.to_string());
        let caps = SORT_RE.captures(s.trim()).ok_or_else(invalid)?;
        let window = caps.name("window").and_then(|m| TimeWindow::parse(m.as_str()));
        match (&caps["base"], window) {
            ("new", None) => Ok(SortMode::New),
            ("hot", None) => Ok(SortMode::Hot),
            ("active", None) => Ok(SortMode::Active),
            ("top", w) => Ok(SortMode::Top(w)),
            ("controversial", w) => Ok(SortMode::Controversial(w)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortMode::New => f.write_str("new"),
            SortMode::Hot => f.write_str("hot"),
            SortMode::Active => f.write_str("active"),
            SortMode::Top(w) => write!(f, "top{}", w.map(TimeWindow::as_str).unwrap_or("")),
            SortMode::Controversial(w) => {
                write!(f, "controversial{}", w.map(TimeWindow::as_str).unwrap_or(""))
            }
        }
    }
}

impl Serialize for SortMode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SortMode {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Structural identity of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    pub account_id: String,
    pub sort_mode: SortMode,
    pub source_ids: BTreeSet<String>,
    pub page_size: usize,
    pub filter_id: Option<String>,
}

impl FeedKey {
    pub fn new<I, S>(account_id: impl Into<String>, sort_mode: SortMode, sources: I, page_size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            account_id: account_id.into(),
            sort_mode,
            source_ids: sources.into_iter().map(Into::into).collect(),
            page_size,
            filter_id: None,
        }
    }

    /// Stable hex id used on the HTTP surface.
    pub fn feed_id(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        let mut out = String::with_capacity(24);
        for b in digest.iter().take(12) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} sources/{}",
            self.account_id,
            self.sort_mode,
            self.source_ids.len(),
            self.page_size
        )
    }
}

/// Predicate applied to the ranked buffered feed.
#[derive(Clone)]
pub struct FeedFilter {
    pub id: String,
    predicate: Arc<dyn Fn(&Post) -> bool + Send + Sync>,
}

impl FeedFilter {
    pub fn new(id: impl Into<String>, predicate: impl Fn(&Post) -> bool + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn accepts(&self, post: &Post) -> bool {
        (self.predicate)(post)
    }
}

impl fmt::Debug for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedFilter").field("id", &self.id).finish()
    }
}

/// Immutable description of a declared feed.
#[derive(Debug, Clone)]
pub struct FeedDefinition {
    pub key: FeedKey,
    pub buffer_low_water_mark: usize,
    pub filter: Option<FeedFilter>,
}

impl FeedDefinition {
    pub fn new(key: FeedKey, buffer_low_water_mark: usize) -> Self {
        Self {
            key,
            buffer_low_water_mark,
            filter: None,
        }
    }

    /// Attach a filter; its id becomes part of the key.
    pub fn with_filter(mut self, filter: FeedFilter) -> Self {
        self.key.filter_id = Some(filter.id.clone());
        self.filter = Some(filter);
        self
    }

    pub fn sort_mode(&self) -> SortMode {
        self.key.sort_mode
    }

    pub fn page_size(&self) -> usize {
        self.key.page_size
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.key.source_ids.iter().map(String::as_str)
    }
}

/// Current listing metadata of one source: first page key per sort mode,
/// optionally with the first page embedded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceListing {
    pub source_id: String,
    #[serde(default)]
    pub first_page_keys: HashMap<SortMode, String>,
    #[serde(default)]
    pub preloaded_pages: HashMap<SortMode, Page>,
}

impl SourceListing {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn with_first_page(mut self, sort: SortMode, key: impl Into<String>) -> Self {
        self.first_page_keys.insert(sort, key.into());
        self
    }

    pub fn with_preloaded(mut self, sort: SortMode, key: impl Into<String>, page: Page) -> Self {
        self.first_page_keys.insert(sort, key.into());
        self.preloaded_pages.insert(sort, page);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_modes_parse_and_display() {
        for raw in ["new", "hot", "active", "top", "topWeek", "controversial", "controversialAll"] {
            let m: SortMode = raw.parse().unwrap();
            assert_eq!(m.to_string(), raw);
        }
        assert_eq!("topDay".parse::<SortMode>().unwrap(), SortMode::Top(Some(TimeWindow::Day)));
    }

    #[test]
    fn unknown_sort_mode_is_rejected() {
        for raw in ["", "best", "newHour", "topdecade", "Hot"] {
            assert!(matches!(raw.parse::<SortMode>(), Err(FeedError::InvalidSortMode(_))));
        }
    }

    #[test]
    fn feed_key_sorts_and_dedups_sources() {
        let a = FeedKey::new("acc", SortMode::New, ["b", "a", "b"], 25);
        let b = FeedKey::new("acc", SortMode::New, ["a", "b"], 25);
        assert_eq!(a, b);
        assert_eq!(a.feed_id(), b.feed_id());
        let c = FeedKey::new("acc", SortMode::Hot, ["a", "b"], 25);
        assert_ne!(a.feed_id(), c.feed_id());
    }

    #[test]
    fn filter_id_is_part_of_key() {
        let key = FeedKey::new("acc", SortMode::New, ["a"], 25);
        let plain = FeedDefinition::new(key.clone(), 50);
        let filtered = FeedDefinition::new(key, 50).with_filter(FeedFilter::new("no-pins", |p| !p.pinned));
        assert_ne!(plain.key, filtered.key);
    }

    #[test]
    fn listing_json_uses_sort_mode_strings() {
        let l = SourceListing::new("s1").with_first_page(SortMode::Top(Some(TimeWindow::Week)), "k1");
        let js = serde_json::to_string(&l).unwrap();
        assert!(js.contains("\"topWeek\":\"k1\""), "{js}");
        let back: SourceListing = serde_json::from_str(&js).unwrap();
        assert_eq!(back, l);
    }
}
