//! # Loaded Feed Window
//! The consumer-visible, append-only prefix of a buffered feed.

use std::collections::HashSet;

use crate::model::Post;

#[derive(Debug, Clone)]
pub struct LoadedFeedWindow {
    page_size: usize,
    requested_page_count: usize,
    items: Vec<Post>,
    ids: HashSet<String>,
}

impl LoadedFeedWindow {
    /// A window asking for `requested_page_count` pages up front; 0 makes a
    /// prefetch-only window.
    pub fn new(page_size: usize, requested_page_count: usize) -> Self {
        Self {
            page_size,
            requested_page_count,
            items: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn items(&self) -> &[Post] {
        &self.items
    }

    pub fn loaded_ids(&self) -> &HashSet<String> {
        &self.ids
    }

    pub fn requested_page_count(&self) -> usize {
        self.requested_page_count
    }

    pub fn target(&self) -> usize {
        self.requested_page_count * self.page_size
    }

    pub fn is_satisfied(&self) -> bool {
        self.items.len() >= self.target()
    }

    pub fn request_more(&mut self) {
        self.requested_page_count += 1;
    }

    /// Turn a prefetch-only window into a regular one. Returns whether it
    /// changed.
    pub fn upgrade(&mut self) -> bool {
        if self.requested_page_count == 0 {
            self.requested_page_count = 1;
            return true;
        }
        false
    }

    /// Move up to `target - len` posts from the front of `buffered` into the
    /// window. Returns how many were appended.
    pub fn advance(&mut self, buffered: &[Post]) -> usize {
        let want = self.target().saturating_sub(self.items.len());
        let mut added = 0;
        for post in buffered {
            if added == want {
                break;
            }
            if self.ids.insert(post.id.clone()) {
                self.items.push(post.clone());
                added += 1;
            }
        }
        added
    }
}
