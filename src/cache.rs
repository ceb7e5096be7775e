//! Large-result cache.
//!
//! Query results whose content is too big to return inline are stored
//! behind an opaque UUID handle and served back in fixed-size pages.
//! Pages are cut once at insertion, on character boundaries, so the same
//! `(handle, page)` always yields identical content until the entry
//! expires. Expiry is wall-clock TTL from creation; reads do not extend it.
//!
//! An expired handle answers [`CacheLookup::Expired`] once and
//! [`CacheLookup::NotFound`] afterwards. Handles are never reused.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachePage {
    pub handle: String,
    pub content: String,
    /// 1-based.
    pub page: usize,
    pub total_pages: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Page(CachePage),
    NotFound,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub expired_pending: usize,
}

struct Entry {
    pages: Vec<String>,
    bytes: usize,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Insertion order, for evicting the oldest entry at capacity.
    order: VecDeque<String>,
    /// Expired handles not yet reported as expired, with when they lapsed.
    expired: HashMap<String, Instant>,
}

pub struct ResultCache {
    ttl: Duration,
    page_size: usize,
    inline_threshold: usize,
    max_entries: usize,
    state: Mutex<State>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            page_size: config.page_size.max(1),
            inline_threshold: config.inline_threshold,
            max_entries: config.max_entries.max(1),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn inline_threshold(&self) -> usize {
        self.inline_threshold
    }

    /// Cache `content` if it is over the inline threshold (in bytes).
    pub fn put(&self, content: &str) -> Option<String> {
        if content.len() <= self.inline_threshold {
            return None;
        }
        Some(self.store(content))
    }

    /// Cache `content` unconditionally and return its new handle.
    pub fn store(&self, content: &str) -> String {
        let handle = Uuid::new_v4().to_string();
        let entry = Entry {
            pages: paginate(content, self.page_size),
            bytes: content.len(),
            expires_at: Instant::now() + self.ttl,
        };

        let mut state = self.state.lock();
        while state.entries.len() >= self.max_entries {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if state.entries.remove(&oldest).is_some() {
                debug!(handle = %oldest, "evicted oldest cache entry");
            }
        }
        state.entries.insert(handle.clone(), entry);
        state.order.push_back(handle.clone());
        handle
    }

    /// Page `page` (1-based) of `handle`. A page outside `1..=total_pages`
    /// of a live entry is a validation error.
    pub fn get(&self, handle: &str, page: usize) -> Result<CacheLookup> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.expired.remove(handle).is_some() {
            return Ok(CacheLookup::Expired);
        }
        let Some(entry) = state.entries.get(handle) else {
            return Ok(CacheLookup::NotFound);
        };
        if entry.expires_at <= now {
            state.entries.remove(handle);
            return Ok(CacheLookup::Expired);
        }

        let total_pages = entry.pages.len();
        if page == 0 || page > total_pages {
            return Err(FleetError::validation(format!(
                "page {} out of range 1..={}",
                page, total_pages
            )));
        }

        Ok(CacheLookup::Page(CachePage {
            handle: handle.to_string(),
            content: entry.pages[page - 1].clone(),
            page,
            total_pages,
            has_more: page < total_pages,
        }))
    }

    pub fn invalidate(&self, handle: &str) -> bool {
        let mut state = self.state.lock();
        state.expired.remove(handle);
        state.entries.remove(handle).is_some()
    }

    /// Move expired entries out. Returns how many expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();

        let lapsed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in &lapsed {
            state.entries.remove(handle);
            state.expired.insert(handle.clone(), now);
        }

        // Forget expiry notices nobody asked about within another TTL.
        let ttl = self.ttl;
        state
            .expired
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        let State { entries, order, .. } = &mut *state;
        order.retain(|h| entries.contains_key(h));

        lapsed.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            loop {
                ticker.tick().await;
                let swept = cache.sweep();
                if swept > 0 {
                    debug!(swept, "expired cache entries");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.entries.values().map(|e| e.bytes).sum(),
            expired_pending: state.expired.len(),
        }
    }
}

/// Split into pages of at most `page_size` characters.
fn paginate(content: &str, page_size: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in content.chars() {
        current.push(ch);
        count += 1;
        if count == page_size {
            pages.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() || pages.is_empty() {
        pages.push(current);
    }
    pages
}
