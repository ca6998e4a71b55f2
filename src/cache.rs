//! Bounded TTL cache for reconstructed journeys.
//!
//! Purely an optimisation: entries expire after `ttl`, the oldest insertion is evicted once
//! `max_entries` is reached, and any miss goes straight to the store. Misses ("rank not
//! found") are never cached.

use crate::analysis::journey::{JourneyRequest, RankJourney};
use crate::config::CacheConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct Entry {
    journey: RankJourney,
    inserted_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<JourneyRequest, Entry>,
    order: VecDeque<(JourneyRequest, Instant)>,
    hits: u64,
    misses: u64,
}

pub struct JourneyCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
}

/// Hit/miss counters for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl JourneyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries,
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, Duration::from_secs(config.ttl_secs))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0 && !self.ttl.is_zero()
    }

    pub fn get(&self, key: &JourneyRequest) -> Option<RankJourney> {
        if !self.is_enabled() {
            return None;
        }
        let mut inner = self.inner.lock();
        let expired = inner
            .entries
            .get(key)
            .map(|e| e.inserted_at.elapsed() > self.ttl);
        let fresh = match expired {
            Some(false) => inner.entries.get(key).map(|e| e.journey.clone()),
            Some(true) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };
        if fresh.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        fresh
    }

    pub fn insert(&self, key: JourneyRequest, journey: RankJourney) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();

        while inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            let Some((oldest, stamp)) = inner.order.pop_front() else {
                break;
            };
            // Skip queue slots left behind by re-inserted or expired keys.
            let current = inner.entries.get(&oldest).map(|e| e.inserted_at);
            if current == Some(stamp) {
                inner.entries.remove(&oldest);
            }
        }

        inner.order.push_back((key.clone(), now));
        inner.entries.insert(
            key,
            Entry {
                journey,
                inserted_at: now,
            },
        );

        // Bound the order queue when the same keys are refreshed repeatedly.
        if inner.order.len() > self.max_entries.saturating_mul(2) {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, stamp)| entries.get(k).map(|e| e.inserted_at) == Some(*stamp));
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}
