//! # Seen-Token Set
//!
//! The transport delivers at least once; this set absorbs the duplicate
//! side of that contract. Claims are keyed by their unique token
//! identifier (`jti`), and the check is check-and-set: the first
//! observation records the id and reports "new", every later observation
//! reports "duplicate". Callers invoke it under the session-state lock, so
//! two concurrent deliveries of the same token resolve to exactly one
//! "new".
//!
//! Backed by a bounded LRU so the set cannot grow without limit over a
//! long-lived session; the default capacity is far beyond anything
//! interactive-rate chat produces before the oldest ids stop mattering.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Default bound on remembered token identifiers.
pub const DEFAULT_SEEN_CAPACITY: usize = 16 * 1024;

pub struct SeenTokens {
    cache: LruCache<String, ()>,
}

impl SeenTokens {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Check-and-set in one call. Returns `true` if `token_id` was already
    /// seen; records it and returns `false` otherwise.
    pub fn observe(&mut self, token_id: &str) -> bool {
        if self.cache.get(token_id).is_some() {
            return true;
        }
        self.cache.put(token_id.to_string(), ());
        false
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for SeenTokens {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_observation_is_new_second_is_duplicate() {
        let mut seen = SeenTokens::new();
        assert!(!seen.observe("t1"));
        assert!(seen.observe("t1"));
        assert!(seen.observe("t1"));
        assert!(!seen.observe("t2"));
    }

    #[test]
    fn concurrent_observations_yield_exactly_one_new() {
        // The set itself is guarded by the session-state lock in
        // production; reproduce that arrangement here.
        let seen = Arc::new(parking_lot::Mutex::new(SeenTokens::new()));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || {
                !seen.lock().observe("contended-token")
            }));
        }

        let fresh_count = handles
            .into_iter()
            .map(|h| h.join().expect("observer thread panicked"))
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(fresh_count, 1, "exactly one observer may see the token as new");
    }

    #[test]
    fn capacity_bounds_growth() {
        let mut seen = SeenTokens::with_capacity(4);
        for i in 0..100 {
            assert!(!seen.observe(&format!("t{i}")));
        }
        assert_eq!(seen.len(), 4);

        // Oldest ids have been evicted and would be re-admitted; recent
        // ones are still deduplicated.
        assert!(seen.observe("t99"));
        assert!(!seen.observe("t0"));
    }
}
