//! Bounded set of recently processed message ids.
//!
//! The platform delivers at-least-once; retried deliveries are dropped here
//! before they reach the batching queue. Eviction is approximate: once the
//! cap is exceeded the oldest entries go, and a re-delivery of an evicted id
//! is absorbed by the idempotent handling downstream.

use relay_channels::MessageId;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

const DEDUP_CAPACITY: usize = 1000;
const DEDUP_EVICT_BATCH: usize = 100;

pub struct DedupCache {
    inner: Mutex<DedupInner>,
    capacity: usize,
    evict_batch: usize,
}

struct DedupInner {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::with_capacity(DEDUP_CAPACITY, DEDUP_EVICT_BATCH)
    }
}

impl DedupCache {
    pub fn with_capacity(capacity: usize, evict_batch: usize) -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity,
            evict_batch: evict_batch.max(1),
        }
    }

    /// Returns true if the id was already seen; otherwise records it and
    /// returns false.
    pub fn seen(&self, message_id: &MessageId) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.seen.contains(message_id) {
            return true;
        }
        inner.seen.insert(message_id.clone());
        inner.order.push_back(message_id.clone());

        if inner.order.len() > self.capacity {
            for _ in 0..self.evict_batch {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.seen.remove(&oldest);
            }
            tracing::debug!(
                remaining = inner.order.len(),
                "dedup cache evicted oldest entries"
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_reported() {
        let cache = DedupCache::default();
        let id = MessageId::new("mid.1");
        assert!(!cache.seen(&id));
        assert!(cache.seen(&id));
        assert!(cache.seen(&id));
    }

    #[test]
    fn eviction_bounds_the_cache_and_forgets_oldest() {
        let cache = DedupCache::with_capacity(10, 3);
        for i in 0..11 {
            assert!(!cache.seen(&MessageId::new(format!("mid.{i}"))));
        }
        // The three oldest were dropped; re-seeing one registers as new.
        assert!(!cache.seen(&MessageId::new("mid.0")));
        // A recent one is still present.
        assert!(cache.seen(&MessageId::new("mid.9")));
    }
}
