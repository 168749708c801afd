//! Notification deduplication.
//!
//! The upstream platform redelivers notifications (same `message_id`) when it
//! is not sure a client saw them, most visibly across a reconnect. This cache
//! remembers recently delivered ids:
//! - TTL-based expiry of old entries
//! - Size-based eviction of the oldest entry to prevent unbounded growth
//! - O(1) duplicate detection

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DedupConfig;

/// Recently seen message ids.
#[derive(Debug)]
pub struct DeduplicationCache {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl DeduplicationCache {
    /// Create a new deduplication cache
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            max_size,
            ttl,
        }
    }

    /// Create a deduplication cache from configuration
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.max_size, config.ttl)
    }

    /// Check if `message_id` was seen within the TTL; records it if not.
    pub fn is_duplicate(&mut self, message_id: &str) -> bool {
        let now = Instant::now();
        self.cleanup_expired(now);

        if self.seen.contains_key(message_id) {
            return true;
        }

        self.seen.insert(message_id.to_string(), now);
        self.order.push_back((message_id.to_string(), now));
        self.maintain_size_limit();
        false
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    fn cleanup_expired(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.seen.remove(&id);
            }
        }
    }

    fn maintain_size_limit(&mut self) {
        while self.seen.len() > self.max_size {
            match self.order.pop_front() {
                Some((id, _)) => {
                    self.seen.remove(&id);
                }
                None => break,
            }
        }
    }
}
