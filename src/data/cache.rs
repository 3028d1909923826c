use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::data::types::BracketQuote;

/// TTL cache for bracket boards keyed by event slug. Bounds market snapshot
/// staleness to one poll interval: a failed fetch can reuse the previous
/// board while it is still within TTL, after that the cycle has no board.
pub struct SnapshotCache {
    cache: DashMap<String, CachedBoard>,
    ttl: Duration,
}

struct CachedBoard {
    board: Vec<BracketQuote>,
    stored_at: Instant,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, slug: &str, board: Vec<BracketQuote>) {
        self.cache.insert(
            slug.to_string(),
            CachedBoard {
                board,
                stored_at: Instant::now(),
            },
        );
    }

    /// Get a board if not expired (evict on read).
    pub fn get(&self, slug: &str) -> Option<Vec<BracketQuote>> {
        let expired = match self.cache.get(slug) {
            Some(entry) => {
                if entry.stored_at.elapsed() > self.ttl {
                    true
                } else {
                    return Some(entry.board.clone());
                }
            }
            None => return None,
        };
        if expired {
            self.cache.remove(slug);
        }
        None
    }
}
