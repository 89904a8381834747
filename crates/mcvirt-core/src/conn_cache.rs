//! Connection pool for reusing streams to peer nodes.

use dashmap::DashMap;

/// A pool of open streams keyed by peer (`host:port`).
pub struct ConnCache<S> {
    pool: DashMap<String, Vec<S>>,
    max_per_peer: usize,
}

impl<S> ConnCache<S> {
    pub fn new(max_per_peer: usize) -> Self {
        Self {
            pool: DashMap::new(),
            max_per_peer,
        }
    }

    /// Get a cached stream to the given peer, or None.
    pub fn get(&self, key: &str) -> Option<S> {
        let mut entry = self.pool.get_mut(key)?;
        entry.pop()
    }

    /// Return a stream to the pool for reuse.
    pub fn put(&self, key: &str, stream: S) {
        let mut entry = self.pool.entry(key.to_string()).or_default();
        if entry.len() < self.max_per_peer {
            entry.push(stream);
        }
        // Drop the stream if pool is full
    }

    /// Clear all cached streams for a peer.
    pub fn clear_peer(&self, key: &str) {
        self.pool.remove(key);
    }

    pub fn clear_all(&self) {
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_is_bounded() {
        let cache: ConnCache<u32> = ConnCache::new(2);
        cache.put("n1:8070", 1);
        cache.put("n1:8070", 2);
        cache.put("n1:8070", 3);
        assert_eq!(cache.get("n1:8070"), Some(2));
        assert_eq!(cache.get("n1:8070"), Some(1));
        assert_eq!(cache.get("n1:8070"), None);
    }

    #[test]
    fn test_clear_peer() {
        let cache: ConnCache<u32> = ConnCache::new(4);
        cache.put("n1:8070", 1);
        cache.put("n2:8070", 2);
        cache.clear_peer("n1:8070");
        assert_eq!(cache.get("n1:8070"), None);
        assert_eq!(cache.get("n2:8070"), Some(2));
    }
}
