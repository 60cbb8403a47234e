//! In-process cache for hot session records.
//!
//! Records are small and read on every send/receive; the cache saves a
//! database round-trip on busy sessions. Any write path MUST invalidate the
//! cached copy before touching the database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cache key: (owner, peer, device).
pub type SessionKey = (String, String, i64);

pub struct SessionCache {
    inner: Mutex<HashMap<SessionKey, (Vec<u8>, Instant)>>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Mutex::new(HashMap::new()), ttl }
    }

    pub fn get(&self, key: &SessionKey) -> Option<Vec<u8>> {
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        match map.get(key) {
            Some((record, inserted)) if inserted.elapsed() < self.ttl => Some(record.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: SessionKey, record: Vec<u8>) {
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        map.insert(key, (record, Instant::now()));
    }

    pub fn invalidate(&self, key: &SessionKey) {
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        map.remove(key);
    }

    /// Drop every entry for an owner (used by delete_all_keys).
    pub fn invalidate_owner(&self, owner: &str) {
        let mut map = self.inner.lock().expect("cache mutex poisoned");
        map.retain(|(o, _, _), _| o != owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        ("alice".into(), "bob".into(), 1)
    }

    #[test]
    fn put_get_invalidate() {
        let cache = SessionCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(&key()), None);
        cache.put(key(), vec![1, 2, 3]);
        assert_eq!(cache.get(&key()), Some(vec![1, 2, 3]));
        cache.invalidate(&key());
        assert_eq!(cache.get(&key()), None);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = SessionCache::new(Duration::from_millis(0));
        cache.put(key(), vec![9]);
        assert_eq!(cache.get(&key()), None);
    }

    #[test]
    fn owner_invalidation_is_scoped() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.put(("alice".into(), "bob".into(), 1), vec![1]);
        cache.put(("carol".into(), "bob".into(), 1), vec![2]);
        cache.invalidate_owner("alice");
        assert_eq!(cache.get(&("alice".into(), "bob".into(), 1)), None);
        assert_eq!(cache.get(&("carol".into(), "bob".into(), 1)), Some(vec![2]));
    }
}
