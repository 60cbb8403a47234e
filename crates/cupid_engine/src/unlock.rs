//! In-process unlock cache.
//!
//! Opening sealed private keys requires the owner's passphrase, but several
//! operations (session initiation, scheduled replenishment and rotation)
//! arrive without one. Passphrase-bearing operations deposit the passphrase
//! here under a bounded TTL; consumers take a copy while it lasts. Entries
//! are zeroized when evicted or replaced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

struct Entry {
    passphrase: Zeroizing<String>,
    unlocked_at: Instant,
}

#[derive(Clone)]
pub struct UnlockCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    ttl: Duration,
}

impl UnlockCache {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), ttl }
    }

    pub fn insert(&self, user_id: &str, passphrase: &str) {
        let mut map = self.inner.lock().expect("unlock cache poisoned");
        map.insert(
            user_id.to_string(),
            Entry {
                passphrase: Zeroizing::new(passphrase.to_string()),
                unlocked_at: Instant::now(),
            },
        );
    }

    /// A copy of the cached passphrase, or None if absent or expired.
    pub fn get(&self, user_id: &str) -> Option<Zeroizing<String>> {
        let mut map = self.inner.lock().expect("unlock cache poisoned");
        match map.get(user_id) {
            Some(entry) if entry.unlocked_at.elapsed() < self.ttl => {
                Some(Zeroizing::new(entry.passphrase.to_string()))
            }
            Some(_) => {
                map.remove(user_id);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, user_id: &str) {
        let mut map = self.inner.lock().expect("unlock cache poisoned");
        map.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let cache = UnlockCache::new(Duration::from_secs(60));
        assert!(cache.get("u1").is_none());
        cache.insert("u1", "P@ssw0rd-Alpha-01");
        assert_eq!(cache.get("u1").unwrap().as_str(), "P@ssw0rd-Alpha-01");
        cache.remove("u1");
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = UnlockCache::new(Duration::from_millis(0));
        cache.insert("u1", "pw");
        assert!(cache.get("u1").is_none());
    }
}
