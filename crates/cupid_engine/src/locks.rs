//! Keyed async locks.
//!
//! A process-wide table of named mutexes: one per user for key lifecycle
//! operations, one per (owner, peer, device) for session read-modify-write.
//! Distinct keys proceed fully in parallel.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub struct KeyedLocks<K> {
    inner: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// The mutex for `key`, created on first use. Callers hold the returned
    /// Arc and `.lock().await` it for the duration of the critical section.
    pub fn get(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("lock table poisoned");
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
