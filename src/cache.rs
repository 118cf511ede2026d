use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use crate::clock::Clock;

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: u64,
}

/// Time-bounded view of values owned by some other store. Entries are never
/// authoritative; readers fall back to the store once an entry expires.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    ttl_seconds: u64,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_seconds,
            clock,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_epoch_seconds();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        if now >= entry.expires_at {
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        if self.ttl_seconds == 0 {
            return;
        }
        let expires_at = self.clock.now_epoch_seconds().saturating_add(self.ttl_seconds);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, CacheEntry { value, expires_at });
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }
}
