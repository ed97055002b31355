//! Key/value cache seam used for the ephemeral state projection.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::StoreResult;

/// String key/value store with TTLs and integer set membership.
///
/// Mirrors the subset of a Redis-style cache the projection needs. Expiry is
/// the designed staleness signal: a record whose TTL is not refreshed while
/// its account is live silently disappears.
pub trait ProjectionCache: Send + Sync {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn delete(&self, key: &str) -> StoreResult<()>;
    /// Refresh the TTL of an existing key; a no-op for missing keys.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
    fn set_add(&self, key: &str, member: i64) -> StoreResult<()>;
    fn set_remove(&self, key: &str, member: i64) -> StoreResult<()>;
    fn set_members(&self, key: &str) -> StoreResult<Vec<i64>>;
}

enum Value {
    Text(String),
    Set(HashSet<i64>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|deadline| Instant::now() < deadline)
    }
}

/// In-process reference implementation backing tests and the demo binary.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_entry<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|entry| !entry.live()) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }
}

impl ProjectionCache for MemoryCache {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.with_live_entry(key, |entry| {
            entry.and_then(|entry| match &entry.value {
                Value::Text(text) => Some(text.clone()),
                Value::Set(_) => None,
            })
        }))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.with_live_entry(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    fn set_add(&self, key: &str, member: i64) -> StoreResult<()> {
        self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.insert(member);
            }
            _ => {}
        });
        let mut entries = self.entries.lock().unwrap();
        entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::from([member])),
            expires_at: None,
        });
        Ok(())
    }

    fn set_remove(&self, key: &str, member: i64) -> StoreResult<()> {
        self.with_live_entry(key, |entry| {
            if let Some(Entry {
                value: Value::Set(set),
                ..
            }) = entry
            {
                set.remove(&member);
            }
        });
        Ok(())
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<i64>> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.iter().copied().collect(),
            _ => Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete_round_trip() {
        let cache = MemoryCache::new();
        cache.set("a", "1", None).unwrap();
        assert_eq!(cache.get("a").unwrap().as_deref(), Some("1"));
        cache.delete("a").unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
    }

    #[test]
    fn expired_keys_vanish() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Some(Duration::ZERO)).unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
    }

    #[test]
    fn expire_refreshes_existing_keys_only() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Some(Duration::ZERO)).unwrap();
        cache.expire("a", Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("a").unwrap(), None);

        cache.set("b", "1", Some(Duration::from_secs(60))).unwrap();
        cache.expire("b", Duration::from_secs(120)).unwrap();
        assert_eq!(cache.get("b").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn set_membership() {
        let cache = MemoryCache::new();
        cache.set_add("s", 1).unwrap();
        cache.set_add("s", 2).unwrap();
        let mut members = cache.set_members("s").unwrap();
        members.sort_unstable();
        assert_eq!(members, vec![1, 2]);
        cache.set_remove("s", 1).unwrap();
        assert_eq!(cache.set_members("s").unwrap(), vec![2]);
    }
}
