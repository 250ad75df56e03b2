//! In-process [`KeyValueStore`] implementation.
//!
//! Single-node deployments and the test suite use this instead of Redis.
//! Expiry is evaluated lazily against the injected [`Clock`], so tests can
//! drive TTL behavior with a manual clock instead of sleeping.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::KeyValueStore;
use crate::{errors::CoreResult, time::Clock};

#[derive(Debug, Clone)]
enum Entry {
    Str {
        value: String,
        expires_at: Option<DateTime<Utc>>,
    },
    Set(HashSet<String>),
    Sorted(BTreeSet<(i64, String)>),
    List(Vec<String>),
}

/// Hash-map backed KV with lazy expiry.
pub struct MemoryKv {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| {
            self.clock.now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)
        })
    }

    /// Drops the entry when it is an expired string; returns whether the
    /// key is live afterwards.
    fn prune(&self, entries: &mut HashMap<String, Entry>, key: &str) -> bool {
        if let Some(Entry::Str {
            expires_at: Some(expires_at),
            ..
        }) = entries.get(key)
        {
            if *expires_at <= self.clock.now() {
                entries.remove(key);
                return false;
            }
        }
        entries.contains_key(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        if !self.prune(&mut entries, key) {
            return Ok(None);
        }
        Ok(match entries.get(key) {
            Some(Entry::Str { value, .. }) => Some(value.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().expect("kv poisoned");
        entries.insert(
            key.to_string(),
            Entry::Str {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        let expires_at = self.expiry(Some(ttl));
        let mut entries = self.entries.lock().expect("kv poisoned");
        if self.prune(&mut entries, key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry::Str {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        Ok(entries.remove(key).is_some())
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> CoreResult<bool> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        if !self.prune(&mut entries, key) {
            return Ok(false);
        }
        let matches = matches!(
            entries.get(key),
            Some(Entry::Str { value: held, .. }) if held == value
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_value(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        let expires_at = self.expiry(Some(ttl));
        let mut entries = self.entries.lock().expect("kv poisoned");
        if !self.prune(&mut entries, key) {
            return Ok(false);
        }
        match entries.get_mut(key) {
            Some(Entry::Str {
                value: held,
                expires_at: slot,
            }) if held == value => {
                *slot = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(HashSet::new()));
        if let Entry::Set(set) = entry {
            set.insert(member.to_string());
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        if let Some(Entry::Set(set)) = entries.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> CoreResult<Vec<String>> {
        let entries = self.entries.lock().expect("kv poisoned");
        Ok(match entries.get(key) {
            Some(Entry::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Sorted(BTreeSet::new()));
        if let Entry::Sorted(sorted) = entry {
            sorted.retain(|(_, m)| m != member);
            sorted.insert((score, member.to_string()));
        }
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        if let Some(Entry::Sorted(sorted)) = entries.get_mut(key) {
            sorted.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn sorted_range_to(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> CoreResult<Vec<String>> {
        let entries = self.entries.lock().expect("kv poisoned");
        Ok(match entries.get(key) {
            Some(Entry::Sorted(sorted)) => sorted
                .iter()
                .take_while(|(score, _)| *score <= max_score)
                .take(limit)
                .map(|(_, member)| member.clone())
                .collect(),
            _ => Vec::new(),
        })
    }

    async fn list_push(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()));
        if let Entry::List(list) = entry {
            list.push(value.to_string());
        }
        Ok(())
    }

    async fn list_range(&self, key: &str) -> CoreResult<Vec<String>> {
        let entries = self.entries.lock().expect("kv poisoned");
        Ok(match entries.get(key) {
            Some(Entry::List(list)) => list.clone(),
            _ => Vec::new(),
        })
    }

    async fn list_remove(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock().expect("kv poisoned");
        if let Some(Entry::List(list)) = entries.get_mut(key) {
            list.retain(|v| v != value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn kv_with_clock() -> (MemoryKv, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (MemoryKv::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_ttl_expiry_uses_the_clock() {
        let (kv, clock) = kv_with_clock();
        kv.set("k", "v", Some(Duration::from_secs(10)))
            .await
            .expect("set");

        assert_eq!(kv.get("k").await.expect("get"), Some("v".to_string()));
        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(kv.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_set_nx_respects_live_and_expired_keys() {
        let (kv, clock) = kv_with_clock();
        assert!(kv.set_nx("lock", "a", Duration::from_secs(5)).await.expect("nx"));
        assert!(!kv.set_nx("lock", "b", Duration::from_secs(5)).await.expect("nx"));

        clock.advance(chrono::Duration::seconds(6));
        assert!(kv.set_nx("lock", "b", Duration::from_secs(5)).await.expect("nx"));
    }

    #[tokio::test]
    async fn test_delete_if_value_checks_ownership() {
        let (kv, _clock) = kv_with_clock();
        kv.set("lock", "owner-a", None).await.expect("set");

        assert!(!kv.delete_if_value("lock", "owner-b").await.expect("del"));
        assert!(kv.delete_if_value("lock", "owner-a").await.expect("del"));
        assert_eq!(kv.get("lock").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_sorted_set_orders_by_score() {
        let (kv, _clock) = kv_with_clock();
        kv.sorted_add("idx", 300, "c").await.expect("add");
        kv.sorted_add("idx", 100, "a").await.expect("add");
        kv.sorted_add("idx", 200, "b").await.expect("add");

        let due = kv.sorted_range_to("idx", 250, 10).await.expect("range");
        assert_eq!(due, vec!["a".to_string(), "b".to_string()]);

        // Rescoring replaces the old entry.
        kv.sorted_add("idx", 50, "b").await.expect("add");
        let due = kv.sorted_range_to("idx", 99, 10).await.expect("range");
        assert_eq!(due, vec!["b".to_string()]);
    }
}
