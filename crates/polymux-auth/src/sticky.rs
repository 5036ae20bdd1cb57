//! Sticky sessions: soft affinity between a client fingerprint and the auth
//! that last served it. Sharded to keep lock contention off the hot path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;
const MAX_ENTRIES_PER_SHARD: usize = 1024;
const STICKY_TTL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct StickyEntry {
    auth_id: String,
    last_used: Instant,
}

#[derive(Debug)]
pub struct StickyStore {
    shards: Vec<Mutex<HashMap<String, StickyEntry>>>,
}

impl Default for StickyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StickyStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, StickyEntry>> {
        let idx = polymux_common::fnv32a(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Look up and touch. Expired entries are treated as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.shard(key).lock().ok()?;
        let now = Instant::now();
        let entry = guard.get_mut(key)?;
        if now.duration_since(entry.last_used) > STICKY_TTL {
            guard.remove(key);
            return None;
        }
        entry.last_used = now;
        Some(entry.auth_id.clone())
    }

    pub fn set(&self, key: &str, auth_id: &str) {
        let Ok(mut guard) = self.shard(key).lock() else {
            return;
        };
        let now = Instant::now();
        if guard.len() >= MAX_ENTRIES_PER_SHARD && !guard.contains_key(key) {
            evict_oldest(&mut guard);
        }
        guard.insert(
            key.to_string(),
            StickyEntry {
                auth_id: auth_id.to_string(),
                last_used: now,
            },
        );
    }

    pub fn del(&self, key: &str) {
        if let Ok(mut guard) = self.shard(key).lock() {
            guard.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().map(|g| g.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries idle longer than the TTL. Called by the sweeper task and
    /// directly from tests.
    pub fn sweep(&self, now: Instant) {
        for shard in &self.shards {
            if let Ok(mut guard) = shard.lock() {
                guard.retain(|_, entry| now.duration_since(entry.last_used) <= STICKY_TTL);
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.sweep(Instant::now());
            }
        })
    }
}

fn evict_oldest(entries: &mut HashMap<String, StickyEntry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del() {
        let store = StickyStore::new();
        store.set("claude:fp1", "auth1");
        assert_eq!(store.get("claude:fp1").as_deref(), Some("auth1"));
        store.del("claude:fp1");
        assert_eq!(store.get("claude:fp1"), None);
    }

    #[test]
    fn keys_spread_across_shards() {
        let store = StickyStore::new();
        for i in 0..100 {
            store.set(&format!("provider:fp{i}"), &format!("auth{}", i % 10));
        }
        assert_eq!(store.len(), 100);
        let populated = store
            .shards
            .iter()
            .filter(|shard| !shard.lock().unwrap().is_empty())
            .count();
        assert!(populated > 1, "expected multiple shards in use");
    }

    #[test]
    fn capacity_pressure_evicts_oldest() {
        let store = StickyStore::new();
        let shard = &store.shards[0];
        {
            let mut guard = shard.lock().unwrap();
            let base = Instant::now();
            for i in 0..MAX_ENTRIES_PER_SHARD {
                guard.insert(
                    format!("key{i}"),
                    StickyEntry {
                        auth_id: "auth".to_string(),
                        // key0 is oldest
                        last_used: base - Duration::from_millis((MAX_ENTRIES_PER_SHARD - i) as u64),
                    },
                );
            }
        }

        // Find a key landing in shard 0 so the insert path sees the full shard.
        let key = (0..10_000)
            .map(|i| format!("probe{i}"))
            .find(|k| polymux_common::fnv32a(k) as usize % SHARD_COUNT == 0)
            .unwrap();
        store.set(&key, "fresh");

        let guard = shard.lock().unwrap();
        assert!(guard.len() <= MAX_ENTRIES_PER_SHARD);
        assert!(!guard.contains_key("key0"), "oldest entry should be evicted");
        assert!(guard.contains_key(&key));
    }

    #[test]
    fn sweep_removes_idle_entries() {
        let store = StickyStore::new();
        store.set("p:a", "auth1");
        store.sweep(Instant::now() + STICKY_TTL + Duration::from_secs(1));
        assert!(store.is_empty());
    }
}
