//! The cache engine (§4.C): typed entry store with TTL, stats, and lazy +
//! periodic expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mimoria_common::{TaggedValue, ValueShape};

use super::entry::Entry;
use super::stats::Stats;
use crate::error::{CacheError, SweeperError};
use crate::keylock::KeyLockTable;
use crate::pubsub::Hub;

/// How long one key's sweep step waits for its key lock before giving up on
/// it for this cycle (§4.C "Periodic sweep", §7 `SweeperError`). A key held
/// under heavy contention skips this tick rather than stalling the whole
/// sweep.
const SWEEP_LOCK_TIMEOUT: Duration = Duration::from_millis(200);

fn mismatch(expected: &'static str, actual: &ValueShape) -> CacheError {
    CacheError::ShapeMismatch {
        expected,
        actual: actual.kind_name(),
    }
}

/// The keyed entry store. `Arc<Cache>` is shared by every connection and
/// background task.
pub struct Cache {
    entries: DashMap<Vec<u8>, Entry>,
    locks: Arc<KeyLockTable>,
    pub stats: Stats,
    events: Arc<Hub>,
}

impl Cache {
    pub fn new(locks: Arc<KeyLockTable>, events: Arc<Hub>) -> Self {
        Self {
            entries: DashMap::new(),
            locks,
            stats: Stats::new(),
            events,
        }
    }

    /// Number of present keys, counting expired-but-not-reaped as present
    /// (§3 "size").
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Lazy-expiry check for a key already under lock (§4.C). If the entry
    /// is expired it is removed and the expiration is recorded and
    /// published; the caller sees it as missing either way.
    async fn reap_if_expired(&self, key: &[u8]) {
        let expired = self
            .entries
            .get(key)
            .map(|e| e.is_expired())
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            self.stats.record_expired();
            self.events.publish_expired_key(key).await;
        }
    }

    async fn acquire(&self, key: &[u8], take: bool) -> crate::keylock::Releaser {
        self.locks.acquire(key, take).await
    }

    // ---- string ----

    pub async fn get_string(&self, key: &[u8], take: bool) -> Result<Option<String>, CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get(key) {
            None => {
                self.stats.record_miss();
                Ok(None)
            }
            Some(e) => match &e.value {
                ValueShape::String(v) => {
                    self.stats.record_hit();
                    Ok(v.clone())
                }
                other => Err(mismatch("string", other)),
            },
        }
    }

    pub async fn set_string(&self, key: &[u8], value: Option<String>, ttl_ms: u64, take: bool) {
        let _g = self.acquire(key, take).await;
        self.entries
            .insert(key.to_vec(), Entry::new(ValueShape::String(value), ttl_ms));
    }

    // ---- bytes ----

    pub async fn get_bytes(&self, key: &[u8], take: bool) -> Result<Option<Vec<u8>>, CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get(key) {
            None => {
                self.stats.record_miss();
                Ok(None)
            }
            Some(e) => match &e.value {
                ValueShape::Bytes(v) => {
                    self.stats.record_hit();
                    Ok(v.clone())
                }
                other => Err(mismatch("bytes", other)),
            },
        }
    }

    pub async fn set_bytes(&self, key: &[u8], value: Option<Vec<u8>>, ttl_ms: u64, take: bool) {
        let _g = self.acquire(key, take).await;
        self.entries
            .insert(key.to_vec(), Entry::new(ValueShape::Bytes(value), ttl_ms));
    }

    // ---- list ----

    pub async fn get_list(&self, key: &[u8], take: bool) -> Result<Vec<String>, CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get(key) {
            None => {
                self.stats.record_miss();
                Ok(Vec::new())
            }
            Some(e) => match &e.value {
                ValueShape::List(items) => {
                    self.stats.record_hit();
                    Ok(items.clone())
                }
                other => Err(mismatch("list", other)),
            },
        }
    }

    pub async fn add_list(
        &self,
        key: &[u8],
        value: Option<String>,
        ttl_ms: u64,
        take: bool,
    ) -> Result<(), CacheError> {
        let value = value.ok_or(CacheError::NullElement)?;
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get_mut(key) {
            None => {
                self.entries
                    .insert(key.to_vec(), Entry::new(ValueShape::List(vec![value]), ttl_ms));
                Ok(())
            }
            Some(mut e) => match &mut e.value {
                ValueShape::List(items) => {
                    items.push(value);
                    Ok(())
                }
                other => Err(mismatch("list", &other.clone())),
            },
        }
    }

    pub async fn remove_list(
        &self,
        key: &[u8],
        value: Option<String>,
        take: bool,
    ) -> Result<(), CacheError> {
        let value = value.ok_or(CacheError::NullElement)?;
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        let mut became_empty = false;
        match self.entries.get_mut(key) {
            None => {}
            Some(mut e) => match &mut e.value {
                ValueShape::List(items) => {
                    if let Some(pos) = items.iter().position(|v| v == &value) {
                        items.remove(pos);
                    }
                    became_empty = items.is_empty();
                }
                other => return Err(mismatch("list", &other.clone())),
            },
        }
        if became_empty {
            self.entries.remove(key);
        }
        Ok(())
    }

    pub async fn contains_list(
        &self,
        key: &[u8],
        value: &str,
        take: bool,
    ) -> Result<bool, CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get(key) {
            None => {
                self.stats.record_miss();
                Ok(false)
            }
            Some(e) => match &e.value {
                ValueShape::List(items) => {
                    self.stats.record_hit();
                    Ok(items.iter().any(|v| v == value))
                }
                other => Err(mismatch("list", other)),
            },
        }
    }

    // ---- counter ----

    pub async fn set_counter(&self, key: &[u8], value: i64, take: bool) {
        let _g = self.acquire(key, take).await;
        self.entries
            .insert(key.to_vec(), Entry::new(ValueShape::Counter(value), 0));
    }

    pub async fn increment_counter(
        &self,
        key: &[u8],
        delta: i64,
        take: bool,
    ) -> Result<i64, CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get_mut(key) {
            None => {
                self.stats.record_miss();
                self.entries
                    .insert(key.to_vec(), Entry::new(ValueShape::Counter(delta), 0));
                Ok(delta)
            }
            Some(mut e) => match &mut e.value {
                ValueShape::Counter(n) => {
                    *n += delta;
                    self.stats.record_hit();
                    Ok(*n)
                }
                other => Err(mismatch("counter", &other.clone())),
            },
        }
    }

    // ---- map ----

    pub async fn get_map_value(
        &self,
        key: &[u8],
        sub: &str,
        take: bool,
    ) -> Result<TaggedValue, CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get(key) {
            None => {
                self.stats.record_miss();
                Ok(TaggedValue::Null)
            }
            Some(e) => match &e.value {
                ValueShape::Map(map) => {
                    self.stats.record_hit();
                    Ok(map.get(sub).cloned().unwrap_or(TaggedValue::Null))
                }
                other => Err(mismatch("map", other)),
            },
        }
    }

    /// `ttl_ms` is accepted on the wire but ignored here: only whole-map
    /// `set_map` accepts a container TTL. New maps are always created with
    /// infinite TTL regardless of the argument (§4.C, §9).
    pub async fn set_map_value(
        &self,
        key: &[u8],
        sub: &str,
        value: TaggedValue,
        take: bool,
    ) -> Result<(), CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get_mut(key) {
            None => {
                let mut map = HashMap::new();
                map.insert(sub.to_string(), value);
                self.entries
                    .insert(key.to_vec(), Entry::new(ValueShape::Map(map), 0));
                Ok(())
            }
            Some(mut e) => match &mut e.value {
                ValueShape::Map(map) => {
                    map.insert(sub.to_string(), value);
                    Ok(())
                }
                other => Err(mismatch("map", &other.clone())),
            },
        }
    }

    pub async fn get_map(
        &self,
        key: &[u8],
        take: bool,
    ) -> Result<HashMap<String, TaggedValue>, CacheError> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get(key) {
            None => {
                self.stats.record_miss();
                Ok(HashMap::new())
            }
            Some(e) => match &e.value {
                ValueShape::Map(map) => {
                    self.stats.record_hit();
                    Ok(map.clone())
                }
                other => Err(mismatch("map", other)),
            },
        }
    }

    pub async fn set_map(
        &self,
        key: &[u8],
        map: HashMap<String, TaggedValue>,
        ttl_ms: u64,
        take: bool,
    ) {
        let _g = self.acquire(key, take).await;
        self.entries
            .insert(key.to_vec(), Entry::new(ValueShape::Map(map), ttl_ms));
    }

    // ---- whole-object (GetObjectBinary / SetObjectBinary, §6) ----

    /// Fetch a key's value as its raw [`ValueShape`], whatever shape it
    /// currently holds. Unlike the typed getters this never shape-checks.
    pub async fn get_object(&self, key: &[u8], take: bool) -> Option<ValueShape> {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        match self.entries.get(key) {
            None => {
                self.stats.record_miss();
                None
            }
            Some(e) => {
                self.stats.record_hit();
                Some(e.value.clone())
            }
        }
    }

    /// Overwrite a key with an arbitrary [`ValueShape`], whatever shape it
    /// currently holds.
    pub async fn set_object(&self, key: &[u8], value: ValueShape, ttl_ms: u64, take: bool) {
        let _g = self.acquire(key, take).await;
        self.entries.insert(key.to_vec(), Entry::new(value, ttl_ms));
    }

    // ---- key-level ----

    pub async fn exists(&self, key: &[u8], take: bool) -> bool {
        let _g = self.acquire(key, take).await;
        self.reap_if_expired(key).await;
        self.entries.contains_key(key)
    }

    pub async fn delete(&self, key: &[u8], take: bool) {
        let _g = self.acquire(key, take).await;
        self.entries.remove(key);
    }

    // ---- replication / resync support ----

    /// Apply a full value shape directly, bypassing the key lock (used by
    /// the sync/async replicator's follower-apply path and by snapshot
    /// resync, §4.I — the leader already serializes mutations globally).
    pub fn apply_raw(&self, key: Vec<u8>, value: ValueShape, ttl_ms: u64) {
        self.entries.insert(key, Entry::new(value, ttl_ms));
    }

    pub fn apply_delete_raw(&self, key: &[u8]) {
        self.entries.remove(key);
    }

    /// Discard everything (used before applying a resync snapshot).
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Apply a counter delta directly, bypassing both the key lock and
    /// stats (follower-apply path for `IncrementCounter`, §4.I — the
    /// leader already serialized and counted this mutation).
    pub fn increment_counter_raw(&self, key: &[u8], delta: i64) {
        let mut entry = self
            .entries
            .entry(key.to_vec())
            .or_insert_with(|| Entry::new(ValueShape::Counter(0), 0));
        match &mut entry.value {
            ValueShape::Counter(n) => *n += delta,
            other => *other = ValueShape::Counter(delta),
        }
    }

    /// A consistent-at-a-point-in-time snapshot of every key's shape and
    /// remaining TTL, for follower resync (§4.I).
    pub fn snapshot(&self) -> Vec<(Vec<u8>, ValueShape, u64)> {
        self.entries
            .iter()
            .map(|e| {
                let entry = e.value();
                (e.key().clone(), entry.value.clone(), entry.remaining_ttl_ms())
            })
            .collect()
    }

    /// One key's sweep step: acquire its lock (bounded, so a contended key
    /// can't stall the whole cycle), reap it if expired. Returns whether it
    /// was reaped.
    async fn sweep_key(&self, key: &[u8]) -> Result<bool, SweeperError> {
        let _g = tokio::time::timeout(SWEEP_LOCK_TIMEOUT, self.locks.acquire(key, true))
            .await
            .map_err(|_| SweeperError(format!("timed out acquiring lock for key {:?}", String::from_utf8_lossy(key))))?;
        let expired = self.entries.get(key).map(|e| e.is_expired()).unwrap_or(false);
        if expired {
            self.entries.remove(key);
            self.stats.record_expired();
            self.events.publish_expired_key(key).await;
        }
        Ok(expired)
    }

    /// Background sweeper (§4.C "Periodic sweep"). Iterates a snapshot of
    /// keys taken at tick start; concurrent inserts after the snapshot are
    /// picked up on the next tick. A single key's error is logged and the
    /// sweep moves on to the next one (§7 `SweeperError`).
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let keys: Vec<Vec<u8>> = self.entries.iter().map(|e| e.key().clone()).collect();
            let mut swept = 0u64;
            for key in &keys {
                match self.sweep_key(key).await {
                    Ok(true) => swept += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "sweep cycle error"),
                }
            }
            tracing::debug!(scanned = keys.len(), swept, "sweep cycle complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration as StdDuration;

    fn new_cache() -> Cache {
        Cache::new(Arc::new(KeyLockTable::new()), Arc::new(Hub::new()))
    }

    #[tokio::test]
    async fn s1_set_then_get_string_with_no_ttl() {
        let c = new_cache();
        c.set_string(b"key", Some("Mimoria".into()), 0, true).await;
        assert_eq!(c.get_string(b"key", true).await.unwrap(), Some("Mimoria".into()));
    }

    #[tokio::test]
    async fn s2_string_expires_after_ttl() {
        let c = new_cache();
        c.set_string(b"key", Some("Mimoria".into()), 50, true).await;
        assert_eq!(c.get_string(b"key", true).await.unwrap(), Some("Mimoria".into()));
        tokio::time::sleep(StdDuration::from_millis(120)).await;
        assert_eq!(c.get_string(b"key", true).await.unwrap(), None);
        assert!(c.stats.expired_keys.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn s3_bytes_round_trip() {
        let c = new_cache();
        c.set_bytes(b"key", Some(vec![1, 2, 3, 4]), 0, true).await;
        assert_eq!(c.get_bytes(b"key", true).await.unwrap(), Some(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn s4_map_round_trip() {
        let c = new_cache();
        let mut map = HashMap::new();
        map.insert("one".to_string(), TaggedValue::F32(2.4));
        map.insert("two".to_string(), TaggedValue::F64(2.4));
        map.insert("three".to_string(), TaggedValue::String("value".into()));
        map.insert("four".to_string(), TaggedValue::Bool(true));
        map.insert(
            "five".to_string(),
            TaggedValue::Bytes(vec![1, 2, 3, 4]),
        );
        c.set_map(b"key", map.clone(), 0, true).await;
        assert_eq!(c.get_map(b"key", true).await.unwrap(), map);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s5_concurrent_increment_counter() {
        let c = Arc::new(new_cache());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10_000 {
                    c.increment_counter(b"key", 1, true).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(c.increment_counter(b"key", 0, true).await.unwrap(), 100_000);
        assert_eq!(c.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s6_add_remove_list_converges_to_empty() {
        let c = Arc::new(new_cache());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10_000 {
                    c.add_list(b"key", Some("v".into()), 0, true).await.unwrap();
                    c.remove_list(b"key", Some("v".into()), true).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(c.size(), 0);
    }

    #[tokio::test]
    async fn shape_mismatch_leaves_value_unchanged() {
        let c = new_cache();
        c.set_string(b"key", Some("v".into()), 0, true).await;
        let err = c.get_bytes(b"key", true).await.unwrap_err();
        assert!(matches!(err, CacheError::ShapeMismatch { .. }));
        assert_eq!(c.get_string(b"key", true).await.unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn null_list_element_is_rejected() {
        let c = new_cache();
        let err = c.add_list(b"key", None, 0, true).await.unwrap_err();
        assert_eq!(err, CacheError::NullElement);
        assert!(!c.exists(b"key", true).await);
    }

    #[tokio::test]
    async fn list_empties_and_deletes_key() {
        let c = new_cache();
        c.add_list(b"key", Some("v".into()), 0, true).await.unwrap();
        c.remove_list(b"key", Some("v".into()), true).await.unwrap();
        assert!(!c.exists(b"key", true).await);
    }

    #[tokio::test]
    async fn get_set_object_round_trips_any_shape() {
        let c = new_cache();
        assert!(c.get_object(b"key", true).await.is_none());
        c.set_object(b"key", ValueShape::Counter(9), 0, true).await;
        assert_eq!(c.get_object(b"key", true).await, Some(ValueShape::Counter(9)));
        c.set_object(b"key", ValueShape::List(vec!["a".into()]), 0, true).await;
        assert_eq!(
            c.get_object(b"key", true).await,
            Some(ValueShape::List(vec!["a".into()]))
        );
    }

    #[tokio::test]
    async fn hit_ratio_reflects_hits_and_misses() {
        let c = new_cache();
        c.get_string(b"missing", true).await.unwrap();
        c.set_string(b"key", Some("v".into()), 0, true).await;
        c.get_string(b"key", true).await.unwrap();
        c.get_string(b"key", true).await.unwrap();
        // 2 hits, 1 miss -> 0.67
        assert_eq!(c.stats.hit_ratio(), 0.67);
    }
}
