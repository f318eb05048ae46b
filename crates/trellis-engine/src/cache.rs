//! Bounded output cache.
//!
//! Holds node outputs for one execution, keyed by node id, with
//! least-recently-used eviction. Entries marked persistent are exempt from
//! eviction; when every entry is persistent the cache grows past its bound
//! rather than failing the writer.
//!
//! Recency is tracked with a monotonic logical tick instead of wall time so
//! that eviction tie-breaking is deterministic. The cache uses interior
//! mutability and is shared across concurrently executing nodes of a run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::EngineError;

/// A cached node output.
#[derive(Debug, Clone)]
struct CacheEntry {
  value: Arc<Value>,
  /// Last-touch tick (write or read), the sole LRU ordering key.
  touched: u64,
  /// Persistent entries are never auto-evicted. Monotonic once set.
  persistent: bool,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub size: usize,
  pub max_size: usize,
  pub hits: u64,
  pub misses: u64,
  pub hit_rate: f64,
  pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
  entries: HashMap<String, CacheEntry>,
  clock: u64,
  hits: u64,
  misses: u64,
  evictions: u64,
}

impl CacheInner {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  /// Evict the oldest non-persistent entry, if any.
  fn evict_oldest(&mut self) -> Option<String> {
    let key = self
      .entries
      .iter()
      .filter(|(_, e)| !e.persistent)
      .min_by_key(|(_, e)| e.touched)
      .map(|(k, _)| k.clone())?;
    self.entries.remove(&key);
    self.evictions += 1;
    Some(key)
  }

  fn insert(&mut self, key: String, value: Value, persistent: bool, touched: u64, max_size: usize) {
    if let Some(entry) = self.entries.get_mut(&key) {
      entry.value = Arc::new(value);
      entry.touched = touched;
      // Persistence only ever upgrades.
      entry.persistent = entry.persistent || persistent;
      return;
    }

    if self.entries.len() >= max_size && self.evict_oldest().is_none() {
      warn!(
        key = %key,
        size = self.entries.len(),
        max_size,
        "output cache over capacity: all entries persistent, inserting anyway"
      );
    }

    self.entries.insert(
      key,
      CacheEntry {
        value: Arc::new(value),
        touched,
        persistent,
      },
    );
  }
}

/// Bounded LRU store of node outputs.
pub struct OutputCache {
  inner: Mutex<CacheInner>,
  max_size: usize,
  clone_on_get: bool,
}

impl OutputCache {
  /// Create a cache bounded to `max_size` non-persistent entries.
  ///
  /// # Errors
  /// Fails with a configuration error when `max_size` is zero.
  pub fn new(max_size: usize) -> Result<Self, EngineError> {
    Self::with_options(max_size, false)
  }

  /// Create a cache, choosing whether [`get`](Self::get) hands out a shared
  /// snapshot or a detached deep copy.
  pub fn with_options(max_size: usize, clone_on_get: bool) -> Result<Self, EngineError> {
    if max_size < 1 {
      return Err(EngineError::configuration(
        "output cache max_size must be at least 1",
      ));
    }
    Ok(Self {
      inner: Mutex::new(CacheInner::default()),
      max_size,
      clone_on_get,
    })
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
    // A poisoned lock still holds consistent data; the critical sections
    // below never leave entries half-written.
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Store a node output, evicting the least-recently-used non-persistent
  /// entry if the cache is full. Updating an existing key refreshes its
  /// recency and may upgrade (never downgrade) its persistence.
  pub fn set(&self, key: impl Into<String>, value: Value, persistent: bool) {
    let mut inner = self.lock();
    let touched = inner.tick();
    inner.insert(key.into(), value, persistent, touched, self.max_size);
  }

  /// Look up a node output, refreshing its recency.
  ///
  /// Returns `None` on miss; a stored `Value::Null` comes back as
  /// `Some(Null)`, distinguishable from absence. With `clone_on_get` the
  /// returned value is a uniquely-owned deep copy; otherwise it shares
  /// structure with the cached entry (and is immutable either way).
  pub fn get(&self, key: &str) -> Option<Arc<Value>> {
    let mut inner = self.lock();
    let touched = inner.tick();
    let result = match inner.entries.get_mut(key) {
      Some(entry) => {
        entry.touched = touched;
        if self.clone_on_get {
          Some(Arc::new(entry.value.as_ref().clone()))
        } else {
          Some(Arc::clone(&entry.value))
        }
      }
      None => None,
    };
    if result.is_some() {
      inner.hits += 1;
    } else {
      inner.misses += 1;
    }
    result
  }

  /// Existence check; does not affect recency or statistics.
  pub fn has(&self, key: &str) -> bool {
    self.lock().entries.contains_key(key)
  }

  /// Snapshot of all current entries.
  pub fn get_all(&self) -> HashMap<String, Value> {
    self
      .lock()
      .entries
      .iter()
      .map(|(k, e)| (k.clone(), e.value.as_ref().clone()))
      .collect()
  }

  /// Pin a key so it is never auto-evicted. Returns false when absent.
  pub fn mark_persistent(&self, key: &str) -> bool {
    let mut inner = self.lock();
    match inner.entries.get_mut(key) {
      Some(entry) => {
        entry.persistent = true;
        true
      }
      None => false,
    }
  }

  /// Bulk-load outputs, e.g. to resume a previously-logged execution.
  ///
  /// All entries in the batch share one recency tick; eviction applies per
  /// entry under the same policy as [`set`](Self::set).
  pub fn warm(&self, entries: impl IntoIterator<Item = (String, Value)>, persistent: bool) {
    let mut inner = self.lock();
    let touched = inner.tick();
    for (key, value) in entries {
      inner.insert(key, value, persistent, touched, self.max_size);
    }
  }

  /// Empty the cache and reset all counters.
  pub fn clear(&self) {
    let mut inner = self.lock();
    *inner = CacheInner::default();
  }

  /// Point-in-time statistics.
  pub fn stats(&self) -> CacheStats {
    let inner = self.lock();
    let accesses = inner.hits + inner.misses;
    let hit_rate = if accesses == 0 {
      0.0
    } else {
      inner.hits as f64 / accesses as f64
    };
    CacheStats {
      size: inner.entries.len(),
      max_size: self.max_size,
      hits: inner.hits,
      misses: inner.misses,
      hit_rate,
      evictions: inner.evictions,
    }
  }

  /// Number of entries currently held.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  /// True when the cache holds no entries.
  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  /// Current keys, in no particular order.
  pub fn keys(&self) -> Vec<String> {
    self.lock().entries.keys().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn get_value(cache: &OutputCache, key: &str) -> Option<Value> {
    cache.get(key).map(|v| v.as_ref().clone())
  }

  #[test]
  fn test_rejects_zero_capacity() {
    assert!(matches!(
      OutputCache::new(0),
      Err(EngineError::Configuration { .. })
    ));
  }

  #[test]
  fn test_evicts_least_recently_used() {
    let cache = OutputCache::new(2).unwrap();
    cache.set("a", json!(1), false);
    cache.set("b", json!(2), false);

    // Touch "a" so "b" becomes the oldest.
    assert_eq!(get_value(&cache, "a"), Some(json!(1)));

    cache.set("c", json!(3), false);
    assert!(cache.has("a"));
    assert!(!cache.has("b"));
    assert!(cache.has("c"));
    assert_eq!(cache.stats().evictions, 1);
  }

  #[test]
  fn test_size_one_cache_keeps_newest() {
    let cache = OutputCache::new(1).unwrap();
    cache.set("a", json!(1), false);
    cache.set("b", json!(2), false);

    assert_eq!(get_value(&cache, "a"), None);
    assert_eq!(get_value(&cache, "b"), Some(json!(2)));
  }

  #[test]
  fn test_persistent_entries_survive_and_overflow() {
    let cache = OutputCache::new(2).unwrap();
    cache.set("a", json!(1), true);
    cache.set("b", json!(2), true);
    cache.set("c", json!(3), false);

    // Nothing was evictable, so the cache exceeds its bound.
    assert_eq!(cache.len(), 3);
    assert!(cache.has("a"));
    assert!(cache.has("b"));
    assert_eq!(cache.stats().evictions, 0);
  }

  #[test]
  fn test_set_never_downgrades_persistence() {
    let cache = OutputCache::new(2).unwrap();
    cache.set("a", json!(1), true);
    cache.set("a", json!(2), false);
    cache.set("b", json!(3), false);
    cache.set("c", json!(4), false);

    // "a" stayed persistent; "b" was the only evictable entry.
    assert!(cache.has("a"));
    assert!(!cache.has("b"));
  }

  #[test]
  fn test_stored_null_is_not_a_miss() {
    let cache = OutputCache::new(4).unwrap();
    cache.set("a", Value::Null, false);

    assert_eq!(get_value(&cache, "a"), Some(Value::Null));
    assert_eq!(get_value(&cache, "missing"), None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
  }

  #[test]
  fn test_hit_rate_zero_without_accesses() {
    let cache = OutputCache::new(4).unwrap();
    assert_eq!(cache.stats().hit_rate, 0.0);
  }

  #[test]
  fn test_mark_persistent_absent_key() {
    let cache = OutputCache::new(4).unwrap();
    assert!(!cache.mark_persistent("ghost"));
    assert_eq!(cache.len(), 0);
  }

  #[test]
  fn test_has_does_not_touch_recency() {
    let cache = OutputCache::new(2).unwrap();
    cache.set("a", json!(1), false);
    cache.set("b", json!(2), false);

    // has() must not refresh "a"; it stays the eviction candidate.
    assert!(cache.has("a"));
    cache.set("c", json!(3), false);
    assert!(!cache.has("a"));
  }

  #[test]
  fn test_warm_bulk_loads_and_evicts() {
    let cache = OutputCache::new(2).unwrap();
    cache.warm(
      [
        ("a".to_string(), json!(1)),
        ("b".to_string(), json!(2)),
        ("c".to_string(), json!(3)),
      ],
      false,
    );
    assert_eq!(cache.len(), 2);

    cache.clear();
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.stats().evictions, 0);
  }

  #[test]
  fn test_clone_on_get_returns_detached_copy() {
    let cache = OutputCache::with_options(4, true).unwrap();
    cache.set("a", json!({ "count": 1 }), false);

    // The copy is uniquely owned, so it can be unwrapped and mutated
    // without touching the cached entry.
    let fetched = cache.get("a").unwrap();
    let mut owned = Arc::try_unwrap(fetched).expect("detached copy is uniquely owned");
    owned["count"] = json!(99);

    assert_eq!(get_value(&cache, "a"), Some(json!({ "count": 1 })));
  }

  #[test]
  fn test_shared_get_aliases_the_entry() {
    let cache = OutputCache::with_options(4, false).unwrap();
    cache.set("a", json!({ "count": 1 }), false);

    let first = cache.get("a").unwrap();
    let second = cache.get("a").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
  }

  #[test]
  fn test_bound_holds_under_churn() {
    let cache = OutputCache::new(3).unwrap();
    for i in 0..50 {
      cache.set(format!("k{i}"), json!(i), false);
      assert!(cache.len() <= 3);
    }
  }
}
