//! In-memory cache store with TTL, tag index and LRU eviction.

use lru::LruCache;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::storage::{PersistedEntry, PersistentStore};
use super::traits::{CacheEntry, CacheLookup, Freshness};
use crate::clock::{Clock, SystemClock};
use crate::lock::mutex_lock;

const SOURCE: &str = "cache::store";

/// Process-wide key/value cache.
///
/// All mutations complete synchronously under one lock, so two mutations never
/// interleave. Persistence is mirrored through a background writer and never
/// blocks callers.
pub struct CacheStore {
  inner: Mutex<Inner>,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
  persist: Mutex<Option<PersistWriter>>,
  backing: Option<Arc<dyn PersistentStore>>,
}

struct Inner {
  /// Iteration order is access order; the tail is evicted first
  entries: LruCache<String, CacheEntry>,
  /// tag -> keys carrying that tag
  tags: HashMap<String, HashSet<String>>,
}

impl Inner {
  fn index(&mut self, entry: &CacheEntry) {
    for tag in &entry.tags {
      self
        .tags
        .entry(tag.clone())
        .or_default()
        .insert(entry.key.clone());
    }
  }

  fn unindex(&mut self, entry: &CacheEntry) {
    for tag in &entry.tags {
      if let Some(keys) = self.tags.get_mut(tag) {
        keys.remove(&entry.key);
        if keys.is_empty() {
          self.tags.remove(tag);
        }
      }
    }
  }

  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    let entry = self.entries.pop(key)?;
    self.unindex(&entry);
    Some(entry)
  }

  /// Insert `entry`, replacing any previous entry for its key.
  /// Returns the key evicted to make room, if any.
  fn insert(&mut self, entry: CacheEntry) -> Option<String> {
    if let Some(old) = self.entries.pop(&entry.key) {
      self.unindex(&old);
    }
    self.index(&entry);

    match self.entries.push(entry.key.clone(), entry) {
      Some((evicted_key, evicted)) => {
        self.unindex(&evicted);
        Some(evicted_key)
      }
      None => None,
    }
  }
}

enum PersistOp {
  Put(PersistedEntry),
  Remove(Vec<String>),
  Clear,
  Flush(oneshot::Sender<()>),
}

struct PersistWriter {
  tx: mpsc::UnboundedSender<PersistOp>,
  task: JoinHandle<()>,
}

impl CacheStore {
  /// Create a memory-only store holding at most `capacity` entries.
  pub fn new(capacity: usize, default_ttl: Duration) -> Self {
    Self::with_clock(capacity, default_ttl, Arc::new(SystemClock))
  }

  pub fn with_clock(capacity: usize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self {
      inner: Mutex::new(Inner {
        entries: LruCache::new(capacity),
        tags: HashMap::new(),
      }),
      clock,
      default_ttl,
      persist: Mutex::new(None),
      backing: None,
    }
  }

  /// Mirror every mutation to `store`.
  ///
  /// Spawns the writer task, so this must be called inside a tokio runtime.
  pub fn with_persistence(mut self, store: Arc<dyn PersistentStore>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_writer(Arc::clone(&store), rx));
    self.persist = Mutex::new(Some(PersistWriter { tx, task }));
    self.backing = Some(store);
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  /// Look up `key`. Never fails; a miss carries no value.
  pub fn get(&self, key: &str) -> CacheLookup {
    let now = self.clock.now();
    let mut inner = mutex_lock(&self.inner, SOURCE, "get");

    match inner.entries.get(key) {
      Some(entry) => {
        let freshness = entry.freshness(now);
        debug!(key, ?freshness, "cache hit");
        CacheLookup::hit(entry.value.clone(), freshness, entry.stored_at)
      }
      None => {
        debug!(key, "cache miss");
        CacheLookup::miss()
      }
    }
  }

  /// Typed lookup. A value that no longer deserializes is treated as a miss.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> CacheLookup<T> {
    let lookup = self.get(key);
    let Some(value) = lookup.value else {
      return CacheLookup::miss();
    };

    match serde_json::from_value(value) {
      Ok(typed) => CacheLookup {
        value: Some(typed),
        freshness: lookup.freshness,
        stored_at: lookup.stored_at,
      },
      Err(e) => {
        warn!(key, error = %e, "cached value has unexpected shape, ignoring");
        CacheLookup::miss()
      }
    }
  }

  /// Store `value` under `key`, replacing any existing entry and its tags.
  pub fn set<I, S>(&self, key: &str, value: Value, ttl: Duration, tags: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let entry = CacheEntry {
      key: key.to_string(),
      value,
      stored_at: self.clock.now(),
      ttl,
      tags: tags.into_iter().map(Into::into).collect::<BTreeSet<_>>(),
    };
    let persisted = PersistedEntry::from(&entry);

    // Ops are queued under the same lock so the writer sees them in memory order
    let mut inner = mutex_lock(&self.inner, SOURCE, "set");
    let evicted = inner.insert(entry);
    self.send(PersistOp::Put(persisted));
    if let Some(evicted) = evicted {
      debug!(key = %evicted, "evicted least recently used entry");
      self.send(PersistOp::Remove(vec![evicted]));
    }
  }

  /// Serialize and store a typed value. Serialization failures are logged
  /// and the store is left unchanged.
  pub fn set_as<T, I, S>(&self, key: &str, value: &T, ttl: Duration, tags: I)
  where
    T: Serialize,
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    match serde_json::to_value(value) {
      Ok(value) => self.set(key, value, ttl, tags),
      Err(e) => warn!(key, error = %e, "failed to serialize value for cache"),
    }
  }

  /// Remove a single entry.
  pub fn invalidate(&self, key: &str) -> bool {
    let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate");
    let removed = inner.remove(key).is_some();
    if removed {
      debug!(key, "invalidated");
      self.send(PersistOp::Remove(vec![key.to_string()]));
    }
    removed
  }

  /// Remove every entry tagged with `tag`. Returns how many were removed.
  pub fn invalidate_by_tag(&self, tag: &str) -> usize {
    let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate_by_tag");
    let keys = inner.tags.remove(tag).unwrap_or_default();
    let removed: Vec<String> = keys
      .into_iter()
      .filter(|key| inner.remove(key).is_some())
      .collect();

    debug!(tag, count = removed.len(), "invalidated by tag");
    let count = removed.len();
    if count > 0 {
      self.send(PersistOp::Remove(removed));
    }
    count
  }

  /// Remove everything, including the persisted mirror.
  pub fn clear(&self) {
    let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
    inner.entries.clear();
    inner.tags.clear();
    self.send(PersistOp::Clear);
    info!("cache cleared");
  }

  pub fn len(&self) -> usize {
    mutex_lock(&self.inner, SOURCE, "len").entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether `key` is present, without touching its access order.
  pub fn contains_key(&self, key: &str) -> bool {
    mutex_lock(&self.inner, SOURCE, "contains_key")
      .entries
      .contains(key)
  }

  /// Load persisted entries that are still within TTL.
  ///
  /// Expired rows are deleted from the persistent store instead of being
  /// rehydrated. Returns the number of entries loaded into memory.
  pub async fn warm(&self) -> usize {
    let Some(store) = self.backing.clone() else {
      return 0;
    };

    let loaded = match tokio::task::spawn_blocking(move || store.load_all()).await {
      Ok(Ok(entries)) => entries,
      Ok(Err(e)) => {
        warn!(error = %e, "failed to read persisted cache, starting cold");
        return 0;
      }
      Err(e) => {
        warn!(error = %e, "persisted cache loader panicked, starting cold");
        return 0;
      }
    };

    let now = self.clock.now();
    let mut expired = Vec::new();
    let mut warmed = 0;
    {
      let mut inner = mutex_lock(&self.inner, SOURCE, "warm");
      for persisted in loaded {
        let entry = CacheEntry::from(persisted);
        if entry.freshness(now) != Freshness::Fresh {
          // A newer in-memory copy owns the row now
          if !inner.entries.contains(&entry.key) {
            expired.push(entry.key);
          }
          continue;
        }
        if let Some(key) = inner.insert(entry) {
          expired.push(key);
        }
        warmed += 1;
      }
      if !expired.is_empty() {
        self.send(PersistOp::Remove(expired));
      }
    }

    info!(count = warmed, "warmed cache from persistent store");
    warmed
  }

  /// Wait until every queued persistence operation has been applied.
  pub async fn flush(&self) {
    let (done_tx, done_rx) = oneshot::channel();
    if self.send(PersistOp::Flush(done_tx)) {
      let _ = done_rx.await;
    }
  }

  /// Stop the persistence writer after draining its queue.
  pub async fn close(&self) {
    let writer = mutex_lock(&self.persist, SOURCE, "close").take();
    if let Some(PersistWriter { tx, task }) = writer {
      drop(tx);
      if let Err(e) = task.await {
        warn!(error = %e, "cache writer task ended abnormally");
      }
    }
  }

  /// Queue a persistence op. Returns false when persistence is off.
  fn send(&self, op: PersistOp) -> bool {
    let persist = mutex_lock(&self.persist, SOURCE, "send");
    match persist.as_ref() {
      Some(writer) => writer.tx.send(op).is_ok(),
      None => false,
    }
  }
}

async fn run_writer(store: Arc<dyn PersistentStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
  while let Some(op) = rx.recv().await {
    let store = Arc::clone(&store);
    let result = match op {
      PersistOp::Flush(done) => {
        let _ = done.send(());
        continue;
      }
      PersistOp::Put(entry) => tokio::task::spawn_blocking(move || store.put(&entry)).await,
      PersistOp::Remove(keys) => tokio::task::spawn_blocking(move || store.remove(&keys)).await,
      PersistOp::Clear => tokio::task::spawn_blocking(move || store.clear()).await,
    };

    match result {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(error = %e, "persistent cache write failed, dropping"),
      Err(e) => warn!(error = %e, "persistent cache write panicked, dropping"),
    }
  }
  debug!("cache writer stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::clock::ManualClock;
  use chrono::Duration as ChronoDuration;
  use serde_json::json;

  fn store_with_clock(capacity: usize) -> (CacheStore, ManualClock) {
    let clock = ManualClock::default();
    let store = CacheStore::with_clock(capacity, Duration::from_secs(30), Arc::new(clock.clone()));
    (store, clock)
  }

  const NO_TAGS: [&str; 0] = [];

  #[test]
  fn test_ttl_fresh_then_stale() {
    let (store, clock) = store_with_clock(10);
    store.set("x", json!(1), Duration::from_millis(1000), NO_TAGS);

    clock.advance(ChronoDuration::milliseconds(500));
    let lookup = store.get("x");
    assert_eq!(lookup.value, Some(json!(1)));
    assert_eq!(lookup.freshness, Freshness::Fresh);

    clock.advance(ChronoDuration::milliseconds(1000));
    let lookup = store.get("x");
    assert_eq!(lookup.freshness, Freshness::Stale);
    assert_eq!(lookup.value, Some(json!(1)));
  }

  #[test]
  fn test_miss_has_no_value() {
    let (store, _) = store_with_clock(10);
    let lookup = store.get("nothing");
    assert!(lookup.is_miss());
    assert_eq!(lookup.value, None);
  }

  #[test]
  fn test_invalidate_by_tag_only_touches_tagged_entries() {
    let (store, _) = store_with_clock(10);
    let ttl = Duration::from_secs(60);
    store.set("p1", json!("a"), ttl, ["feed:posts"]);
    store.set("p2", json!("b"), ttl, ["feed:posts", "user:1"]);
    store.set("u1", json!("c"), ttl, ["user:1"]);
    store.set("other", json!("d"), ttl, NO_TAGS);

    assert_eq!(store.invalidate_by_tag("feed:posts"), 2);
    assert!(store.get("p1").is_miss());
    assert!(store.get("p2").is_miss());
    assert!(store.get("u1").is_fresh());
    assert!(store.get("other").is_fresh());

    // p2 is gone from the user:1 index too
    assert_eq!(store.invalidate_by_tag("user:1"), 1);
    assert!(store.get("u1").is_miss());
  }

  #[test]
  fn test_set_replaces_tag_associations() {
    let (store, _) = store_with_clock(10);
    let ttl = Duration::from_secs(60);
    store.set("k", json!(1), ttl, ["old"]);
    store.set("k", json!(2), ttl, ["new"]);

    assert_eq!(store.invalidate_by_tag("old"), 0);
    assert_eq!(store.get("k").value, Some(json!(2)));
    assert_eq!(store.invalidate_by_tag("new"), 1);
    assert!(store.get("k").is_miss());
  }

  #[test]
  fn test_invalidate_single_key() {
    let (store, _) = store_with_clock(10);
    store.set("a", json!(1), Duration::from_secs(60), ["t"]);
    store.set("b", json!(2), Duration::from_secs(60), ["t"]);

    assert!(store.invalidate("a"));
    assert!(!store.invalidate("a"));
    assert!(store.get("a").is_miss());
    assert_eq!(store.invalidate_by_tag("t"), 1);
  }

  #[test]
  fn test_clear_empties_store() {
    let (store, _) = store_with_clock(10);
    store.set("a", json!(1), Duration::from_secs(60), ["t"]);
    store.set("b", json!(2), Duration::from_secs(60), NO_TAGS);
    store.clear();
    assert!(store.is_empty());
    assert_eq!(store.invalidate_by_tag("t"), 0);
  }

  #[test]
  fn test_evicts_least_recently_accessed() {
    let (store, _) = store_with_clock(2);
    let ttl = Duration::from_secs(60);
    store.set("a", json!(1), ttl, ["t"]);
    store.set("b", json!(2), ttl, ["t"]);

    // Touch a so b becomes the eviction candidate
    store.get("a");
    store.set("c", json!(3), ttl, ["t"]);

    assert!(store.contains_key("a"));
    assert!(!store.contains_key("b"));
    assert!(store.contains_key("c"));
    // The evicted key left the tag index
    assert_eq!(store.invalidate_by_tag("t"), 2);
  }

  #[test]
  fn test_typed_access() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Stats {
      posts: u32,
    }

    let (store, _) = store_with_clock(10);
    store.set_as("stats", &Stats { posts: 3 }, Duration::from_secs(60), NO_TAGS);
    assert_eq!(store.get_as::<Stats>("stats").value, Some(Stats { posts: 3 }));

    store.set("stats", json!("not stats"), Duration::from_secs(60), NO_TAGS);
    assert!(store.get_as::<Stats>("stats").is_miss());
  }

  #[tokio::test]
  async fn test_persistence_mirrors_mutations() {
    let backing = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let store = CacheStore::new(10, Duration::from_secs(30)).with_persistence(backing.clone());

    store.set("a", json!(1), Duration::from_secs(60), ["t"]);
    store.set("b", json!(2), Duration::from_secs(60), ["t"]);
    store.set("c", json!(3), Duration::from_secs(60), NO_TAGS);
    store.invalidate("c");
    store.flush().await;

    let mut keys: Vec<String> = backing
      .load_all()
      .unwrap()
      .into_iter()
      .map(|e| e.key)
      .collect();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

    store.invalidate_by_tag("t");
    store.flush().await;
    assert!(backing.load_all().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_warm_start_drops_expired_entries() {
    let backing = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let clock = ManualClock::default();

    let first = CacheStore::with_clock(10, Duration::from_secs(30), Arc::new(clock.clone()))
      .with_persistence(backing.clone());
    first.set("short", json!("s"), Duration::from_millis(100), ["t"]);
    first.set("long", json!("l"), Duration::from_secs(600), ["t"]);
    first.close().await;

    clock.advance(ChronoDuration::seconds(1));

    let second = CacheStore::with_clock(10, Duration::from_secs(30), Arc::new(clock.clone()))
      .with_persistence(backing.clone());
    assert_eq!(second.warm().await, 1);
    assert!(second.get("short").is_miss());
    assert_eq!(second.get("long").value, Some(json!("l")));
    // Warmed entries keep their tag associations
    assert_eq!(second.invalidate_by_tag("t"), 1);

    second.flush().await;
    assert!(backing.load_all().unwrap().is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_persisted_state_matches_memory_under_contention() {
    let backing = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let store = Arc::new(
      CacheStore::new(100, Duration::from_secs(60)).with_persistence(backing.clone()),
    );

    let mut tasks = Vec::new();
    for worker in 0..8 {
      let store = Arc::clone(&store);
      tasks.push(tokio::spawn(async move {
        for i in 0..200 {
          let key = format!("k{}", i % 4);
          match (worker + i) % 4 {
            0 => store.set(&key, json!(i), Duration::from_secs(60), ["t"]),
            1 => {
              store.invalidate(&key);
            }
            2 => {
              store.invalidate_by_tag("t");
            }
            _ => store.set(&key, json!(i), Duration::from_secs(60), NO_TAGS),
          }
          tokio::task::yield_now().await;
        }
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    store.flush().await;

    let persisted: HashSet<String> = backing
      .load_all()
      .unwrap()
      .into_iter()
      .map(|e| e.key)
      .collect();
    for i in 0..4 {
      let key = format!("k{}", i);
      assert_eq!(persisted.contains(&key), store.contains_key(&key), "{}", key);
    }
  }

  #[tokio::test]
  async fn test_warm_without_persistence_is_noop() {
    let store = CacheStore::new(10, Duration::from_secs(30));
    assert_eq!(store.warm().await, 0);
    store.flush().await;
  }
}
