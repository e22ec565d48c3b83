//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Trait for items that have a stable identity.
///
/// Feeds use the key to de-duplicate items across pages and to reconcile
/// optimistic inserts with server data.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this item (e.g., post id)
  fn cache_key(&self) -> String;
}

/// How usable a cached value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Within TTL
  Fresh,
  /// Past TTL, still returnable under stale-while-revalidate
  Stale,
  /// Nothing cached for the key
  Miss,
}

/// A single cached value with its expiry metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
  pub tags: BTreeSet<String>,
}

impl CacheEntry {
  /// Fresh while `now - stored_at < ttl`.
  ///
  /// A `stored_at` in the future (clock skew after a warm start) counts as
  /// age zero.
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    let age = (now - self.stored_at).to_std().unwrap_or(Duration::ZERO);
    age < self.ttl
  }

  pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
    if self.is_fresh(now) {
      Freshness::Fresh
    } else {
      Freshness::Stale
    }
  }
}

/// Result of a cache lookup, including data and metadata about its age.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup<T = Value> {
  /// The cached value, absent on a miss
  pub value: Option<T>,
  pub freshness: Freshness,
  /// When the value was stored (if present)
  pub stored_at: Option<DateTime<Utc>>,
}

impl<T> CacheLookup<T> {
  pub fn miss() -> Self {
    Self {
      value: None,
      freshness: Freshness::Miss,
      stored_at: None,
    }
  }

  pub fn hit(value: T, freshness: Freshness, stored_at: DateTime<Utc>) -> Self {
    Self {
      value: Some(value),
      freshness,
      stored_at: Some(stored_at),
    }
  }

  pub fn is_fresh(&self) -> bool {
    self.freshness == Freshness::Fresh
  }

  pub fn is_stale(&self) -> bool {
    self.freshness == Freshness::Stale
  }

  pub fn is_miss(&self) -> bool {
    self.freshness == Freshness::Miss
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheLookup<U> {
    CacheLookup {
      value: self.value.map(f),
      freshness: self.freshness,
      stored_at: self.stored_at,
    }
  }
}
