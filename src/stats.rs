//! Dashboard aggregates, cached with a longer TTL than feed pages.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::StatsSource;
use crate::cache::{CacheStore, Freshness};
use crate::client::{request_key, RequestClient, RequestOptions};
use crate::config::LayerConfig;
use crate::error::ErrorKind;

/// Tag carried by every stats entry.
pub const STATS_TAG: &str = "stats";

/// Reads aggregates through the cache, revalidating stale values in the
/// background.
#[derive(Clone)]
pub struct StatsAggregator {
  source: Arc<dyn StatsSource>,
  cache: Arc<CacheStore>,
  client: RequestClient,
  ttl: Duration,
  stale_while_revalidate: bool,
}

impl StatsAggregator {
  pub fn new(
    source: Arc<dyn StatsSource>,
    cache: Arc<CacheStore>,
    client: RequestClient,
    config: &LayerConfig,
  ) -> Self {
    Self {
      source,
      cache,
      client,
      ttl: Duration::from_millis(config.stats_ttl_ms),
      stale_while_revalidate: config.stale_while_revalidate,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Current value for `key`.
  ///
  /// A fresh cached value is returned as-is. A stale one is returned
  /// immediately and refetched in the background when stale-while-revalidate
  /// is on. Otherwise the value is fetched and cached.
  pub async fn get_stats(&self, key: &str) -> Result<Value, ErrorKind> {
    let lookup = self.cache.get(&stats_tag(key));

    match (lookup.freshness, lookup.value) {
      (Freshness::Fresh, Some(value)) => Ok(value),
      (Freshness::Stale, Some(value)) if self.stale_while_revalidate => {
        debug!(key, "serving stale stats, revalidating");
        let aggregator = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
          if let Err(e) = aggregator.refresh(&key).await {
            warn!(key = %key, error = %e, "failed to revalidate stats");
          }
        });
        Ok(value)
      }
      _ => self.refresh(key).await,
    }
  }

  /// Typed [`get_stats`](Self::get_stats).
  pub async fn get_stats_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ErrorKind> {
    let value = self.get_stats(key).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Fetch `key` bypassing the cache and store the result.
  pub async fn refresh(&self, key: &str) -> Result<Value, ErrorKind> {
    let source = Arc::clone(&self.source);
    let owned = key.to_string();
    let executor = move || {
      let source = Arc::clone(&source);
      let key = owned.clone();
      async move { source.fetch_stats(&key).await }
    };

    let value = self
      .client
      .request(
        &request_key(["stats", key]),
        executor,
        RequestOptions::default(),
      )
      .await?;

    self.cache.set(
      &stats_tag(key),
      value.clone(),
      self.ttl,
      [STATS_TAG.to_string(), stats_tag(key)],
    );
    Ok(value)
  }

  /// Drop every cached aggregate.
  pub fn invalidate_all(&self) -> usize {
    self.cache.invalidate_by_tag(STATS_TAG)
  }
}

/// Tag of the single aggregate `key`; also its cache key.
pub fn stats_tag(key: &str) -> String {
  format!("stats:{}", key)
}
