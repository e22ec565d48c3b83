//! Wiring of cache, request client, feeds and stats into one instance.

use color_eyre::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backend::{Backend, Filters, HttpBackend, Item, ReadQuery, StatsSource, WriteCommand};
use crate::cache::{CacheStore, PersistentStore, SqliteStorage};
use crate::client::{request_key, RequestClient, RequestOptions};
use crate::config::Config;
use crate::error::ErrorKind;
use crate::feed::{feed_tag, BackendSource, FeedConfig, FeedRegistry, FeedSubscription};
use crate::stats::StatsAggregator;

/// One data-access layer instance.
///
/// Several may coexist, each with its own cache and in-flight map.
pub struct DataLayer {
  config: Config,
  cache: Arc<CacheStore>,
  client: RequestClient,
  backend: Arc<dyn Backend>,
  feeds: FeedRegistry<Item>,
  stats: StatsAggregator,
  /// Sequence for write request keys; writes never coalesce
  writes: AtomicU64,
}

impl DataLayer {
  /// Build a layer talking to the configured HTTP backend, restoring the
  /// persisted cache when persistence is enabled.
  pub async fn init(config: Config) -> Result<Self> {
    let timeout = Duration::from_millis(config.cache.request_timeout_ms);
    let http = Arc::new(HttpBackend::new(&config.backend, timeout)?);

    let storage: Option<Arc<dyn PersistentStore>> = if config.persistence.enabled {
      let storage = match &config.persistence.path {
        Some(path) => SqliteStorage::open_at(path)?,
        None => SqliteStorage::open()?,
      };
      Some(Arc::new(storage))
    } else {
      None
    };

    Self::with_backend(config, http.clone(), http, storage).await
  }

  /// Build a layer over explicit collaborators.
  pub async fn with_backend(
    config: Config,
    backend: Arc<dyn Backend>,
    stats_source: Arc<dyn StatsSource>,
    storage: Option<Arc<dyn PersistentStore>>,
  ) -> Result<Self> {
    config.cache.validate()?;

    let mut cache = CacheStore::new(
      config.cache.max_cache_entries,
      Duration::from_millis(config.cache.default_ttl_ms),
    );
    if let Some(storage) = storage {
      cache = cache.with_persistence(storage);
    }
    let cache = Arc::new(cache);
    cache.warm().await;

    let client = RequestClient::from_config(&config.cache);
    let feeds = FeedRegistry::new(
      Arc::clone(&cache),
      client.clone(),
      FeedConfig::from(&config.cache),
    );
    let stats = StatsAggregator::new(
      stats_source,
      Arc::clone(&cache),
      client.clone(),
      &config.cache,
    );

    info!(backend = %config.backend.url, "data layer ready");
    Ok(Self {
      config,
      cache,
      client,
      backend,
      feeds,
      stats,
      writes: AtomicU64::new(0),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  pub fn client(&self) -> &RequestClient {
    &self.client
  }

  pub fn feeds(&self) -> &FeedRegistry<Item> {
    &self.feeds
  }

  pub fn stats(&self) -> &StatsAggregator {
    &self.stats
  }

  /// Observe the feed of `resource` narrowed by `filters`.
  pub fn subscribe_feed(&self, resource: &str, filters: &Filters) -> FeedSubscription<Item> {
    let mut query = ReadQuery::new(resource, self.config.backend.page_size);
    query.filters = filters.clone();

    let source = Arc::new(BackendSource::new(Arc::clone(&self.backend), query));
    self.feeds.subscribe_with_tags(
      &feed_key(resource, filters),
      source,
      vec![feed_tag(resource)],
    )
  }

  /// Run a mutation, then drop the cached pages of every feed of the
  /// resource, filtered or not.
  ///
  /// The call goes through the request client for its timeout and
  /// cancellation, with a single attempt since writes may not be idempotent.
  pub async fn write(
    &self,
    resource: &str,
    operation: &str,
    payload: Value,
  ) -> Result<Item, ErrorKind> {
    let command = WriteCommand::new(resource, operation, payload);
    let seq = self.writes.fetch_add(1, Ordering::Relaxed).to_string();
    let key = request_key(["write", resource, operation, seq.as_str()]);

    let backend = Arc::clone(&self.backend);
    let executor = move || {
      let backend = Arc::clone(&backend);
      let command = command.clone();
      async move { backend.write(&command).await }
    };
    let item = self
      .client
      .request(&key, executor, RequestOptions::default().with_max_attempts(1))
      .await?;

    let dropped = self.cache.invalidate_by_tag(&feed_tag(resource));
    info!(resource, operation, id = %item.id, dropped, "write applied");
    Ok(item)
  }

  /// Empty the cache, including its persisted mirror.
  pub async fn clear_cache(&self) {
    self.cache.clear();
    self.cache.flush().await;
  }

  /// Dispose every feed and stop the persistence writer once queued writes
  /// have landed.
  pub async fn teardown(self) {
    self.feeds.dispose_all();
    self.cache.close().await;
    info!("data layer torn down");
  }
}

/// Registry key of a feed. The unfiltered feed is keyed by the resource
/// alone so writes can find it.
pub fn feed_key(resource: &str, filters: &Filters) -> String {
  if filters.is_empty() {
    return resource.to_string();
  }
  let filters = filters
    .iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect::<Vec<_>>()
    .join("&");
  format!("{}?{}", resource, filters)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::ReadResponse;
  use crate::cache::NoopStorage;
  use crate::config::{BackendConfig, LayerConfig, PersistenceConfig};
  use crate::feed::FeedStatus;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;

  /// In-memory resource: reads return everything written so far.
  #[derive(Default)]
  struct MemoryBackend {
    items: Mutex<Vec<Value>>,
    writes: AtomicUsize,
    write_delay: Duration,
    write_error: Option<ErrorKind>,
  }

  #[async_trait]
  impl Backend for MemoryBackend {
    async fn read(&self, _query: &ReadQuery) -> Result<ReadResponse, ErrorKind> {
      Ok(ReadResponse {
        items: self.items.lock().unwrap().clone(),
        next_cursor: None,
      })
    }

    async fn write(&self, command: &WriteCommand) -> Result<Item, ErrorKind> {
      self.writes.fetch_add(1, Ordering::SeqCst);
      if !self.write_delay.is_zero() {
        tokio::time::sleep(self.write_delay).await;
      }
      if let Some(error) = &self.write_error {
        return Err(error.clone());
      }
      self.items.lock().unwrap().insert(0, command.payload.clone());
      Ok(serde_json::from_value(command.payload.clone())?)
    }
  }

  #[async_trait]
  impl StatsSource for MemoryBackend {
    async fn fetch_stats(&self, _key: &str) -> Result<Value, ErrorKind> {
      Ok(json!({ "count": self.items.lock().unwrap().len() }))
    }
  }

  fn config() -> Config {
    Config {
      backend: BackendConfig {
        url: "http://localhost:0".to_string(),
        page_size: 10,
      },
      cache: LayerConfig::default(),
      persistence: PersistenceConfig {
        enabled: false,
        path: None,
      },
    }
  }

  async fn layer(backend: Arc<MemoryBackend>) -> DataLayer {
    DataLayer::with_backend(config(), backend.clone(), backend, Some(Arc::new(NoopStorage)))
      .await
      .unwrap()
  }

  #[test]
  fn test_feed_key() {
    assert_eq!(feed_key("posts", &Filters::new()), "posts");

    let mut filters = Filters::new();
    filters.insert("tag".to_string(), "rust".to_string());
    filters.insert("author".to_string(), "7".to_string());
    assert_eq!(feed_key("posts", &filters), "posts?author=7&tag=rust");
  }

  #[tokio::test]
  async fn test_write_invalidates_feed_pages() {
    let backend = Arc::new(MemoryBackend::default());
    let layer = layer(backend.clone()).await;
    layer.write("posts", "create", json!({"id": "1"})).await.unwrap();

    let mut sub = layer.subscribe_feed("posts", &Filters::new());
    sub
      .snapshots()
      .wait_for(|s| s.status == FeedStatus::Ready)
      .await
      .unwrap();
    assert!(layer.cache().contains_key("feed:posts:page:head"));

    layer.write("posts", "create", json!({"id": "2"})).await.unwrap();
    assert!(!layer.cache().contains_key("feed:posts:page:head"));

    sub.controller().refresh().await;
    assert_eq!(sub.snapshot().item_ids(), vec!["2", "1"]);

    sub.unsubscribe();
    layer.teardown().await;
  }

  #[tokio::test]
  async fn test_write_invalidates_filtered_feeds_of_the_resource() {
    let backend = Arc::new(MemoryBackend::default());
    let layer = layer(backend.clone()).await;

    let mut filters = Filters::new();
    filters.insert("tag".to_string(), "rust".to_string());
    let mut sub = layer.subscribe_feed("posts", &filters);
    sub
      .snapshots()
      .wait_for(|s| s.status == FeedStatus::Empty)
      .await
      .unwrap();
    assert!(layer.cache().contains_key("feed:posts?tag=rust:page:head"));

    layer.write("posts", "create", json!({"id": "1"})).await.unwrap();
    assert!(!layer.cache().contains_key("feed:posts?tag=rust:page:head"));

    sub.unsubscribe();
    layer.teardown().await;
  }

  #[tokio::test]
  async fn test_slow_write_times_out() {
    let backend = Arc::new(MemoryBackend {
      write_delay: Duration::from_millis(500),
      ..MemoryBackend::default()
    });
    let mut config = config();
    config.cache.request_timeout_ms = 20;
    config.cache.retry_base_delay_ms = 1;
    config.cache.retry_max_delay_ms = 1;
    let layer = DataLayer::with_backend(config, backend.clone(), backend.clone(), None)
      .await
      .unwrap();

    let result = layer.write("posts", "create", json!({"id": "1"})).await;
    assert_eq!(result, Err(ErrorKind::Timeout { after_ms: 20 }));
    assert_eq!(backend.writes.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_write_is_not_retried() {
    let backend = Arc::new(MemoryBackend {
      write_error: Some(ErrorKind::network("connection reset")),
      ..MemoryBackend::default()
    });
    let layer = layer(backend.clone()).await;

    let result = layer.write("posts", "create", json!({"id": "1"})).await;
    assert!(matches!(result, Err(ErrorKind::Network { .. })));
    assert_eq!(backend.writes.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_rejects_invalid_layer_config() {
    let mut config = config();
    config.cache.max_retry_attempts = 0;
    let backend = Arc::new(MemoryBackend::default());
    let result = DataLayer::with_backend(config, backend.clone(), backend, None).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_clear_cache() {
    let backend = Arc::new(MemoryBackend::default());
    let layer = layer(backend).await;
    layer.stats().get_stats("posts").await.unwrap();
    assert!(!layer.cache().is_empty());

    layer.clear_cache().await;
    assert!(layer.cache().is_empty());
  }
}
