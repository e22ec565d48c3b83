//! Shared feed controllers, reference counted by subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::controller::{FeedConfig, FeedController};
use super::source::PageSource;
use super::types::FeedSnapshot;
use crate::cache::{CacheStore, Cacheable};
use crate::client::RequestClient;
use crate::lock::mutex_lock;

const SOURCE: &str = "feed::registry";

type Feeds<T> = Arc<Mutex<HashMap<String, Registered<T>>>>;

struct Registered<T: Cacheable> {
  controller: FeedController<T>,
  subscribers: usize,
  sweeper: JoinHandle<()>,
}

/// Hands out one controller per feed key, however many views observe it.
pub struct FeedRegistry<T: Cacheable> {
  cache: Arc<CacheStore>,
  client: RequestClient,
  config: FeedConfig,
  feeds: Feeds<T>,
}

impl<T: Cacheable> Clone for FeedRegistry<T> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      client: self.client.clone(),
      config: self.config,
      feeds: Arc::clone(&self.feeds),
    }
  }
}

impl<T: Cacheable> FeedRegistry<T> {
  pub fn new(cache: Arc<CacheStore>, client: RequestClient, config: FeedConfig) -> Self {
    Self {
      cache,
      client,
      config,
      feeds: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Observe `feed_key`.
  ///
  /// The first subscriber creates the controller from `source`, starts the
  /// initial load in the background and starts the optimistic sweep. Later
  /// subscribers share that controller and `source` is ignored.
  pub fn subscribe(
    &self,
    feed_key: &str,
    source: Arc<dyn PageSource<T>>,
  ) -> FeedSubscription<T> {
    self.subscribe_with_tags(feed_key, source, Vec::new())
  }

  /// [`subscribe`](Self::subscribe), tagging the feed's cached pages with
  /// `extra_tags` as well when this call creates the controller.
  pub fn subscribe_with_tags(
    &self,
    feed_key: &str,
    source: Arc<dyn PageSource<T>>,
    extra_tags: Vec<String>,
  ) -> FeedSubscription<T> {
    let mut feeds = mutex_lock(&self.feeds, SOURCE, "subscribe");

    if let Some(registered) = feeds.get_mut(feed_key) {
      registered.subscribers += 1;
      debug!(feed = feed_key, subscribers = registered.subscribers, "joined feed");
      return FeedSubscription::new(feed_key, registered.controller.clone(), &self.feeds);
    }

    let controller = FeedController::with_tags(
      feed_key,
      source,
      Arc::clone(&self.cache),
      self.client.clone(),
      self.config,
      extra_tags,
    );
    let sweeper = controller.spawn_sweeper();
    let starting = controller.clone();
    tokio::spawn(async move {
      starting.start().await;
    });

    debug!(feed = feed_key, "created feed");
    feeds.insert(
      feed_key.to_string(),
      Registered {
        controller: controller.clone(),
        subscribers: 1,
        sweeper,
      },
    );
    FeedSubscription::new(feed_key, controller, &self.feeds)
  }

  /// Controller for `feed_key`, if anyone is subscribed.
  pub fn get(&self, feed_key: &str) -> Option<FeedController<T>> {
    mutex_lock(&self.feeds, SOURCE, "get")
      .get(feed_key)
      .map(|r| r.controller.clone())
  }

  pub fn subscriber_count(&self, feed_key: &str) -> usize {
    mutex_lock(&self.feeds, SOURCE, "subscriber_count")
      .get(feed_key)
      .map_or(0, |r| r.subscribers)
  }

  pub fn len(&self) -> usize {
    mutex_lock(&self.feeds, SOURCE, "len").len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Dispose every feed regardless of outstanding subscriptions.
  pub fn dispose_all(&self) {
    let drained: Vec<_> = mutex_lock(&self.feeds, SOURCE, "dispose_all")
      .drain()
      .map(|(_, r)| r)
      .collect();
    for registered in drained {
      registered.controller.dispose();
      registered.sweeper.abort();
    }
  }
}

/// One observer of a feed.
///
/// Call [`unsubscribe`](Self::unsubscribe) when done. Dropping the handle
/// without it leaves the feed registered and running.
pub struct FeedSubscription<T: Cacheable> {
  feed_key: String,
  controller: FeedController<T>,
  snapshots: watch::Receiver<FeedSnapshot<T>>,
  feeds: Feeds<T>,
}

impl<T: Cacheable> FeedSubscription<T> {
  fn new(feed_key: &str, controller: FeedController<T>, feeds: &Feeds<T>) -> Self {
    Self {
      feed_key: feed_key.to_string(),
      snapshots: controller.watch(),
      controller,
      feeds: Arc::clone(feeds),
    }
  }

  pub fn controller(&self) -> &FeedController<T> {
    &self.controller
  }

  pub fn snapshot(&self) -> FeedSnapshot<T> {
    self.snapshots.borrow().clone()
  }

  /// Receiver notified on every state change of the feed.
  pub fn snapshots(&mut self) -> &mut watch::Receiver<FeedSnapshot<T>> {
    &mut self.snapshots
  }

  /// Stop observing. The last subscriber disposes the feed.
  pub fn unsubscribe(self) {
    let mut feeds = mutex_lock(&self.feeds, SOURCE, "unsubscribe");
    let Some(registered) = feeds.get_mut(&self.feed_key) else {
      return;
    };
    registered.subscribers = registered.subscribers.saturating_sub(1);
    if registered.subscribers > 0 {
      return;
    }

    if let Some(registered) = feeds.remove(&self.feed_key) {
      drop(feeds);
      debug!(feed = %self.feed_key, "last subscriber left");
      registered.controller.dispose();
      registered.sweeper.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::Item;
  use crate::client::RetryPolicy;
  use crate::error::ErrorKind;
  use crate::feed::types::{FeedStatus, FetchedPage};
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  struct CountingSource {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl PageSource<Item> for CountingSource {
    async fn fetch_page(&self, cursor: Option<String>) -> Result<FetchedPage<Item>, ErrorKind> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(5)).await;
      Ok(match cursor {
        None => FetchedPage {
          items: vec![Item::new("A"), Item::new("B")],
          cursor: Some("c1".to_string()),
        },
        Some(_) => FetchedPage {
          items: vec![Item::new("C")],
          cursor: None,
        },
      })
    }
  }

  fn registry() -> FeedRegistry<Item> {
    let cache = Arc::new(CacheStore::new(100, Duration::from_secs(30)));
    let client = RequestClient::new(RetryPolicy::default(), Duration::from_secs(1));
    FeedRegistry::new(cache, client, FeedConfig::default())
  }

  fn source() -> Arc<CountingSource> {
    Arc::new(CountingSource {
      calls: AtomicUsize::new(0),
    })
  }

  #[tokio::test]
  async fn test_subscribers_share_one_controller() {
    let registry = registry();
    let source = source();

    let mut first = registry.subscribe("posts", source.clone());
    let second = registry.subscribe("posts", source.clone());
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.subscriber_count("posts"), 2);

    let ready = first
      .snapshots()
      .wait_for(|s| s.status == FeedStatus::Ready)
      .await
      .unwrap()
      .clone();
    assert_eq!(ready.item_ids(), vec!["A", "B"]);
    assert_eq!(second.snapshot().item_ids(), vec!["A", "B"]);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_last_unsubscribe_disposes_feed() {
    let registry = registry();
    let source = source();

    let first = registry.subscribe("posts", source.clone());
    let second = registry.subscribe("posts", source.clone());
    let controller = first.controller().clone();

    first.unsubscribe();
    assert_eq!(registry.subscriber_count("posts"), 1);
    assert!(!controller.is_disposed());

    second.unsubscribe();
    assert!(registry.is_empty());
    assert!(controller.is_disposed());
  }

  #[tokio::test]
  async fn test_dropping_subscription_keeps_feed_alive() {
    let registry = registry();
    drop(registry.subscribe("posts", source()));

    assert_eq!(registry.subscriber_count("posts"), 1);
    let controller = registry.get("posts").unwrap();
    assert!(!controller.is_disposed());
  }

  #[tokio::test]
  async fn test_resubscribe_after_dispose_starts_fresh_controller() {
    let registry = registry();
    let source = source();

    let sub = registry.subscribe("posts", source.clone());
    let old = sub.controller().clone();
    sub.unsubscribe();

    let sub = registry.subscribe("posts", source.clone());
    assert!(old.is_disposed());
    assert!(!sub.controller().is_disposed());
  }

  #[tokio::test]
  async fn test_dispose_all() {
    let registry = registry();
    let a = registry.subscribe("a", source());
    let b = registry.subscribe("b", source());

    registry.dispose_all();
    assert!(registry.is_empty());
    assert!(a.controller().is_disposed());
    assert!(b.controller().is_disposed());
  }
}
