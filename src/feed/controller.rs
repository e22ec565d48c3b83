//! Paginated feed controller with stale-while-revalidate.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::PageSource;
use super::types::{FeedSnapshot, FeedState, FeedStatus, FetchedPage};
use crate::cache::{CacheStore, Cacheable, Freshness};
use crate::client::{cursor_segment, request_key, RequestClient, RequestOptions};
use crate::config::LayerConfig;
use crate::error::ErrorKind;
use crate::lock::mutex_lock;

const SOURCE: &str = "feed::controller";

/// Feed behavior knobs, derived from the layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
  pub page_ttl: Duration,
  pub stale_while_revalidate: bool,
  pub optimistic_timeout: Duration,
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self::from(&LayerConfig::default())
  }
}

impl From<&LayerConfig> for FeedConfig {
  fn from(config: &LayerConfig) -> Self {
    Self {
      page_ttl: Duration::from_millis(config.default_ttl_ms),
      stale_while_revalidate: config.stale_while_revalidate,
      optimistic_timeout: Duration::from_millis(config.optimistic_timeout_ms),
    }
  }
}

/// What a load call did.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
  /// Nothing to do: already loading, or no more pages
  Skipped,
  Loaded { appended: usize },
  Failed(ErrorKind),
}

/// What a load call should do, decided under the state lock.
enum NextLoad {
  Skip,
  First,
  After {
    cursor: Option<String>,
    generation: u64,
  },
}

/// Drives one feed: first page, infinite scroll, optimistic inserts.
///
/// Cheap to clone; clones share state.
pub struct FeedController<T: Cacheable> {
  inner: Arc<Inner<T>>,
}

struct Inner<T: Cacheable> {
  feed_key: String,
  tag: String,
  /// Carried by every cached page next to `tag`
  extra_tags: Vec<String>,
  source: Arc<dyn PageSource<T>>,
  cache: Arc<CacheStore>,
  client: RequestClient,
  config: FeedConfig,
  state: Mutex<FeedState<T>>,
  snapshots: watch::Sender<FeedSnapshot<T>>,
  cancel: CancellationToken,
}

impl<T: Cacheable> Clone for FeedController<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Invalidation tag shared by every cached page of `feed_key`.
pub fn feed_tag(feed_key: &str) -> String {
  format!("feed:{}", feed_key)
}

impl<T: Cacheable> FeedController<T> {
  pub fn new(
    feed_key: impl Into<String>,
    source: Arc<dyn PageSource<T>>,
    cache: Arc<CacheStore>,
    client: RequestClient,
    config: FeedConfig,
  ) -> Self {
    Self::with_tags(feed_key, source, cache, client, config, Vec::new())
  }

  /// Like [`new`](Self::new), but cached pages also carry `extra_tags`, so
  /// broader invalidations (a whole resource) reach this feed.
  pub fn with_tags(
    feed_key: impl Into<String>,
    source: Arc<dyn PageSource<T>>,
    cache: Arc<CacheStore>,
    client: RequestClient,
    config: FeedConfig,
    extra_tags: Vec<String>,
  ) -> Self {
    let feed_key = feed_key.into();
    let (snapshots, _) = watch::channel(FeedSnapshot::default());
    Self {
      inner: Arc::new(Inner {
        tag: feed_tag(&feed_key),
        extra_tags,
        feed_key,
        source,
        cache,
        client,
        config,
        state: Mutex::new(FeedState::new()),
        snapshots,
        cancel: CancellationToken::new(),
      }),
    }
  }

  pub fn feed_key(&self) -> &str {
    &self.inner.feed_key
  }

  pub fn tag(&self) -> &str {
    &self.inner.tag
  }

  pub fn snapshot(&self) -> FeedSnapshot<T> {
    self.inner.snapshots.borrow().clone()
  }

  /// Receive a snapshot after every state change.
  pub fn watch(&self) -> watch::Receiver<FeedSnapshot<T>> {
    self.inner.snapshots.subscribe()
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.cancel.is_cancelled()
  }

  /// Initial load.
  ///
  /// A fresh cached first page is shown without a request. A stale one is
  /// shown immediately and refreshed in the background (when
  /// stale-while-revalidate is on). Otherwise the first page is fetched.
  pub async fn start(&self) -> LoadOutcome {
    let cache_key = self.page_cache_key(None);
    let lookup = self.inner.cache.get_as::<FetchedPage<T>>(&cache_key);

    {
      let mut state = self.lock("start");
      if state.status != FeedStatus::Idle {
        return LoadOutcome::Skipped;
      }

      match (lookup.freshness, lookup.value) {
        (Freshness::Fresh, Some(page)) => {
          debug!(feed = %self.inner.feed_key, "first page served from cache");
          let appended = page.items.len();
          state.replace_first(page);
          state.status = state.settled_status();
          self.publish(&state);
          return LoadOutcome::Loaded { appended };
        }
        (Freshness::Stale, Some(page)) if self.inner.config.stale_while_revalidate => {
          debug!(feed = %self.inner.feed_key, "serving stale first page, revalidating");
          let appended = page.items.len();
          state.replace_first(page);
          state.status = state.settled_status();
          self.publish(&state);
          drop(state);

          let controller = self.clone();
          tokio::spawn(async move {
            controller.refresh().await;
          });
          return LoadOutcome::Loaded { appended };
        }
        _ => {
          state.status = FeedStatus::Loading;
          self.publish(&state);
        }
      }
    }

    self.load_first().await
  }

  /// Fetch the next page and append it.
  ///
  /// No-op while a load is running or when the feed has no more pages.
  /// On failure, already loaded pages are kept and `last_error` is set.
  pub async fn load_more(&self) -> LoadOutcome {
    let (cursor, generation) = match self.begin_load_more() {
      NextLoad::Skip => return LoadOutcome::Skipped,
      // Nothing loaded yet (initial load failed): retry it
      NextLoad::First => return self.load_first().await,
      NextLoad::After { cursor, generation } => (cursor, generation),
    };

    let result = self.fetch(cursor.clone(), false).await;

    let mut state = self.lock("load_more");
    let outcome = match result {
      Ok(_) if state.generation != generation => {
        // The first page was replaced and later pages dropped meanwhile
        debug!(feed = %self.inner.feed_key, "discarding page fetched for an old sequence");
        state.status = state.settled_status();
        LoadOutcome::Skipped
      }
      Ok(page) => {
        let appended = state.append(page);
        state.status = state.settled_status();
        state.last_error = None;
        LoadOutcome::Loaded { appended }
      }
      Err(ErrorKind::Cancelled) => {
        state.status = state.settled_status();
        LoadOutcome::Failed(ErrorKind::Cancelled)
      }
      Err(error) => {
        warn!(feed = %self.inner.feed_key, error = %error, "failed to load more");
        state.status = FeedStatus::Error;
        state.last_error = Some(error.clone());
        LoadOutcome::Failed(error)
      }
    };
    self.publish(&state);
    outcome
  }

  /// Refetch the first page, bypassing the cache, and replace it in place.
  ///
  /// Visible data stays on screen while this runs. A failure keeps it and
  /// sets `last_error`.
  pub async fn refresh(&self) -> LoadOutcome {
    match self.begin_refresh() {
      NextLoad::Skip => return LoadOutcome::Skipped,
      NextLoad::First => return self.load_first().await,
      NextLoad::After { .. } => {}
    }

    let result = self.fetch(None, true).await;

    let mut state = self.lock("refresh");
    let outcome = match result {
      Ok(page) => {
        let appended = page.items.len();
        state.replace_first(page);
        if state.status != FeedStatus::LoadingMore {
          state.status = state.settled_status();
        }
        state.last_error = None;
        LoadOutcome::Loaded { appended }
      }
      Err(error) => {
        if error != ErrorKind::Cancelled {
          warn!(feed = %self.inner.feed_key, error = %error, "failed to refresh first page");
          state.last_error = Some(error.clone());
        }
        LoadOutcome::Failed(error)
      }
    };
    self.publish(&state);
    outcome
  }

  /// Show `item` at the head of the feed before the server confirms it.
  ///
  /// The entry is replaced by the server copy on the next fetch that
  /// contains it, or removed by [`sweep_expired`](Self::sweep_expired) after
  /// the optimistic timeout. Returns false if the identity is already in
  /// the feed.
  pub fn insert_optimistic(&self, item: T) -> bool {
    let now = self.inner.cache.clock().now();
    let mut state = self.lock("insert_optimistic");
    if !state.insert_optimistic(item, now) {
      return false;
    }
    if state.status == FeedStatus::Empty {
      state.status = FeedStatus::Ready;
    }
    self.publish(&state);
    true
  }

  /// Remove optimistic entries older than the optimistic timeout.
  ///
  /// Returns the removed identities; when any were removed `last_error` is
  /// set to a timeout.
  pub fn sweep_expired(&self) -> Vec<String> {
    let timeout = self.inner.config.optimistic_timeout;
    let now = self.inner.cache.clock().now();
    let Some(deadline) = chrono::Duration::from_std(timeout)
      .ok()
      .and_then(|t| now.checked_sub_signed(t))
    else {
      return Vec::new();
    };

    let mut state = self.lock("sweep_expired");
    let expired = state.expire_optimistic(deadline);
    if expired.is_empty() {
      return expired;
    }

    warn!(
      feed = %self.inner.feed_key,
      items = ?expired,
      "optimistic items were not confirmed in time"
    );
    state.last_error = Some(ErrorKind::timeout(timeout));
    if !state.status.is_loading() {
      state.status = state.settled_status();
    }
    self.publish(&state);
    expired
  }

  /// Run [`sweep_expired`](Self::sweep_expired) periodically until disposed.
  pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
    let period = (self.inner.config.optimistic_timeout / 4).max(Duration::from_millis(50));
    let controller = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      loop {
        tokio::select! {
          _ = controller.inner.cancel.cancelled() => break,
          _ = ticker.tick() => {
            controller.sweep_expired();
          }
        }
      }
    })
  }

  /// Drop every cached page of this feed.
  pub fn invalidate(&self) -> usize {
    self.inner.cache.invalidate_by_tag(&self.inner.tag)
  }

  /// Abort in-flight requests and background tasks. The feed keeps its
  /// last state but no longer loads.
  pub fn dispose(&self) {
    info!(feed = %self.inner.feed_key, "disposing feed");
    self.inner.cancel.cancel();
  }

  fn begin_load_more(&self) -> NextLoad {
    let mut state = self.lock("load_more");
    if state.status.is_loading() {
      return NextLoad::Skip;
    }

    // Only optimistic entries so far: the initial load still has to happen
    if !state.fetched {
      state.status = FeedStatus::Loading;
      self.publish(&state);
      return NextLoad::First;
    }

    let cursor = match state.pages.last() {
      Some(last) if last.has_more => last.cursor.clone(),
      _ => return NextLoad::Skip,
    };

    state.status = FeedStatus::LoadingMore;
    self.publish(&state);
    NextLoad::After {
      cursor,
      generation: state.generation,
    }
  }

  fn begin_refresh(&self) -> NextLoad {
    let mut state = self.lock("refresh");
    if state.status == FeedStatus::Loading {
      return NextLoad::Skip;
    }
    if !state.fetched {
      state.status = FeedStatus::Loading;
      self.publish(&state);
      return NextLoad::First;
    }
    NextLoad::After {
      cursor: None,
      generation: state.generation,
    }
  }

  async fn load_first(&self) -> LoadOutcome {
    let result = self.fetch(None, false).await;

    let mut state = self.lock("load_first");
    let outcome = match result {
      Ok(page) => {
        let appended = page.items.len();
        state.replace_first(page);
        state.status = state.settled_status();
        state.last_error = None;
        LoadOutcome::Loaded { appended }
      }
      Err(ErrorKind::Cancelled) => {
        state.status = if state.fetched {
          state.settled_status()
        } else {
          FeedStatus::Idle
        };
        LoadOutcome::Failed(ErrorKind::Cancelled)
      }
      Err(error) => {
        warn!(feed = %self.inner.feed_key, error = %error, "failed to load first page");
        state.status = if state.fetched {
          state.settled_status()
        } else {
          FeedStatus::Error
        };
        state.last_error = Some(error.clone());
        LoadOutcome::Failed(error)
      }
    };
    self.publish(&state);
    outcome
  }

  /// Fetch the page after `cursor` and cache it.
  ///
  /// A fresh cached page is used as-is unless `bypass_cache` is set.
  async fn fetch(
    &self,
    cursor: Option<String>,
    bypass_cache: bool,
  ) -> Result<FetchedPage<T>, ErrorKind> {
    if self.is_disposed() {
      return Err(ErrorKind::Cancelled);
    }

    let cache_key = self.page_cache_key(cursor.as_deref());
    if !bypass_cache {
      let lookup = self.inner.cache.get_as::<FetchedPage<T>>(&cache_key);
      if let (Freshness::Fresh, Some(page)) = (lookup.freshness, lookup.value) {
        return Ok(page);
      }
    }

    let key = self
      .inner
      .source
      .request_key(cursor.as_deref())
      .unwrap_or_else(|| {
        request_key([
          "feed",
          self.inner.feed_key.as_str(),
          cursor_segment(cursor.as_deref()).as_str(),
        ])
      });
    let source = Arc::clone(&self.inner.source);
    let executor = move || {
      let source = Arc::clone(&source);
      let cursor = cursor.clone();
      async move { source.fetch_page(cursor).await }
    };
    let options = RequestOptions::default().with_cancel(self.inner.cancel.child_token());

    let page = self.inner.client.request(&key, executor, options).await?;
    self.inner.cache.set_as(
      &cache_key,
      &page,
      self.inner.config.page_ttl,
      std::iter::once(&self.inner.tag).chain(&self.inner.extra_tags).cloned(),
    );
    Ok(page)
  }

  fn page_cache_key(&self, cursor: Option<&str>) -> String {
    format!("{}:page:{}", self.inner.tag, cursor_segment(cursor))
  }

  fn lock(&self, op: &'static str) -> std::sync::MutexGuard<'_, FeedState<T>> {
    mutex_lock(&self.inner.state, SOURCE, op)
  }

  fn publish(&self, state: &FeedState<T>) {
    self.inner.snapshots.send_replace(state.snapshot());
  }
}
