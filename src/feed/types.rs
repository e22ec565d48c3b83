//! Feed data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cache::Cacheable;
use crate::error::ErrorKind;

/// An item in a feed, either confirmed by the server or inserted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedEntry<T> {
  Confirmed {
    item: T,
  },
  /// Created locally, waiting for the server to return it
  Optimistic {
    item: T,
    inserted_at: DateTime<Utc>,
  },
}

impl<T: Cacheable> FeedEntry<T> {
  pub fn item(&self) -> &T {
    match self {
      Self::Confirmed { item } | Self::Optimistic { item, .. } => item,
    }
  }

  pub fn id(&self) -> String {
    self.item().cache_key()
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, Self::Optimistic { .. })
  }
}

/// One page of a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
  pub items: Vec<FeedEntry<T>>,
  /// Cursor for the next page; `None` ends the sequence
  pub cursor: Option<String>,
  pub has_more: bool,
}

/// A page exactly as the source returned it. This is also the cached form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage<T> {
  pub items: Vec<T>,
  pub cursor: Option<String>,
}

impl<T> FetchedPage<T> {
  pub fn has_more(&self) -> bool {
    self.cursor.is_some()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
  /// Not started yet
  Idle,
  /// Fetching the first page with nothing to show
  Loading,
  /// Fetching a page after the last one
  LoadingMore,
  Ready,
  /// The last load failed; previously loaded pages are kept
  Error,
  /// The feed has no items at all
  Empty,
}

impl FeedStatus {
  pub fn is_loading(self) -> bool {
    matches!(self, Self::Loading | Self::LoadingMore)
  }
}

/// Point-in-time view of a feed, published on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot<T> {
  pub pages: Vec<Page<T>>,
  pub status: FeedStatus,
  pub last_error: Option<ErrorKind>,
}

impl<T> Default for FeedSnapshot<T> {
  fn default() -> Self {
    Self {
      pages: Vec::new(),
      status: FeedStatus::Idle,
      last_error: None,
    }
  }
}

impl<T: Cacheable> FeedSnapshot<T> {
  /// All entries across pages, in order.
  pub fn entries(&self) -> impl Iterator<Item = &FeedEntry<T>> {
    self.pages.iter().flat_map(|p| p.items.iter())
  }

  /// All items across pages, in order.
  pub fn items(&self) -> Vec<&T> {
    self.entries().map(FeedEntry::item).collect()
  }

  pub fn item_ids(&self) -> Vec<String> {
    self.entries().map(FeedEntry::id).collect()
  }

  pub fn has_more(&self) -> bool {
    self.pages.last().is_some_and(|p| p.has_more)
  }

  pub fn pending_count(&self) -> usize {
    self.entries().filter(|e| e.is_pending()).count()
  }
}

/// Mutable state behind one feed controller.
#[derive(Debug)]
pub(crate) struct FeedState<T> {
  pub pages: Vec<Page<T>>,
  pub status: FeedStatus,
  pub last_error: Option<ErrorKind>,
  /// Bumped whenever pages after the first are discarded, so a page fetched
  /// against the old sequence is not appended to the new one
  pub generation: u64,
  /// Whether any page came from the server. Optimistic inserts alone do
  /// not count.
  pub fetched: bool,
}

impl<T: Cacheable> FeedState<T> {
  pub fn new() -> Self {
    Self {
      pages: Vec::new(),
      status: FeedStatus::Idle,
      last_error: None,
      generation: 0,
      fetched: false,
    }
  }

  pub fn snapshot(&self) -> FeedSnapshot<T> {
    FeedSnapshot {
      pages: self.pages.clone(),
      status: self.status,
      last_error: self.last_error.clone(),
    }
  }

  fn ids(&self) -> HashSet<String> {
    self
      .pages
      .iter()
      .flat_map(|p| p.items.iter())
      .map(FeedEntry::id)
      .collect()
  }

  pub fn is_empty(&self) -> bool {
    self.pages.iter().all(|p| p.items.is_empty())
  }

  /// Status to settle on after a successful load.
  pub fn settled_status(&self) -> FeedStatus {
    if self.is_empty() {
      FeedStatus::Empty
    } else {
      FeedStatus::Ready
    }
  }

  /// Append `fetched` as a new page. Items already in the feed are skipped,
  /// except that a server copy replaces a pending optimistic copy in place.
  /// Returns how many items were appended.
  pub fn append(&mut self, fetched: FetchedPage<T>) -> usize {
    let mut seen = self.ids();
    let mut items = Vec::with_capacity(fetched.items.len());

    for item in fetched.items {
      let id = item.cache_key();
      if seen.contains(&id) {
        self.reconcile(&id, &item);
        continue;
      }
      seen.insert(id);
      items.push(FeedEntry::Confirmed { item });
    }

    self.fetched = true;
    let appended = items.len();
    let has_more = fetched.cursor.is_some();
    self.pages.push(Page {
      items,
      cursor: fetched.cursor,
      has_more,
    });
    appended
  }

  /// Replace an optimistic entry for `id` with the confirmed `item`.
  fn reconcile(&mut self, id: &str, item: &T) -> bool {
    for entry in self.pages.iter_mut().flat_map(|p| p.items.iter_mut()) {
      if entry.is_pending() && entry.id() == id {
        *entry = FeedEntry::Confirmed { item: item.clone() };
        return true;
      }
    }
    false
  }

  /// Replace the first page with `fetched`.
  ///
  /// Pending optimistic items not present in `fetched` stay at the head.
  /// Later pages survive only when the new first page ends at the same
  /// cursor as the old one; otherwise continuity is lost, they are dropped
  /// and `generation` moves on.
  pub fn replace_first(&mut self, fetched: FetchedPage<T>) {
    let server_ids: HashSet<String> = fetched.items.iter().map(Cacheable::cache_key).collect();

    let (pending, old_cursor) = match self.pages.first() {
      Some(first) => (
        first
          .items
          .iter()
          .filter(|e| e.is_pending() && !server_ids.contains(&e.id()))
          .cloned()
          .collect::<Vec<_>>(),
        Some(first.cursor.clone()),
      ),
      None => (Vec::new(), None),
    };

    let mut seen = HashSet::new();
    let mut items = pending;
    for entry in &items {
      seen.insert(entry.id());
    }
    for item in fetched.items {
      if seen.insert(item.cache_key()) {
        items.push(FeedEntry::Confirmed { item });
      }
    }

    // A page holding only optimistic entries has no server cursor to continue
    let continuous = self.fetched && old_cursor.as_ref() == Some(&fetched.cursor);
    self.fetched = true;
    let has_more = fetched.cursor.is_some();
    let first = Page {
      items,
      cursor: fetched.cursor,
      has_more,
    };

    if continuous && self.pages.len() > 1 {
      let mut rest = self.pages.split_off(1);
      for page in &mut rest {
        page.items.retain(|e| seen.insert(e.id()));
      }
      self.pages = std::iter::once(first).chain(rest).collect();
    } else {
      // Also invalidates a load_more in flight against the old last cursor
      self.generation += 1;
      self.pages = vec![first];
    }
  }

  /// Put an optimistic entry at the head of the first page.
  /// Returns false when an item with the same identity is already present.
  pub fn insert_optimistic(&mut self, item: T, now: DateTime<Utc>) -> bool {
    let id = item.cache_key();
    if self.ids().contains(&id) {
      return false;
    }

    let entry = FeedEntry::Optimistic {
      item,
      inserted_at: now,
    };
    match self.pages.first_mut() {
      Some(first) => first.items.insert(0, entry),
      None => self.pages.push(Page {
        items: vec![entry],
        cursor: None,
        has_more: false,
      }),
    }
    true
  }

  /// Drop optimistic entries inserted at or before `deadline`.
  /// Returns the identities removed.
  pub fn expire_optimistic(&mut self, deadline: DateTime<Utc>) -> Vec<String> {
    let mut expired = Vec::new();
    for page in &mut self.pages {
      page.items.retain(|entry| match entry {
        FeedEntry::Optimistic { inserted_at, .. } if *inserted_at <= deadline => {
          expired.push(entry.id());
          false
        }
        _ => true,
      });
    }
    expired
  }
}
