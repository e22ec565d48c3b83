//! Cursor-paginated feeds.
//!
//! A [`FeedController`] owns the pages of one feed: it deduplicates items
//! across pages, serves the first page stale-while-revalidate, and tracks
//! optimistic inserts until the server confirms them. The [`FeedRegistry`]
//! shares one controller between every view observing the same feed.

mod controller;
mod registry;
mod source;
mod types;

pub use controller::{feed_tag, FeedConfig, FeedController, LoadOutcome};
pub use registry::{FeedRegistry, FeedSubscription};
pub use source::{BackendSource, PageSource};
pub use types::{FeedEntry, FeedSnapshot, FeedStatus, FetchedPage, Page};
