//! Client-side data-access layer.
//!
//! Sits between views and a remote data service: reads go through a TTL and
//! tag aware cache, concurrent identical requests share one network call,
//! transient failures are retried with backoff, and paginated feeds are
//! assembled without duplicates.

pub mod backend;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod layer;
mod lock;
pub mod stats;

pub use error::ErrorKind;
pub use layer::DataLayer;
