//! Outbound request handling: coalescing, retry with backoff, timeouts.

mod backoff;
mod key;
mod request;

pub use backoff::RetryPolicy;
pub use key::{cursor_segment, hash_key, request_key, QueryKey};
pub use request::{RequestClient, RequestOptions};
