//! Deterministic request keys.

use sha2::{Digest, Sha256};

/// Something that identifies one logical backend call.
///
/// Two values describing the same call must produce the same hash; the
/// request client uses it to coalesce concurrent calls.
pub trait QueryKey {
  /// Stable, fixed-length identity of the call
  fn cache_hash(&self) -> String;

  /// Human readable description for logs
  fn description(&self) -> String;
}

/// SHA256 hex of `input`, for stable fixed-length keys.
pub fn hash_key(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Key segment for a page position. Real cursors are prefixed so no server
/// cursor can collide with the first page.
pub fn cursor_segment(cursor: Option<&str>) -> String {
  match cursor {
    Some(cursor) => format!("c:{}", cursor),
    None => "head".to_string(),
  }
}

/// Build a request key from an endpoint and its parameters.
///
/// Parts are trimmed and joined with a separator that cannot appear in a
/// trimmed part boundary, so `["a", "b:c"]` and `["a:b", "c"]` differ.
pub fn request_key<I, S>(parts: I) -> String
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let joined = parts
    .into_iter()
    .map(|p| {
      let p = p.as_ref().trim();
      format!("{}:{}", p.len(), p)
    })
    .collect::<Vec<_>>()
    .join("|");
  hash_key(&joined)
}
