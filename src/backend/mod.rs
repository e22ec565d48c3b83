//! Backend query contract.
//!
//! The layer only needs two calls from the remote data service: a cursor
//! paginated read and a write. Cursors are opaque and passed through exactly
//! as the server issued them.

mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::cache::Cacheable;
use crate::client::{cursor_segment, request_key, QueryKey};
use crate::error::ErrorKind;

pub type Filters = BTreeMap<String, String>;

/// A paginated read of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadQuery {
  pub resource: String,
  #[serde(default)]
  pub filters: Filters,
  pub cursor: Option<String>,
  pub limit: u32,
}

impl ReadQuery {
  pub fn new(resource: impl Into<String>, limit: u32) -> Self {
    Self {
      resource: resource.into(),
      filters: Filters::new(),
      cursor: None,
      limit,
    }
  }

  pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.filters.insert(key.into(), value.into());
    self
  }

  pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
    self.cursor = cursor;
    self
  }
}

impl QueryKey for ReadQuery {
  fn cache_hash(&self) -> String {
    // Filters are a BTreeMap, so their order is already canonical
    let filters = self
      .filters
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");
    request_key([
      "read",
      self.resource.as_str(),
      filters.as_str(),
      cursor_segment(self.cursor.as_deref()).as_str(),
      self.limit.to_string().as_str(),
    ])
  }

  fn description(&self) -> String {
    match &self.cursor {
      Some(cursor) => format!("{} after {}", self.resource, cursor),
      None => format!("{} (first page)", self.resource),
    }
  }
}

/// One page as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
  pub items: Vec<Value>,
  /// `None` marks the end of the sequence
  #[serde(default)]
  pub next_cursor: Option<String>,
}

/// A mutation of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCommand {
  pub resource: String,
  pub operation: String,
  pub payload: Value,
}

impl WriteCommand {
  pub fn new(resource: impl Into<String>, operation: impl Into<String>, payload: Value) -> Self {
    Self {
      resource: resource.into(),
      operation: operation.into(),
      payload,
    }
  }
}

/// A backend record: an identity plus whatever fields the resource has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Item {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      fields: Map::new(),
    }
  }

  pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
    self.fields.insert(key.into(), value);
    self
  }
}

impl Cacheable for Item {
  fn cache_key(&self) -> String {
    self.id.clone()
  }
}

/// Accept both `"id": "42"` and `"id": 42`.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

/// The remote data service.
#[async_trait]
pub trait Backend: Send + Sync {
  async fn read(&self, query: &ReadQuery) -> Result<ReadResponse, ErrorKind>;

  async fn write(&self, command: &WriteCommand) -> Result<Item, ErrorKind>;
}

/// Source of dashboard aggregates.
#[async_trait]
pub trait StatsSource: Send + Sync {
  async fn fetch_stats(&self, key: &str) -> Result<Value, ErrorKind>;
}
