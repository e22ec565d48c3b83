//! Where feed pages come from.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

use super::types::FetchedPage;
use crate::backend::{Backend, ReadQuery};
use crate::cache::Cacheable;
use crate::client::QueryKey;
use crate::error::ErrorKind;

/// Fetches one page of a feed given the cursor of the previous page.
#[async_trait]
pub trait PageSource<T: Cacheable>: Send + Sync {
  async fn fetch_page(&self, cursor: Option<String>) -> Result<FetchedPage<T>, ErrorKind>;

  /// Identity of the call that fetches the page after `cursor`, for
  /// coalescing. `None` lets the controller derive one from the feed key.
  fn request_key(&self, _cursor: Option<&str>) -> Option<String> {
    None
  }
}

/// Pages read from a [`Backend`] resource.
pub struct BackendSource<T> {
  backend: Arc<dyn Backend>,
  query: ReadQuery,
  _item: PhantomData<fn() -> T>,
}

impl<T> BackendSource<T> {
  /// `query.cursor` is ignored; each fetch supplies its own.
  pub fn new(backend: Arc<dyn Backend>, query: ReadQuery) -> Self {
    Self {
      backend,
      query,
      _item: PhantomData,
    }
  }

  pub fn query(&self) -> &ReadQuery {
    &self.query
  }
}

#[async_trait]
impl<T: Cacheable> PageSource<T> for BackendSource<T> {
  async fn fetch_page(&self, cursor: Option<String>) -> Result<FetchedPage<T>, ErrorKind> {
    let query = self.query.clone().with_cursor(cursor);
    let response = self.backend.read(&query).await?;

    let items = response
      .items
      .into_iter()
      .map(serde_json::from_value)
      .collect::<Result<Vec<T>, _>>()?;

    Ok(FetchedPage {
      items,
      cursor: response.next_cursor,
    })
  }

  fn request_key(&self, cursor: Option<&str>) -> Option<String> {
    let query = self.query.clone().with_cursor(cursor.map(String::from));
    Some(query.cache_hash())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::{Item, ReadResponse, WriteCommand};
  use serde_json::json;
  use std::sync::Mutex;

  struct RecordingBackend {
    queries: Mutex<Vec<ReadQuery>>,
  }

  #[async_trait]
  impl Backend for RecordingBackend {
    async fn read(&self, query: &ReadQuery) -> Result<ReadResponse, ErrorKind> {
      self.queries.lock().unwrap().push(query.clone());
      Ok(ReadResponse {
        items: vec![json!({"id": 1, "title": "first"}), json!({"id": "2"})],
        next_cursor: Some("opaque==".to_string()),
      })
    }

    async fn write(&self, _command: &WriteCommand) -> Result<Item, ErrorKind> {
      Err(ErrorKind::unknown("read only"))
    }
  }

  #[tokio::test]
  async fn test_backend_source_passes_cursor_through() {
    let backend = Arc::new(RecordingBackend {
      queries: Mutex::new(Vec::new()),
    });
    let source: BackendSource<Item> =
      BackendSource::new(backend.clone(), ReadQuery::new("posts", 2).with_filter("tag", "rust"));

    let page = source.fetch_page(Some("opaque==".to_string())).await.unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].id, "1");
    assert_eq!(page.cursor.as_deref(), Some("opaque=="));

    let queries = backend.queries.lock().unwrap();
    assert_eq!(queries[0].cursor.as_deref(), Some("opaque=="));
    assert_eq!(queries[0].filters["tag"], "rust");
  }

  #[test]
  fn test_backend_source_request_key_follows_query() {
    let backend = Arc::new(RecordingBackend {
      queries: Mutex::new(Vec::new()),
    });
    let query = ReadQuery::new("posts", 2).with_filter("tag", "rust");
    let source: BackendSource<Item> = BackendSource::new(backend, query.clone());

    assert_eq!(
      PageSource::request_key(&source, Some("c1")),
      Some(query.clone().with_cursor(Some("c1".to_string())).cache_hash())
    );
    assert_eq!(PageSource::request_key(&source, None), Some(query.cache_hash()));
  }
}
