//! HTTP implementation of the backend contract.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Backend, Item, ReadQuery, ReadResponse, StatsSource, WriteCommand};
use crate::client::QueryKey;
use crate::config::{BackendConfig, Config};
use crate::error::ErrorKind;

/// Backend reached over HTTP/JSON.
///
/// Reads map to `GET {base}/{resource}?limit=..&cursor=..&<filters>`, writes
/// to `POST {base}/{resource}/{operation}`, stats to `GET {base}/stats/{key}`.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
  timeout: Duration,
}

impl HttpBackend {
  pub fn new(config: &BackendConfig, timeout: Duration) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid backend url {}: {}", config.url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Backend url {} cannot be used as a base", config.url));
    }

    let client = reqwest::Client::builder()
      .connect_timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token: Config::get_api_token(),
      timeout,
    })
  }

  /// `base` with `segments` appended as path segments.
  fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, ErrorKind> {
    let mut url = self.base.clone();
    {
      let mut path = url
        .path_segments_mut()
        .map_err(|_| ErrorKind::unknown(format!("invalid base url {}", self.base)))?;
      path.pop_if_empty();
      for segment in segments {
        path.extend(segment.split('/').filter(|s| !s.is_empty()));
      }
    }
    Ok(url)
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ErrorKind> {
    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| self.classify(&e))?;

    let response = check_status(response).await?;
    response.json::<T>().await.map_err(|e| self.classify(&e))
  }

  /// Map a transport failure onto the error taxonomy.
  fn classify(&self, e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
      ErrorKind::timeout(self.timeout)
    } else if let Some(status) = e.status() {
      ErrorKind::from_status(status.as_u16(), &e.to_string(), None)
        .unwrap_or_else(|| ErrorKind::unknown(e.to_string()))
    } else if e.is_decode() || e.is_builder() || e.is_redirect() {
      ErrorKind::unknown(e.to_string())
    } else {
      // connect, request and body errors
      ErrorKind::network(e.to_string())
    }
  }
}

/// Turn a non-success response into its classified error.
async fn check_status(response: Response) -> Result<Response, ErrorKind> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let retry_after = parse_retry_after(response.headers());
  let body = response.text().await.unwrap_or_default();
  Err(
    ErrorKind::from_status(status.as_u16(), &body, retry_after)
      .unwrap_or_else(|| ErrorKind::unknown(format!("unexpected status {}", status))),
  )
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored and
/// the regular backoff applies.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
  headers
    .get(RETRY_AFTER)?
    .to_str()
    .ok()?
    .trim()
    .parse::<u64>()
    .ok()
    .map(Duration::from_secs)
}

#[async_trait]
impl Backend for HttpBackend {
  async fn read(&self, query: &ReadQuery) -> Result<ReadResponse, ErrorKind> {
    let mut url = self.endpoint([query.resource.as_str()])?;
    {
      let mut pairs = url.query_pairs_mut();
      pairs.append_pair("limit", &query.limit.to_string());
      if let Some(cursor) = &query.cursor {
        pairs.append_pair("cursor", cursor);
      }
      for (key, value) in &query.filters {
        pairs.append_pair(key, value);
      }
    }

    debug!(%url, query = %query.description(), "GET");
    self.send(self.client.get(url)).await
  }

  async fn write(&self, command: &WriteCommand) -> Result<Item, ErrorKind> {
    let url = self.endpoint([command.resource.as_str(), command.operation.as_str()])?;

    debug!(%url, "POST");
    self
      .send(self.client.post(url).json(&command.payload))
      .await
  }
}

#[async_trait]
impl StatsSource for HttpBackend {
  async fn fetch_stats(&self, key: &str) -> Result<Value, ErrorKind> {
    let url = self.endpoint(["stats", key])?;

    debug!(%url, "GET");
    self.send(self.client.get(url)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  fn backend(url: &str) -> HttpBackend {
    let config = BackendConfig {
      url: url.to_string(),
      page_size: 20,
    };
    HttpBackend::new(&config, Duration::from_secs(1)).unwrap()
  }

  #[test]
  fn test_endpoint_appends_segments() {
    let b = backend("https://api.example.com/v1");
    assert_eq!(
      b.endpoint(["posts", "create"]).unwrap().as_str(),
      "https://api.example.com/v1/posts/create"
    );

    let b = backend("https://api.example.com/v1/");
    assert_eq!(
      b.endpoint(["admin/reviews"]).unwrap().as_str(),
      "https://api.example.com/v1/admin/reviews"
    );
  }

  #[test]
  fn test_rejects_non_base_url() {
    let config = BackendConfig {
      url: "mailto:someone@example.com".to_string(),
      page_size: 20,
    };
    assert!(HttpBackend::new(&config, Duration::from_secs(1)).is_err());
  }

  #[test]
  fn test_retry_after_seconds() {
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
    assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));

    headers.insert(
      RETRY_AFTER,
      HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
    );
    assert_eq!(parse_retry_after(&headers), None);
  }
}
