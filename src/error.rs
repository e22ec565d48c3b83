//! Normalized error taxonomy surfaced by the data-access layer.
//!
//! Every failure coming out of a backend call is mapped to one [`ErrorKind`],
//! so consumers never need to look at transport-specific error shapes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Field name -> validation messages.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Classified failure of a backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
  /// Connection failures and 5xx-class responses. Retryable.
  #[error("network error: {message}")]
  Network {
    message: String,
    status: Option<u16>,
  },

  /// An attempt exceeded its hard timeout. Retryable.
  #[error("timed out after {after_ms}ms")]
  Timeout { after_ms: u64 },

  /// The server asked us to slow down. Retryable, honoring `retry_after_ms`.
  #[error("rate limited")]
  RateLimited { retry_after_ms: Option<u64> },

  #[error("not found: {message}")]
  NotFound { message: String },

  #[error("validation failed: {message}")]
  Validation { message: String, fields: FieldErrors },

  /// Never retried; upstream should run its session handling.
  #[error("authentication failed: {message}")]
  Auth { message: String },

  /// The subscriber cancelled before the call settled.
  #[error("request cancelled")]
  Cancelled,

  #[error("{message}")]
  Unknown { message: String },
}

impl ErrorKind {
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      message: message.into(),
      status: None,
    }
  }

  pub fn timeout(after: Duration) -> Self {
    Self::Timeout {
      after_ms: after.as_millis() as u64,
    }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::NotFound {
      message: message.into(),
    }
  }

  pub fn validation(message: impl Into<String>, fields: FieldErrors) -> Self {
    Self::Validation {
      message: message.into(),
      fields,
    }
  }

  pub fn auth(message: impl Into<String>) -> Self {
    Self::Auth {
      message: message.into(),
    }
  }

  pub fn unknown(message: impl Into<String>) -> Self {
    Self::Unknown {
      message: message.into(),
    }
  }

  /// Classify an HTTP status code.
  ///
  /// Returns `None` for success statuses. `body` is used as the message and,
  /// for validation failures, parsed for field-level detail.
  pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Option<Self> {
    let message = if body.trim().is_empty() {
      format!("HTTP {}", status)
    } else {
      body.trim().to_string()
    };

    let kind = match status {
      200..=399 => return None,
      401 | 403 => Self::Auth { message },
      404 | 410 => Self::NotFound { message },
      400 | 422 => Self::Validation {
        fields: parse_field_errors(body),
        message,
      },
      429 => Self::RateLimited {
        retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
      },
      408 | 500..=599 => Self::Network {
        message,
        status: Some(status),
      },
      _ => Self::Unknown { message },
    };
    Some(kind)
  }

  /// Whether the request client may retry after this failure.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::Network { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
    )
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Auth { .. })
  }

  /// Server-suggested delay before the next attempt, if any.
  pub fn retry_after(&self) -> Option<Duration> {
    match self {
      Self::RateLimited {
        retry_after_ms: Some(ms),
      } => Some(Duration::from_millis(*ms)),
      _ => None,
    }
  }
}

impl From<serde_json::Error> for ErrorKind {
  fn from(e: serde_json::Error) -> Self {
    Self::unknown(format!("Failed to decode payload: {}", e))
  }
}

/// Extract `{"errors": {"field": ["message", ...]}}` from a response body.
///
/// A single string per field is accepted as well. Anything else yields an
/// empty map.
fn parse_field_errors(body: &str) -> FieldErrors {
  let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
    return FieldErrors::new();
  };

  let Some(errors) = value.get("errors").and_then(|e| e.as_object()) else {
    return FieldErrors::new();
  };

  errors
    .iter()
    .map(|(field, messages)| {
      let messages = match messages {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(items) => items
          .iter()
          .filter_map(|m| m.as_str().map(String::from))
          .collect(),
        other => vec![other.to_string()],
      };
      (field.clone(), messages)
    })
    .collect()
}
