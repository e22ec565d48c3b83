//! Request client with in-flight coalescing, retry and timeouts.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::RetryPolicy;
use crate::config::LayerConfig;
use crate::error::ErrorKind;
use crate::lock::mutex_lock;

const SOURCE: &str = "client::request";

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, ErrorKind>>>;
type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

/// One network call shared by every caller that asked for the same key.
struct InFlight {
  /// Distinguishes this call from a later one under the same key
  id: u64,
  subscribers: usize,
  cancel: CancellationToken,
  /// `SharedResult<T>` for the caller's `T`
  shared: Box<dyn Any + Send + Sync>,
}

/// Per-call options.
///
/// When calls are coalesced, the attempt budget and timeout of the caller
/// that started the call apply to everyone.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  pub max_attempts: Option<u32>,
  pub timeout: Option<Duration>,
  /// Detaches only this caller when cancelled
  pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
  pub fn with_cancel(mut self, token: CancellationToken) -> Self {
    self.cancel = Some(token);
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Wraps outbound backend calls.
///
/// For all concurrent calls with the same request key exactly one execution
/// runs, and every caller receives a clone of the same settled result.
/// Transient failures are retried with exponential backoff; only the final
/// outcome is returned.
#[derive(Clone)]
pub struct RequestClient {
  policy: RetryPolicy,
  timeout: Duration,
  in_flight: InFlightMap,
  next_id: Arc<AtomicU64>,
}

impl RequestClient {
  pub fn new(policy: RetryPolicy, timeout: Duration) -> Self {
    Self {
      policy,
      timeout,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_id: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn from_config(config: &LayerConfig) -> Self {
    Self::new(
      RetryPolicy::from(config),
      Duration::from_millis(config.request_timeout_ms),
    )
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Number of distinct calls currently in flight.
  pub fn in_flight_count(&self) -> usize {
    mutex_lock(&self.in_flight, SOURCE, "in_flight_count").len()
  }

  /// Run `executor` under `request_key`, or join the call already running
  /// under that key.
  ///
  /// `executor` may be invoked several times when attempts fail transiently.
  /// Dropping the returned future (or cancelling `options.cancel`) detaches
  /// this caller; when the last caller detaches the call is aborted.
  pub async fn request<T, F, Fut>(
    &self,
    request_key: &str,
    executor: F,
    options: RequestOptions,
  ) -> Result<T, ErrorKind>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorKind>> + Send + 'static,
  {
    let (shared, subscriber) = match self.subscribe::<T, F, Fut>(request_key, executor, &options) {
      Subscribed::Joined(shared, subscriber) => (shared, subscriber),
      Subscribed::TypeMismatch(executor) => {
        // Same key, different result type: run on our own rather than fail
        warn!(
          key = request_key,
          "in-flight request has a different result type, not coalescing"
        );
        let policy = self.effective_policy(&options);
        let timeout = options.timeout.unwrap_or(self.timeout);
        let run = execute_with_retry(executor, policy, timeout, request_key.to_string());
        return match options.cancel {
          Some(token) => tokio::select! {
            _ = token.cancelled() => Err(ErrorKind::Cancelled),
            result = run => result,
          },
          None => run.await,
        };
      }
    };

    let result = match options.cancel {
      Some(token) => tokio::select! {
        _ = token.cancelled() => {
          debug!(key = request_key, "subscriber cancelled");
          Err(ErrorKind::Cancelled)
        }
        result = shared => result,
      },
      None => shared.await,
    };

    drop(subscriber);
    result
  }

  fn effective_policy(&self, options: &RequestOptions) -> RetryPolicy {
    RetryPolicy {
      max_attempts: options
        .max_attempts
        .unwrap_or(self.policy.max_attempts)
        .max(1),
      ..self.policy
    }
  }

  /// Attach to the existing call for `key` or start a new one.
  fn subscribe<T, F, Fut>(
    &self,
    key: &str,
    executor: F,
    options: &RequestOptions,
  ) -> Subscribed<T, F>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorKind>> + Send + 'static,
  {
    let mut map = mutex_lock(&self.in_flight, SOURCE, "subscribe");

    if let Some(existing) = map.get_mut(key) {
      return match existing.shared.downcast_ref::<SharedResult<T>>() {
        Some(shared) => {
          existing.subscribers += 1;
          debug!(
            key,
            subscribers = existing.subscribers,
            "joined in-flight request"
          );
          Subscribed::Joined(
            shared.clone(),
            Subscriber {
              map: Arc::clone(&self.in_flight),
              key: key.to_string(),
              id: existing.id,
            },
          )
        }
        None => Subscribed::TypeMismatch(executor),
      };
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let cancel = CancellationToken::new();
    let policy = self.effective_policy(options);
    let timeout = options.timeout.unwrap_or(self.timeout);

    let task = {
      let cancel = cancel.clone();
      let map = Arc::clone(&self.in_flight);
      let key = key.to_string();
      tokio::spawn(async move {
        let result = tokio::select! {
          _ = cancel.cancelled() => {
            debug!(key = %key, "aborted, no subscribers left");
            Err(ErrorKind::Cancelled)
          }
          result = execute_with_retry(executor, policy, timeout, key.clone()) => result,
        };

        // Settled: later callers start a fresh call
        let mut map = mutex_lock(&map, SOURCE, "settle");
        if map.get(&key).map(|f| f.id) == Some(id) {
          map.remove(&key);
        }
        result
      })
    };

    let shared: SharedResult<T> = async move {
      match task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(ErrorKind::Cancelled),
        Err(e) => Err(ErrorKind::unknown(format!("request task failed: {}", e))),
      }
    }
    .boxed()
    .shared();

    map.insert(
      key.to_string(),
      InFlight {
        id,
        subscribers: 1,
        cancel,
        shared: Box::new(shared.clone()),
      },
    );
    debug!(key, "started request");

    Subscribed::Joined(
      shared,
      Subscriber {
        map: Arc::clone(&self.in_flight),
        key: key.to_string(),
        id,
      },
    )
  }
}

enum Subscribed<T, F> {
  Joined(SharedResult<T>, Subscriber),
  TypeMismatch(F),
}

/// Detaches one caller from an in-flight call when dropped.
struct Subscriber {
  map: InFlightMap,
  key: String,
  id: u64,
}

impl Drop for Subscriber {
  fn drop(&mut self) {
    let mut map = mutex_lock(&self.map, SOURCE, "unsubscribe");
    let Some(in_flight) = map.get_mut(&self.key) else {
      return;
    };
    // Already settled and replaced by a newer call
    if in_flight.id != self.id {
      return;
    }

    in_flight.subscribers = in_flight.subscribers.saturating_sub(1);
    if in_flight.subscribers == 0 {
      in_flight.cancel.cancel();
      map.remove(&self.key);
    }
  }
}

/// Run `executor` until it succeeds, fails terminally, or the attempt budget
/// is spent. Each attempt is bounded by `timeout`.
async fn execute_with_retry<T, F, Fut>(
  executor: F,
  policy: RetryPolicy,
  timeout: Duration,
  key: String,
) -> Result<T, ErrorKind>
where
  F: Fn() -> Fut,
  Fut: Future<Output = Result<T, ErrorKind>>,
{
  let mut attempt = 0;
  loop {
    let outcome = match tokio::time::timeout(timeout, executor()).await {
      Ok(outcome) => outcome,
      Err(_) => Err(ErrorKind::timeout(timeout)),
    };

    match outcome {
      Ok(value) => return Ok(value),
      Err(error) if policy.should_retry(attempt, &error) => {
        let delay = jittered_delay(&policy, attempt, &error);
        debug!(
          key = %key,
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          error = %error,
          "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(error) => {
        debug!(key = %key, attempts = attempt + 1, error = %error, "request failed");
        return Err(error);
      }
    }
  }
}

/// Kept out of the async fn so the thread-local rng never lives across an await.
fn jittered_delay(policy: &RetryPolicy, attempt: u32, error: &ErrorKind) -> Duration {
  policy.delay_for(attempt, error, &mut rand::rng())
}
