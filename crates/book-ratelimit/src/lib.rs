//! Per-`(principal, endpoint-class)` rolling-window rate limiter.
//!
//! Generalizes the single global sliding-window limiter used by request
//! middleware into a keyed map of independent windows, as required by the
//! per-caller admission control component.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use book_core::BookError;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub principal: String,
    pub endpoint_class: String,
}

impl RateLimitKey {
    pub fn new(principal: impl Into<String>, endpoint_class: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            endpoint_class: endpoint_class.into(),
        }
    }
}

struct Window {
    timestamps: VecDeque<Instant>,
}

impl Window {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }
}

/// Atomic increment-and-check rolling window counter, keyed by principal
/// and endpoint class. Counters expire automatically: entries outside the
/// window are dropped on the next check for that key.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<RateLimitKey, Window>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    /// Default policy: 100 requests/minute per principal.
    pub fn default_policy() -> Self {
        Self::new(100, Duration::from_secs(60))
    }

    /// Check and, if admitted, record one request for `key`. On exceed,
    /// returns a `RateLimited` [`BookError`] carrying a `retryAfterSecs`
    /// context hint.
    pub async fn check(&self, key: &RateLimitKey) -> Result<(), BookError> {
        let now = Instant::now();
        let mut guard = self.windows.lock().await;
        let entry = guard.entry(key.clone()).or_insert_with(Window::new);

        while let Some(&front) = entry.timestamps.front() {
            if now.duration_since(front) > self.window {
                entry.timestamps.pop_front();
            } else {
                break;
            }
        }

        if entry.timestamps.len() as u32 >= self.max_requests {
            let retry_after = entry
                .timestamps
                .front()
                .map(|&front| self.window.saturating_sub(now.duration_since(front)))
                .unwrap_or(self.window);
            return Err(BookError::rate_limited(retry_after.as_secs().max(1)));
        }

        entry.timestamps.push_back(now);
        Ok(())
    }
}

/// Derives a [`RateLimitKey`] from an inbound request. `book-daemon` wires
/// this to read the authenticated principal (or source address) and a
/// coarse endpoint class (e.g. `"search"`, `"batch"`).
pub trait KeyExtractor: Clone + Send + Sync + 'static {
    fn extract(&self, req: &axum::extract::Request) -> RateLimitKey;
}

impl<F> KeyExtractor for F
where
    F: Fn(&axum::extract::Request) -> RateLimitKey + Clone + Send + Sync + 'static,
{
    fn extract(&self, req: &axum::extract::Request) -> RateLimitKey {
        (self)(req)
    }
}

/// A [`tower::Layer`] that enforces [`RateLimiter`] admission before
/// forwarding to the wrapped service.
#[derive(Clone)]
pub struct RateLimiterLayer<K> {
    limiter: RateLimiter,
    key_extractor: K,
}

impl<K: KeyExtractor> RateLimiterLayer<K> {
    pub fn new(limiter: RateLimiter, key_extractor: K) -> Self {
        Self {
            limiter,
            key_extractor,
        }
    }
}

impl<S: Clone, K: KeyExtractor> tower::Layer<S> for RateLimiterLayer<K> {
    type Service = RateLimiterService<S, K>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimiterService {
            limiter: self.limiter.clone(),
            key_extractor: self.key_extractor.clone(),
            inner,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiterService<S, K> {
    limiter: RateLimiter,
    key_extractor: K,
    inner: S,
}

impl<S, K> tower::Service<axum::extract::Request> for RateLimiterService<S, K>
where
    S: tower::Service<axum::extract::Request, Response = axum::response::Response>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    S::Error: Send,
    K: KeyExtractor,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: axum::extract::Request) -> Self::Future {
        let limiter = self.limiter.clone();
        let key = self.key_extractor.extract(&req);
        let mut inner = self.inner.clone();
        Box::pin(async move {
            match limiter.check(&key).await {
                Ok(()) => inner.call(req).await,
                Err(err) => {
                    use axum::response::IntoResponse;
                    let retry_after = err
                        .context
                        .get("retryAfterSecs")
                        .cloned()
                        .unwrap_or_else(|| "60".to_string());
                    let mut resp = (axum::http::StatusCode::TOO_MANY_REQUESTS, err.message)
                        .into_response();
                    if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after) {
                        resp.headers_mut().insert("retry-after", value);
                    }
                    Ok(resp)
                }
            }
        })
    }
}
