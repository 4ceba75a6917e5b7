//! Rate-paced fetcher: the single process-wide scheduler every outbound
//! call to the external market API funnels through. Owns the pacing
//! state, the bounded-parallelism batch runner, and the response cache.

pub mod cache;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use cache::TtlLruCache;

pub const MAX_PARALLEL: usize = 5;
pub const RATE_MIN_MS: u64 = 1200;
pub const RATE_MAX_MS: u64 = 12000;
pub const START_RATE_MS: u64 = 3000;

const CACHE_CAPACITY: usize = 5000;
const CACHE_TTL: Duration = Duration::from_secs(20 * 60);
const MAX_ATTEMPTS: u32 = 7;
const INITIAL_BACKOFF_MS: u64 = 900;
const MAX_BACKOFF_MS: u64 = 30_000;
const COOLDOWN: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Pacing bounds the scheduler adapts within. Defaults match the values
/// this service ships with; `Fetcher::with_default_transport` threads the
/// operator's `STEAM_RATE_*` environment overrides through instead.
#[derive(Debug, Clone, Copy)]
pub struct PacingBounds {
    pub start_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for PacingBounds {
    fn default() -> Self {
        Self {
            start_ms: START_RATE_MS,
            min_ms: RATE_MIN_MS,
            max_ms: RATE_MAX_MS,
        }
    }
}

/// The decoded shape of a transport-level response, abstracted away from
/// `reqwest` so the scheduler and retry policy can be exercised against a
/// scripted mock in tests.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout,
    Connection(String),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, TransportError>;
}

/// Production transport: a pooled `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("tradeup-backend/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = resp
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);

        Ok(TransportResponse {
            status,
            body,
            retry_after,
        })
    }
}

struct Pacing {
    pause_ms: u64,
    cooldown_until: Option<Instant>,
    bounds: PacingBounds,
}

/// What to fetch, plus the key it should be cached under.
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub cache_key: String,
}

struct PendingRequest {
    req: FetchRequest,
    respond_to: oneshot::Sender<AppResult<serde_json::Value>>,
}

struct FetcherInner {
    transport: Arc<dyn HttpTransport>,
    pacing: Mutex<Pacing>,
    cache: Mutex<TtlLruCache<serde_json::Value>>,
    queue: Mutex<std::collections::VecDeque<PendingRequest>>,
    notify: Notify,
}

#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, bounds: PacingBounds) -> Self {
        let inner = Arc::new(FetcherInner {
            transport,
            pacing: Mutex::new(Pacing {
                pause_ms: bounds.start_ms,
                cooldown_until: None,
                bounds,
            }),
            cache: Mutex::new(TtlLruCache::new(CACHE_CAPACITY, CACHE_TTL)),
            queue: Mutex::new(std::collections::VecDeque::new()),
            notify: Notify::new(),
        });

        let runner_inner = inner.clone();
        tokio::spawn(async move { run_scheduler(runner_inner).await });

        Self { inner }
    }

    pub fn with_default_transport(bounds: PacingBounds) -> Self {
        Self::new(Arc::new(ReqwestTransport::new()), bounds)
    }

    pub fn current_pause_ms(&self) -> u64 {
        self.inner.pacing.lock().pause_ms
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.inner.pacing.lock().cooldown_until?;
        let now = Instant::now();
        if until > now {
            Some(until - now)
        } else {
            None
        }
    }

    /// Fetch `request`, serving from cache when fresh.
    pub async fn get(&self, request: FetchRequest) -> AppResult<serde_json::Value> {
        if let Some(cached) = self.inner.cache.lock().get(&request.cache_key) {
            return Ok(cached);
        }

        let (tx, rx) = oneshot::channel();
        self.inner.queue.lock().push_back(PendingRequest {
            req: request,
            respond_to: tx,
        });
        self.inner.notify.notify_one();

        rx.await
            .unwrap_or_else(|_| Err(AppError::Transport("fetcher runner dropped".into())))
    }

    /// Convenience wrapper decoding the payload into `T`.
    pub async fn get_data<T: DeserializeOwned>(&self, request: FetchRequest) -> AppResult<T> {
        let value = self.get(request).await?;
        serde_json::from_value(value).map_err(|e| AppError::Parse(e.to_string()))
    }
}

async fn run_scheduler(inner: Arc<FetcherInner>) {
    loop {
        let cooldown = inner.pacing.lock().cooldown_until;
        if let Some(until) = cooldown {
            let now = Instant::now();
            if until > now {
                sleep(until - now).await;
            }
        }

        let batch: Vec<PendingRequest> = {
            let mut q = inner.queue.lock();
            let n = q.len().min(MAX_PARALLEL);
            q.drain(..n).collect()
        };

        if batch.is_empty() {
            inner.notify.notified().await;
            continue;
        }

        let futs = batch
            .into_iter()
            .map(|pending| execute_with_retry(inner.clone(), pending));
        futures_util::future::join_all(futs).await;

        let pause_ms = inner.pacing.lock().pause_ms;
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        sleep(Duration::from_millis((pause_ms as f64 * jitter) as u64)).await;
    }
}

async fn execute_with_retry(inner: Arc<FetcherInner>, pending: PendingRequest) {
    let PendingRequest { req, respond_to } = pending;
    let mut backoff = INITIAL_BACKOFF_MS;

    for attempt in 1..=MAX_ATTEMPTS {
        let outcome = timeout(
            REQUEST_TIMEOUT,
            inner.transport.get(&req.url, &req.query),
        )
        .await;

        match outcome {
            Ok(Ok(resp)) if resp.status == 429 => {
                record_rate_limited(&inner);
                if attempt == MAX_ATTEMPTS {
                    let retry_after = resp.retry_after.unwrap_or(COOLDOWN);
                    let _ = respond_to.send(Err(AppError::RateLimited { retry_after }));
                    return;
                }
                warn!(attempt, "rate limited, backing off");
                sleep_jittered(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
            Ok(Ok(resp)) if resp.status >= 500 => {
                if attempt == MAX_ATTEMPTS {
                    let _ = respond_to.send(Err(AppError::Transport(format!(
                        "upstream {} after {attempt} attempts",
                        resp.status
                    ))));
                    return;
                }
                sleep_jittered(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
            Ok(Ok(resp)) if resp.status >= 400 => {
                let _ = respond_to.send(Err(AppError::Transport(format!(
                    "upstream {} (non-retriable)",
                    resp.status
                ))));
                return;
            }
            Ok(Ok(resp)) => {
                record_success(&inner);
                inner.cache.lock().put(req.cache_key.clone(), resp.body.clone());
                let _ = respond_to.send(Ok(resp.body));
                return;
            }
            Ok(Err(TransportError::Connection(e))) => {
                if attempt == MAX_ATTEMPTS {
                    let _ = respond_to.send(Err(AppError::Transport(e)));
                    return;
                }
                debug!(attempt, error = %e, "connection error, retrying");
                sleep_jittered(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
            Ok(Err(TransportError::Timeout)) | Err(_) => {
                if attempt == MAX_ATTEMPTS {
                    let _ = respond_to.send(Err(AppError::Transport("request timed out".into())));
                    return;
                }
                sleep_jittered(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

fn record_success(inner: &FetcherInner) {
    let mut p = inner.pacing.lock();
    let min_ms = p.bounds.min_ms;
    p.pause_ms = p.pause_ms.saturating_sub(100).max(min_ms);
}

fn record_rate_limited(inner: &FetcherInner) {
    let mut p = inner.pacing.lock();
    let max_ms = p.bounds.max_ms;
    p.pause_ms = (((p.pause_ms as f64) * 1.35).floor() as u64 + 250).min(max_ms);
    p.cooldown_until = Some(Instant::now() + COOLDOWN);
}

async fn sleep_jittered(base_ms: u64) {
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    sleep(Duration::from_millis((base_ms as f64 * jitter) as u64)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        responses: Mutex<Vec<Result<TransportResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(
            &self,
            _url: &str,
            _query: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(TransportResponse {
                    status: 200,
                    body: serde_json::json!({"ok": true}),
                    retry_after: None,
                })
            } else {
                responses.remove(0)
            }
        }
    }

    fn ok_response() -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: 200,
            body: serde_json::json!({"ok": true}),
            retry_after: None,
        })
    }

    fn rate_limited_response(retry_after: Duration) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: 429,
            body: serde_json::Value::Null,
            retry_after: Some(retry_after),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_a_single_rate_limit() {
        let transport = Arc::new(ScriptedTransport {
            responses: Mutex::new(vec![
                rate_limited_response(Duration::from_secs(2)),
                ok_response(),
            ]),
            calls: AtomicUsize::new(0),
        });
        let fetcher = Fetcher::new(transport.clone(), PacingBounds::default());
        let pause_before = fetcher.current_pause_ms();

        let handle = tokio::spawn({
            let fetcher = fetcher.clone();
            async move {
                fetcher
                    .get(FetchRequest {
                        url: "https://example.test/price".to_string(),
                        query: vec![],
                        cache_key: "price:x".to_string(),
                    })
                    .await
            }
        });

        tokio::time::advance(Duration::from_secs(60)).await;
        let result = handle.await.unwrap();
        assert!(result.is_ok());
        assert!(transport.calls.load(Ordering::SeqCst) >= 2);
        // pacing rose on the 429 before falling back on the following success.
        assert!(fetcher.current_pause_ms() >= RATE_MIN_MS);
        assert!(pause_before >= RATE_MIN_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let responses: Vec<_> = (0..10)
            .map(|_| rate_limited_response(Duration::from_millis(100)))
            .collect();
        let transport = Arc::new(ScriptedTransport {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        });
        let fetcher = Fetcher::new(transport.clone(), PacingBounds::default());

        let handle = tokio::spawn({
            let fetcher = fetcher.clone();
            async move {
                fetcher
                    .get(FetchRequest {
                        url: "https://example.test/price".to_string(),
                        query: vec![],
                        cache_key: "price:y".to_string(),
                    })
                    .await
            }
        });

        tokio::time::advance(Duration::from_secs(300)).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AppError::RateLimited { .. })));
        assert!(transport.calls.load(Ordering::SeqCst) <= MAX_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_responses_are_cached() {
        let transport = Arc::new(ScriptedTransport {
            responses: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let fetcher = Fetcher::new(transport.clone(), PacingBounds::default());

        for _ in 0..2 {
            let fetcher = fetcher.clone();
            let handle = tokio::spawn(async move {
                fetcher
                    .get(FetchRequest {
                        url: "https://example.test/price".to_string(),
                        query: vec![],
                        cache_key: "price:cached".to_string(),
                    })
                    .await
            });
            tokio::time::advance(Duration::from_secs(10)).await;
            handle.await.unwrap().unwrap();
        }

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
