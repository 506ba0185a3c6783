//! Resilient client for the upstream embedding / LLM HTTP API.
//!
//! Every attempt goes through, in order:
//! - optional request pacing (`rate_limit_rpm`)
//! - a semaphore permit bounding in-flight requests
//! - the circuit breaker (fails fast with `CircuitOpen` while open)
//! - the HTTP request itself, bounded by `request_timeout_secs`
//!
//! Transient failures (timeouts, connection errors, 408/429/5xx) are retried
//! with `backoff_base^n * backoff_unit_ms` delays, so `max_retries = k` means
//! at most `k + 1` attempts. Permits are released between attempts.
//!
//! Breaker policy: after `circuit_breaker_threshold` consecutive failed
//! attempts the breaker opens for `circuit_breaker_cooldown_secs`. When the
//! cooldown has elapsed a single probe request is let through; success
//! closes the breaker, failure re-opens it. `reset_circuit()` closes it
//! immediately.

use reqwest::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::config::ApiClientConfig;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Circuit breaker open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("All {attempts} attempts failed, last error: {last}")]
    RetryExhausted { attempts: u32, last: Box<ApiError> },

    #[error("Client shut down")]
    Closed,
}

impl ApiError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(e) => !e.is_builder() && !e.is_redirect(),
            ApiError::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of the breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub open: bool,
    /// Time left until a probe is allowed; `None` when closed.
    pub open_for: Option<Duration>,
    pub phase: BreakerPhase,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
///
/// State machine:
///   Closed   --[threshold consecutive failures]--> Open
///   Open     --[cooldown elapsed, one probe]-----> HalfOpen
///   HalfOpen --[success]-------------------------> Closed
///   HalfOpen --[failure]-------------------------> Open
///   any      --[reset()]-------------------------> Closed
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    /// 0 disables the breaker.
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner::default()),
            threshold,
            cooldown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // The guarded state is plain counters; a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A permit if a request may be sent now, otherwise the remaining cooldown.
    ///
    /// A probe permit that is dropped before its outcome is recorded (caller
    /// deadline, client closed) frees the half-open slot again.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, Duration> {
        let mut inner = self.lock();
        let Some(until) = inner.open_until else {
            return Ok(BreakerPermit::new(self, false));
        };
        let now = Instant::now();
        if now < until {
            return Err(until - now);
        }
        if inner.probe_in_flight {
            return Err(Duration::ZERO);
        }
        inner.probe_in_flight = true;
        tracing::info!("Circuit breaker half-open, sending probe request");
        Ok(BreakerPermit::new(self, true))
    }

    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.probe_in_flight {
            inner.probe_in_flight = false;
            tracing::debug!("Probe request abandoned before completing");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.open_until.is_some() {
            tracing::info!("Circuit breaker closed after successful probe");
        }
        *inner = BreakerInner::default();
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;

        let reopen = inner.probe_in_flight;
        let trip = inner.open_until.is_none()
            && self.threshold > 0
            && inner.consecutive_failures >= self.threshold;

        if reopen || trip {
            inner.open_until = Some(Instant::now() + self.cooldown);
            inner.probe_in_flight = false;
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Circuit breaker OPEN"
            );
        }
    }

    /// Close the breaker and clear the failure streak.
    pub fn reset(&self) {
        *self.lock() = BreakerInner::default();
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        let now = Instant::now();
        let phase = match inner.open_until {
            None => BreakerPhase::Closed,
            Some(_) if inner.probe_in_flight => BreakerPhase::HalfOpen,
            Some(until) if now >= until => BreakerPhase::HalfOpen,
            Some(_) => BreakerPhase::Open,
        };
        CircuitState {
            consecutive_failures: inner.consecutive_failures,
            open: inner.open_until.is_some(),
            open_for: inner.open_until.map(|u| u.saturating_duration_since(now)),
            phase,
        }
    }
}

/// Outcome slot for one request admitted by the breaker.
#[must_use]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.abandon_probe();
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// How the client authenticates against the upstream API.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    None,
    Bearer(String),
    Header { name: String, value: String },
}

/// A JSON POST relative to the client's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub path: String,
    pub body: Value,
}

impl ApiRequest {
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            body,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub short_circuited: u64,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    short_circuited: AtomicU64,
}

// ============================================================================
// ResilientApiClient
// ============================================================================

#[derive(Debug)]
pub struct ResilientApiClient {
    http: Client,
    base_url: String,
    auth: ApiAuth,
    config: ApiClientConfig,
    permits: Arc<Semaphore>,
    breaker: CircuitBreaker,
    next_slot: tokio::sync::Mutex<Option<tokio::time::Instant>>,
    counters: Counters,
}

impl ResilientApiClient {
    pub fn new(
        base_url: impl Into<String>,
        auth: ApiAuth,
        config: ApiClientConfig,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.min(10)))
            .build()?;

        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            Duration::from_secs(config.circuit_breaker_cooldown_secs),
        );

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            breaker,
            next_slot: tokio::sync::Mutex::new(None),
            counters: Counters::default(),
            config,
        })
    }

    /// Replace the breaker, e.g. to use a sub-second cooldown.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `request`, retrying transient failures.
    pub async fn call(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let attempts = AtomicU32::new(0);

        let result = RetryIf::start(
            self.backoff(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.attempt(request)
            },
            |e: &ApiError| {
                if e.is_transient() {
                    tracing::warn!(path = %request.path, error = %e, "API attempt failed, backing off");
                    true
                } else {
                    false
                }
            },
        )
        .await;

        match result {
            Ok(v) => Ok(v),
            Err(e) if e.is_transient() => {
                let attempts = attempts.load(Ordering::Relaxed);
                tracing::error!(
                    path = %request.path,
                    attempts,
                    error = %e,
                    "All API retry attempts failed"
                );
                Err(ApiError::RetryExhausted {
                    attempts,
                    last: Box::new(e),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.config.backoff_base.max(1))
            .factor(self.config.backoff_unit_ms.max(1))
            .max_delay(Duration::from_secs(self.config.max_backoff_secs))
            .take(self.config.max_retries as usize)
    }

    async fn attempt(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        self.pace().await;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ApiError::Closed)?;

        let admitted = match self.breaker.try_acquire() {
            Ok(admitted) => admitted,
            Err(retry_after) => {
                self.counters.short_circuited.fetch_add(1, Ordering::Relaxed);
                return Err(ApiError::CircuitOpen { retry_after });
            }
        };

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let result = self.dispatch(request).await;

        match &result {
            Ok(_) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                admitted.success();
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                admitted.failure();
            }
        }

        result
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.base_url, request.path.trim_start_matches('/'));

        let mut builder = self.http.post(&url).json(&request.body);
        builder = match &self.auth {
            ApiAuth::None => builder,
            ApiAuth::Bearer(token) => builder.bearer_auth(token),
            ApiAuth::Header { name, value } => builder.header(name.as_str(), value.as_str()),
        };

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = extract_error_message(&error_body).unwrap_or(error_body);

            tracing::debug!(status = status.as_u16(), message = %message, "Upstream API error");

            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Space out requests to honour `rate_limit_rpm`.
    async fn pace(&self) {
        if self.config.rate_limit_rpm == 0 {
            return;
        }
        let interval = Duration::from_millis(60_000 / self.config.rate_limit_rpm as u64);
        let mut next = self.next_slot.lock().await;
        if let Some(at) = *next {
            tokio::time::sleep_until(at).await;
        }
        *next = Some(tokio::time::Instant::now() + interval);
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn reset_circuit(&self) {
        tracing::info!("Circuit breaker manually reset");
        self.breaker.reset();
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            short_circuited: self.counters.short_circuited.load(Ordering::Relaxed),
        }
    }

    /// Close the permit pool; later calls fail with `ApiError::Closed`.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Pulls `error.message` (or a string `error`) out of an error payload.
fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

// ============================================================================
// Cost estimation
// ============================================================================

/// Per-1k-unit pricing for an upstream model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Rough token count for budgeting (about four characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Cost in the pricing currency for the given unit counts.
pub fn estimate_cost(input_units: u64, output_units: u64, pricing: &Pricing) -> f64 {
    (input_units as f64 / 1000.0) * pricing.input_per_1k
        + (output_units as f64 / 1000.0) * pricing.output_per_1k
}

// ============================================================================
// TESTS
// ============================================================================
