use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => Self::Open,
            STATE_HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Result of checking the breaker before a call.
pub enum BreakerCheck {
    /// Closed — proceed normally.
    Allowed,
    /// Half-open — this call is a recovery trial.
    Probe,
    /// Open and the reset timeout has not elapsed — reject immediately.
    Rejected,
}

/// Error surface of `CircuitBreaker::execute`.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected fast — the operation was never invoked.
    Open(String),
    /// The operation ran and failed; the original error is re-surfaced
    /// unchanged after feeding the failure transition.
    Inner(E),
}

/// Per-service circuit breaker state machine:
/// Closed → Open → HalfOpen → Closed/Open.
///
/// The Open → HalfOpen transition is lazy — evaluated on the next call
/// attempt after the reset timeout, not via a timer. Rejected calls never
/// touch `last_failure`, so the reset window is always measured from the
/// last real failure.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,

    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    /// Consecutive failures while Closed; drives the threshold check.
    consecutive_failures: AtomicU32,
    /// Lifetime totals for failure-rate reporting.
    failure_count: AtomicU64,
    success_count: AtomicU64,
    request_count: AtomicU64,

    /// When the breaker last recorded a failure (drives the reset window).
    last_failure: Mutex<Option<Instant>>,
    /// Unix-millis mirror of `last_failure` for the management surface.
    last_failure_unix_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(service: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.to_string(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            last_failure_unix_ms: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check whether a call is allowed right now. Performs the lazy
    /// Open → HalfOpen transition; the CAS guarantees only one caller wins
    /// the probe slot for a given open period.
    pub fn check(&self) -> BreakerCheck {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let last_failure = self.last_failure.lock().unwrap();
                if let Some(at) = *last_failure {
                    if at.elapsed() >= Duration::from_millis(self.config.reset_timeout_ms) {
                        drop(last_failure);
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            tracing::info!(
                                "circuit_breaker: half-open trial, service={}",
                                self.service
                            );
                            return BreakerCheck::Probe;
                        }
                    }
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => BreakerCheck::Probe,
            _ => BreakerCheck::Allowed,
        }
    }

    /// Run `op` under the breaker's policy.
    ///
    /// Open and not yet eligible for a trial → fail fast with
    /// `BreakerError::Open`, `op` never invoked. Otherwise the call counts
    /// toward `request_count`, its outcome feeds the state machine, and its
    /// own error is re-surfaced unchanged — the breaker never swallows
    /// errors, it only decides whether to attempt the call at all.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.check() {
            BreakerCheck::Rejected => return Err(BreakerError::Open(self.service.clone())),
            BreakerCheck::Allowed | BreakerCheck::Probe => {}
        }

        self.request_count.fetch_add(1, Ordering::Relaxed);
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_CLOSED, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                tracing::info!(
                    "circuit_breaker: closed (trial succeeded), service={}",
                    self.service
                );
                metrics::counter!(
                    "gateway_circuit_breaker_transitions_total",
                    "service" => self.service.clone(),
                    "to" => "closed",
                )
                .increment(1);
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                // fetch_add returns the previous value, so every concurrent
                // failure observes a distinct count and exactly one of them
                // crosses the threshold.
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    self.mark_failure_now();
                    tracing::warn!(
                        "circuit_breaker: opened, service={}, consecutive_failures={}",
                        self.service,
                        count
                    );
                    metrics::counter!(
                        "gateway_circuit_breaker_transitions_total",
                        "service" => self.service.clone(),
                        "to" => "open",
                    )
                    .increment(1);
                }
            }
            STATE_HALF_OPEN => {
                // Trial failed — back to Open with a fresh reset window.
                self.state.store(STATE_OPEN, Ordering::Release);
                self.mark_failure_now();
                tracing::warn!(
                    "circuit_breaker: re-opened (trial failed), service={}",
                    self.service
                );
                metrics::counter!(
                    "gateway_circuit_breaker_transitions_total",
                    "service" => self.service.clone(),
                    "to" => "open",
                )
                .increment(1);
            }
            _ => {}
        }
    }

    // ---- Operator overrides (management surface / test hook) ----

    pub fn force_open(&self) {
        self.state.store(STATE_OPEN, Ordering::Release);
        self.mark_failure_now();
        tracing::warn!("circuit_breaker: forced open, service={}", self.service);
    }

    pub fn force_close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        tracing::warn!("circuit_breaker: forced closed, service={}", self.service);
    }

    pub fn force_half_open(&self) {
        self.state.store(STATE_HALF_OPEN, Ordering::Release);
        tracing::warn!("circuit_breaker: forced half-open, service={}", self.service);
    }

    // ---- Observability ----

    pub fn failure_rate(&self) -> f64 {
        let requests = self.request_count.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.failure_count.load(Ordering::Relaxed) as f64 / requests as f64
    }

    pub fn snapshot(&self) -> BreakerMetrics {
        BreakerMetrics {
            service: self.service.clone(),
            state: self.state().as_str(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            request_count: self.request_count.load(Ordering::Relaxed),
            failure_rate: self.failure_rate(),
            last_failure_at: match self.last_failure_unix_ms.load(Ordering::Relaxed) {
                0 => None,
                ms => Some(ms),
            },
        }
    }

    fn mark_failure_now(&self) {
        *self.last_failure.lock().unwrap() = Some(Instant::now());
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_failure_unix_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Wire shape for `GET /_cb/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerMetrics {
    pub service: String,
    pub state: &'static str,
    pub failure_count: u64,
    pub success_count: u64,
    pub request_count: u64,
    pub failure_rate: f64,
    pub last_failure_at: Option<u64>,
}

/// Central registry of per-service breakers. Thread-safe, cheaply
/// cloneable; lookups never fail — unknown names lazily create a closed
/// breaker with default config.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a configured service at startup, replacing any previous
    /// breaker under the same name.
    pub fn register(&self, service: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(service, config));
        self.breakers.insert(service.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|entry| entry.value().clone())
    }

    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        // Fast path: key already exists — no allocation.
        if let Some(entry) = self.breakers.get(service) {
            return entry.value().clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, CircuitBreakerConfig::default()))
            })
            .clone()
    }

    /// Snapshots for the management surface, in stable name order.
    pub fn snapshots(&self) -> Vec<BreakerMetrics> {
        let mut out: Vec<BreakerMetrics> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
        }
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new("svc", config(3, 1000));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(matches!(cb.check(), BreakerCheck::Allowed));
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new("svc", config(3, 1000));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new("svc", config(3, 1000));
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(matches!(cb.check(), BreakerCheck::Rejected));
        assert!(cb.snapshot().last_failure_at.is_some());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("svc", config(3, 1000));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        // Still closed — the success reset the streak.
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking_operation() {
        let cb = CircuitBreaker::new("svc", config(1, 3_600_000));
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        let invoked = AtomicUsize::new(0);
        let result: Result<(), BreakerError<&str>> = cb
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open(ref s)) if s == "svc"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        // Rejected calls do not count as attempts.
        assert_eq!(cb.snapshot().request_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_after_reset_timeout_invokes_operation() {
        let cb = CircuitBreaker::new("svc", config(1, 20));
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let invoked = AtomicUsize::new(0);
        let result: Result<u32, BreakerError<&str>> = cb
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        // Trial success closes the breaker.
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("svc", config(1, 20));
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result: Result<(), BreakerError<&str>> =
            cb.execute(|| async { Err("backend still down") }).await;
        assert!(matches!(result, Err(BreakerError::Inner("backend still down"))));
        assert_eq!(cb.state(), BreakerState::Open);

        // Fresh reset window — immediately rejected again.
        let invoked = AtomicUsize::new(0);
        let result: Result<(), BreakerError<&str>> = cb
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejection_does_not_advance_reset_window() {
        let cb = CircuitBreaker::new("svc", config(1, 500));
        cb.record_failure();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(cb.check(), BreakerCheck::Rejected));

        // The original 500ms window has elapsed by now. If the rejection
        // above had restarted the window this would still reject.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(cb.check(), BreakerCheck::Probe));
    }

    #[tokio::test]
    async fn test_execute_counts_and_surfaces_inner_error() {
        let cb = CircuitBreaker::new("svc", config(5, 1000));

        let ok: Result<u32, BreakerError<&str>> = cb.execute(|| async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u32, BreakerError<&str>> = cb.execute(|| async { Err("boom") }).await;
        assert!(matches!(err, Err(BreakerError::Inner("boom"))));

        let snap = cb.snapshot();
        assert_eq!(snap.request_count, 2);
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 1);
        assert!((snap.failure_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_failures_cannot_miss_threshold() {
        let cb = Arc::new(CircuitBreaker::new("svc", config(8, 1000)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = cb.clone();
            handles.push(std::thread::spawn(move || cb.record_failure()));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.snapshot().failure_count, 8);
    }

    #[test]
    fn test_force_controls() {
        let cb = CircuitBreaker::new("svc", config(3, 3_600_000));

        cb.force_open();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(matches!(cb.check(), BreakerCheck::Rejected));

        cb.force_half_open();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(matches!(cb.check(), BreakerCheck::Probe));

        cb.force_close();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(matches!(cb.check(), BreakerCheck::Allowed));
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let cb = CircuitBreaker::new("svc", config(3, 1000));
        let json = serde_json::to_value(cb.snapshot()).unwrap();
        assert_eq!(json["state"], "CLOSED");
        assert!(json.get("failureCount").is_some());
        assert!(json.get("requestCount").is_some());
        assert!(json.get("failureRate").is_some());
        assert_eq!(json["lastFailureAt"], serde_json::Value::Null);
    }

    #[test]
    fn test_registry_lookup_is_idempotent() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("svc");
        let b = registry.get_or_create("svc");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_lazy_creation_is_closed_with_defaults() {
        let registry = BreakerRegistry::new();
        assert!(registry.get("fresh").is_none());
        let cb = registry.get_or_create("fresh");
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().request_count, 0);
    }

    #[test]
    fn test_registry_snapshots_sorted() {
        let registry = BreakerRegistry::new();
        registry.register("zeta", CircuitBreakerConfig::default());
        registry.register("alpha", CircuitBreakerConfig::default());
        let snaps = registry.snapshots();
        assert_eq!(snaps[0].service, "alpha");
        assert_eq!(snaps[1].service, "zeta");
    }
}
