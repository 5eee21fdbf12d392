use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// One backend endpoint and its live health/metadata.
///
/// Cheap to clone — all mutable state is shared via `Arc`, so every clone of
/// the handle observes the same counters. This is also what keeps connection
/// accounting correct for instances removed mid-flight: the guard holds its
/// own handle and the decrement lands on the shared counter regardless of
/// whether the pool still lists the instance.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: Arc<str>,
    pub url: Arc<str>,
    pub weight: f64,
    pub metadata: Arc<HashMap<String, String>>,
    healthy: Arc<AtomicBool>,
    /// Last observed latency in milliseconds, stored as `f64` bits.
    response_time_ms: Arc<AtomicU64>,
    active_connections: Arc<AtomicUsize>,
    /// Unix millis of the last health probe; 0 = never probed.
    last_health_check_ms: Arc<AtomicU64>,
}

impl ServiceInstance {
    /// New instances are healthy by default — they take effect for the next
    /// selection and the health checker corrects the flag on its next round.
    pub fn new(url: &str, weight: f64, metadata: HashMap<String, String>) -> Self {
        Self {
            id: Arc::from(Uuid::new_v4().to_string().as_str()),
            url: Arc::from(url.trim_end_matches('/')),
            weight: if weight > 0.0 { weight } else { 1.0 },
            metadata: Arc::new(metadata),
            healthy: Arc::new(AtomicBool::new(true)),
            response_time_ms: Arc::new(AtomicU64::new(0f64.to_bits())),
            active_connections: Arc::new(AtomicUsize::new(0)),
            last_health_check_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Flip the health flag, returning the previous value so callers can
    /// detect recovery/degradation transitions.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    #[inline]
    pub fn response_time_ms(&self) -> f64 {
        f64::from_bits(self.response_time_ms.load(Ordering::Relaxed))
    }

    pub fn record_response_time(&self, ms: f64) {
        self.response_time_ms.store(ms.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Floors at zero — a stray decrement must never wrap the counter.
    pub fn dec_active(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn mark_checked_now(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_health_check_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Unix millis of the last probe, `None` if never probed.
    pub fn last_health_check_ms(&self) -> Option<u64> {
        match self.last_health_check_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

/// RAII guard for per-request connection accounting: increments on acquire,
/// decrements on drop. Exactly one increment and one decrement per routed
/// request, on every exit path.
pub struct ConnectionGuard {
    instance: ServiceInstance,
}

impl ConnectionGuard {
    pub fn acquire(instance: &ServiceInstance) -> Self {
        instance.inc_active();
        Self {
            instance: instance.clone(),
        }
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.instance.dec_active();
    }
}
