use super::instance::ServiceInstance;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Closed set of selection strategies. Parsed once at pool construction —
/// the hot path dispatches on the enum, never on strategy-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    ResponseTime,
    Adaptive,
}

impl Strategy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round-robin" => Some(Self::RoundRobin),
            "weighted" => Some(Self::Weighted),
            "least-connections" => Some(Self::LeastConnections),
            "response-time" => Some(Self::ResponseTime),
            "adaptive" => Some(Self::Adaptive),
            _ => None,
        }
    }

    /// Parse with fallback to the default strategy for names that slipped
    /// past config validation (e.g. lazily-created pools).
    pub fn parse_or_default(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            tracing::warn!("strategy: unknown name '{}', falling back to adaptive", name);
            Self::Adaptive
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
            Self::LeastConnections => "least-connections",
            Self::ResponseTime => "response-time",
            Self::Adaptive => "adaptive",
        }
    }

    /// Pick one instance from the currently-healthy subset. `healthy` must
    /// already be filtered; an empty slice yields `None` and the caller maps
    /// that to its "no healthy instances" condition.
    ///
    /// `rr_cursor` is the pool's monotonic round-robin cursor; only the
    /// round-robin arm advances it.
    pub fn select<'a>(
        &self,
        healthy: &'a [ServiceInstance],
        rr_cursor: &AtomicU64,
    ) -> Option<&'a ServiceInstance> {
        if healthy.is_empty() {
            return None;
        }
        match self {
            Self::RoundRobin => {
                let count = rr_cursor.fetch_add(1, Ordering::Relaxed);
                Some(&healthy[(count % healthy.len() as u64) as usize])
            }
            Self::Weighted => Some(select_weighted(healthy)),
            Self::LeastConnections => Some(min_by(healthy, |i| i.active_connections() as f64)),
            Self::ResponseTime => Some(min_by(healthy, |i| i.response_time_ms())),
            Self::Adaptive => Some(max_by(healthy, adaptive_score)),
        }
    }
}

/// Uniform draw in `[0, total_weight)`, then walk the list subtracting each
/// weight until the remainder is consumed. Selection frequency converges to
/// `weight / total_weight` over many draws.
fn select_weighted(healthy: &[ServiceInstance]) -> &ServiceInstance {
    let total: f64 = healthy.iter().map(|i| i.weight).sum();
    let mut remainder = rand::thread_rng().gen_range(0.0..total);
    for inst in healthy {
        remainder -= inst.weight;
        if remainder < 0.0 {
            return inst;
        }
    }
    // Float rounding can leave a vanishing remainder after the last element.
    &healthy[healthy.len() - 1]
}

/// Blend of load, latency, and operator-assigned weight. Higher is better.
fn adaptive_score(inst: &ServiceInstance) -> f64 {
    let load = (100.0 - inst.active_connections() as f64 * 10.0).max(0.0);
    let latency = (100.0 - inst.response_time_ms() / 10.0).max(0.0);
    0.4 * load + 0.4 * latency + 0.2 * inst.weight
}

/// First-encountered instance with the strictly smallest key (ties keep
/// list order).
fn min_by(healthy: &[ServiceInstance], key: impl Fn(&ServiceInstance) -> f64) -> &ServiceInstance {
    let mut best = &healthy[0];
    let mut best_key = key(best);
    for inst in &healthy[1..] {
        let k = key(inst);
        if k < best_key {
            best = inst;
            best_key = k;
        }
    }
    best
}

fn max_by(healthy: &[ServiceInstance], key: impl Fn(&ServiceInstance) -> f64) -> &ServiceInstance {
    let mut best = &healthy[0];
    let mut best_key = key(best);
    for inst in &healthy[1..] {
        let k = key(inst);
        if k > best_key {
            best = inst;
            best_key = k;
        }
    }
    best
}
