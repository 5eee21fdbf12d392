use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Proxy listen address. CLI flag > env > this value.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Admin API listen address (health/metrics).
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Logical services routed through the load balancer.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<ServiceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            services: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

/// One logical service: its route prefix, selection strategy, health-check
/// and circuit-breaker policy, and the initial instance list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Path prefix that maps requests to this service.
    /// Defaults to `/<name>` when unset.
    #[serde(default)]
    pub route_prefix: Option<String>,

    /// "round-robin" | "weighted" | "least-connections" | "response-time" | "adaptive".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Deadline for the downstream call on the proxy path (seconds).
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: f64,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,

    /// Canned JSON payload returned when the service is unavailable, so
    /// downstream UIs can degrade gracefully instead of erroring.
    #[serde(default)]
    pub fallback: Option<serde_json::Value>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub instances: Vec<InstanceConfig>,
}

impl ServiceConfig {
    /// Conservative defaults for a service name that was never registered.
    /// First lookups must not fail — the resulting empty pool answers
    /// "no healthy instances" instead.
    pub fn unregistered(name: &str) -> Self {
        Self {
            name: name.to_string(),
            route_prefix: None,
            strategy: default_strategy(),
            timeout_secs: default_request_timeout(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            keepalive_pool: KeepalivePoolConfig::default(),
            fallback: None,
            instances: Vec::new(),
        }
    }

    /// Effective route prefix: explicit value or `/<name>`.
    pub fn effective_prefix(&self) -> String {
        match &self.route_prefix {
            Some(p) => p.clone(),
            None => format!("/{}", self.name),
        }
    }
}

fn default_strategy() -> String {
    "adaptive".to_string()
}

fn default_request_timeout() -> f64 {
    30.0
}

/// One backend endpoint as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Base address, e.g. "http://10.0.0.1:8080".
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

/// Active health check policy for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Probe round interval (seconds).
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Per-probe timeout (seconds). Expired probes are abandoned, not retried.
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
        }
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

/// Circuit breaker policy for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED state before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before admitting a half-open trial.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

/// Per-service upstream connection pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    /// Max idle connections kept per upstream host.
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Idle connection timeout (seconds).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// TCP connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            idle_timeout: default_idle_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_pool_size() -> usize {
    32
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> f64 {
    5.0
}
