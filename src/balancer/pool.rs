use crate::balancer::instance::ServiceInstance;
use crate::balancer::strategy::Strategy;
use crate::config::{KeepalivePoolConfig, ServiceConfig};
use crate::error::GatewayError;
use crate::proxy::context::BoxBody;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Runtime state for one logical service: the ordered instance list, the
/// selection strategy fixed at construction, and the per-service upstream
/// HTTP client.
///
/// This is the "live" counterpart of `ServiceConfig`. While `ServiceConfig`
/// is a pure serde struct describing *what* a service should look like,
/// `ServicePool` holds the mutable runtime state.
pub struct ServicePool {
    config: ServiceConfig,
    strategy: Strategy,

    /// Insertion order is the round-robin order. Reads are lock-free
    /// snapshots; the (rare) add/remove mutations are serialized through
    /// `mutate_mu` to prevent read-modify-write races.
    instances: ArcSwap<Vec<ServiceInstance>>,
    mutate_mu: Mutex<()>,

    /// Monotonic round-robin cursor; wraps via modulo over the healthy set.
    rr_cursor: AtomicU64,

    /// Per-service HTTP client with its own connection pool, so different
    /// services can have different idle_timeout, pool size, etc.
    http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl ServicePool {
    pub fn new(config: ServiceConfig) -> Self {
        let strategy = Strategy::parse_or_default(&config.strategy);
        let seeded: Vec<ServiceInstance> = config
            .instances
            .iter()
            .map(|ic| ServiceInstance::new(&ic.url, ic.weight, ic.metadata.clone()))
            .collect();
        let http_client = build_pool_http_client(&config.keepalive_pool);

        Self {
            config,
            strategy,
            instances: ArcSwap::from_pointee(seeded),
            mutate_mu: Mutex::new(()),
            rr_cursor: AtomicU64::new(0),
            http_client,
        }
    }

    // ---- Accessors ----

    pub fn service(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn http_client(&self) -> &Client<HttpsConnector<HttpConnector>, BoxBody> {
        &self.http_client
    }

    pub fn instances(&self) -> Arc<Vec<ServiceInstance>> {
        self.instances.load_full()
    }

    /// (healthy, total) — the "3/4" in `X-Service-Pool-Health`.
    pub fn health_ratio(&self) -> (usize, usize) {
        let snapshot = self.instances.load();
        let healthy = snapshot.iter().filter(|i| i.is_healthy()).count();
        (healthy, snapshot.len())
    }

    // ---- Instance management ----

    /// Append a new healthy-by-default instance; visible to the next
    /// selection. Returns the generated instance id.
    pub fn add_instance(
        &self,
        url: &str,
        weight: f64,
        metadata: HashMap<String, String>,
    ) -> String {
        let inst = ServiceInstance::new(url, weight, metadata);
        let id = inst.id.to_string();

        let _guard = self.mutate_mu.lock().unwrap();
        let mut next = (**self.instances.load()).clone();
        next.push(inst);
        self.instances.store(Arc::new(next));

        tracing::info!(
            "pool: instance added, service={}, id={}, url={}",
            self.config.name,
            id,
            url
        );
        id
    }

    /// Remove immediately. Requests already routed to the instance keep
    /// their own handle, so their connection accounting completes normally.
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let _guard = self.mutate_mu.lock().unwrap();
        let mut next = (**self.instances.load()).clone();
        let before = next.len();
        next.retain(|i| &*i.id != instance_id);
        let removed = next.len() != before;
        if removed {
            self.instances.store(Arc::new(next));
            tracing::info!(
                "pool: instance removed, service={}, id={}",
                self.config.name,
                instance_id
            );
        }
        removed
    }

    // ---- Selection ----

    /// Pick one instance from the currently-healthy subset.
    pub fn select_instance(&self) -> Result<ServiceInstance, GatewayError> {
        let snapshot = self.instances.load();
        let healthy: Vec<ServiceInstance> = snapshot
            .iter()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect();

        match self.strategy.select(&healthy, &self.rr_cursor) {
            Some(inst) => {
                metrics::counter!(
                    "gateway_lb_selections_total",
                    "service" => self.config.name.clone(),
                    "strategy" => self.strategy.name(),
                )
                .increment(1);
                Ok(inst.clone())
            }
            None => Err(GatewayError::NoHealthyInstances(self.config.name.clone())),
        }
    }

    // ---- Connection accounting ----

    /// Unknown ids are a no-op — the instance may have been removed while
    /// the request was in flight.
    pub fn increment_connections(&self, instance_id: &str) {
        if let Some(inst) = self.find(instance_id) {
            inst.inc_active();
        }
    }

    /// Floors at zero via the instance counter; unknown ids are a no-op.
    pub fn decrement_connections(&self, instance_id: &str) {
        if let Some(inst) = self.find(instance_id) {
            inst.dec_active();
        }
    }

    fn find(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.instances
            .load()
            .iter()
            .find(|i| &*i.id == instance_id)
            .cloned()
    }

    // ---- Observability ----

    pub fn snapshot(&self) -> PoolMetrics {
        let snapshot = self.instances.load();
        let healthy = snapshot.iter().filter(|i| i.is_healthy()).count();
        PoolMetrics {
            service: self.config.name.clone(),
            strategy: self.strategy.name(),
            total_instances: snapshot.len(),
            healthy_instances: healthy,
            instances: snapshot.iter().map(InstanceMetrics::from).collect(),
        }
    }
}

/// Wire shape for `GET /_lb/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub service: String,
    pub strategy: &'static str,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub instances: Vec<InstanceMetrics>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetrics {
    pub id: String,
    pub url: String,
    pub healthy: bool,
    pub response_time_ms: f64,
    pub active_connections: usize,
    pub weight: f64,
    pub last_health_check_at: Option<u64>,
}

impl From<&ServiceInstance> for InstanceMetrics {
    fn from(inst: &ServiceInstance) -> Self {
        Self {
            id: inst.id.to_string(),
            url: inst.url.to_string(),
            healthy: inst.is_healthy(),
            response_time_ms: inst.response_time_ms(),
            active_connections: inst.active_connections(),
            weight: inst.weight,
            last_health_check_at: inst.last_health_check_ms(),
        }
    }
}

/// Central registry of all live pools. Thread-safe, cheaply cloneable,
/// constructed once at startup and passed through the request context —
/// the only place service names resolve to pools.
#[derive(Clone)]
pub struct PoolRegistry {
    pools: Arc<DashMap<String, Arc<ServicePool>>>,
    health_client: reqwest::Client,
    shutdown: Arc<Notify>,
}

impl PoolRegistry {
    pub fn new(shutdown: Arc<Notify>) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            health_client: super::health::build_health_check_client(),
            shutdown,
        }
    }

    /// Register a configured service at startup, replacing any previous pool
    /// under the same name.
    pub fn register(&self, config: ServiceConfig) -> Arc<ServicePool> {
        let name = config.name.clone();
        let pool = self.start_pool(config);
        self.pools.insert(name, pool.clone());
        pool
    }

    pub fn get(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.pools.get(service).map(|entry| entry.value().clone())
    }

    /// Return-or-create under the map's entry lock. Lookups never fail for
    /// unknown names: a fresh empty pool with conservative defaults answers
    /// "no healthy instances" instead of crashing the first request.
    pub fn get_or_create(&self, service: &str) -> Arc<ServicePool> {
        // Fast path: name already registered — no allocation.
        if let Some(entry) = self.pools.get(service) {
            return entry.value().clone();
        }
        self.pools
            .entry(service.to_string())
            .or_insert_with(|| self.start_pool(ServiceConfig::unregistered(service)))
            .clone()
    }

    /// Iterate over all pools. The callback receives (name, pool).
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<ServicePool>)) {
        for entry in self.pools.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Snapshots for the management surface, in stable name order.
    pub fn snapshots(&self) -> Vec<PoolMetrics> {
        let mut out: Vec<PoolMetrics> = self
            .pools
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    /// Build the pool and start its background health-check loop. Must run
    /// inside the tokio runtime.
    fn start_pool(&self, config: ServiceConfig) -> Arc<ServicePool> {
        let pool = Arc::new(ServicePool::new(config));
        super::health::spawn_health_loop(
            pool.clone(),
            self.health_client.clone(),
            self.shutdown.clone(),
        );
        pool
    }
}

/// Build a hyper `Client` that supports both HTTP and HTTPS upstreams.
///
/// - Plain `http://` connections go through the inner `HttpConnector`.
/// - `https://` connections are terminated with rustls (ring backend,
///   webpki roots). HTTP/2 is negotiated automatically via ALPN.
fn build_pool_http_client(
    pool_cfg: &KeepalivePoolConfig,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(pool_cfg.idle_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs_f64(pool_cfg.connect_timeout)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool_cfg.idle_timeout))
        .pool_max_idle_per_host(pool_cfg.size)
        .build(https)
}
