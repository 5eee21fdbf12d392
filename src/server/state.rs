use crate::balancer::{BreakerRegistry, PoolRegistry};
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// One path-prefix → service binding, longest prefix first.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub prefix: String,
    pub service: String,
}

/// Shared gateway state, cheaply cloneable.
///
/// Holds the two process-wide registries — the only global mutable state in
/// this layer. Both are constructed here and passed through the request
/// path explicitly rather than living in ambient statics, so tests can
/// build as many isolated gateways as they like.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub pools: PoolRegistry,
    pub breakers: BreakerRegistry,
    /// Static prefix routing table, longest prefix first.
    pub routes: Arc<Vec<RouteEntry>>,
    /// Fan-out signal that stops health loops and the accept loops.
    pub shutdown: Arc<Notify>,
}

impl GatewayState {
    /// Build the state and register every configured service — pools seed
    /// their instance lists and start their health loops here, breakers
    /// start closed. Must run inside the tokio runtime.
    pub fn new(config: GatewayConfig) -> Self {
        let shutdown = Arc::new(Notify::new());
        let pools = PoolRegistry::new(shutdown.clone());
        let breakers = BreakerRegistry::new();
        let metrics = Metrics::install();

        let mut routes: Vec<RouteEntry> = config
            .services
            .iter()
            .map(|svc| RouteEntry {
                prefix: svc.effective_prefix(),
                service: svc.name.clone(),
            })
            .collect();
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        for svc in &config.services {
            pools.register(svc.clone());
            breakers.register(&svc.name, svc.circuit_breaker.clone());
            info!(
                "state: service registered, name={}, strategy={}, instances={}",
                svc.name,
                svc.strategy,
                svc.instances.len()
            );
        }

        Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            pools,
            breakers,
            routes: Arc::new(routes),
            shutdown,
        }
    }
}
