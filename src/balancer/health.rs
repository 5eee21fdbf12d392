use crate::balancer::instance::ServiceInstance;
use crate::balancer::pool::ServicePool;
use crate::config::HealthCheckConfig;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Build the shared HTTP client used for health probes.
pub fn build_health_check_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}

/// Start the pool's background probe loop. One task per pool, fully
/// decoupled from the request path; exits when `shutdown` is notified.
pub fn spawn_health_loop(pool: Arc<ServicePool>, client: reqwest::Client, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(pool.config().health_check.interval_secs.max(1));
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            run_health_round(&pool, &client).await;
        }
    });
}

/// Run a single probe round across the pool's instances.
///
/// Probes run concurrently — one slow instance must not delay the others.
/// The caller is responsible for looping / scheduling.
pub async fn run_health_round(pool: &ServicePool, client: &reqwest::Client) {
    let instances = pool.instances();
    if instances.is_empty() {
        return;
    }

    let hc = Arc::new(pool.config().health_check.clone());
    let service: Arc<str> = Arc::from(pool.service());
    let concurrency = instances.len();

    stream::iter(instances.iter().cloned())
        .map(|inst| {
            let client = client.clone();
            let hc = hc.clone();
            let service = service.clone();
            async move {
                probe_instance(&client, &service, &hc, &inst).await;
            }
        })
        .buffer_unordered(concurrency)
        .collect::<()>()
        .await;
}

/// Issue one bounded-timeout probe and flip the instance's health flag.
/// 2xx is healthy; anything else (non-2xx, timeout, connect error) is not.
/// Expired probes are abandoned, never retried.
async fn probe_instance(
    client: &reqwest::Client,
    service: &str,
    hc: &HealthCheckConfig,
    inst: &ServiceInstance,
) {
    let url = format!("{}{}", inst.url, hc.path);
    let start = Instant::now();

    let result = client
        .get(&url)
        .timeout(Duration::from_secs(hc.timeout_secs))
        .send()
        .await;

    let healthy = matches!(&result, Ok(resp) if resp.status().is_success());
    inst.mark_checked_now();

    if healthy {
        inst.record_response_time(start.elapsed().as_secs_f64() * 1000.0);
        let was_healthy = inst.set_healthy(true);
        if !was_healthy {
            info!(
                "health: instance recovered, service={}, url={}, latency_ms={:.1}",
                service,
                inst.url,
                inst.response_time_ms()
            );
        }
        debug!("health: check passed, service={}, url={}", service, inst.url);
    } else {
        let was_healthy = inst.set_healthy(false);
        if was_healthy {
            warn!(
                "health: instance marked unhealthy, service={}, url={}",
                service, inst.url
            );
        }
        debug!("health: check failed, service={}, url={}", service, inst.url);
    }

    metrics::counter!(
        "gateway_health_check_total",
        "service" => service.to_string(),
        "result" => if healthy { "success" } else { "failure" },
    )
    .increment(1);
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}
