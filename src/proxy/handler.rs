use crate::balancer::{BreakerCheck, BreakerError, CircuitBreaker, ConnectionGuard, ServicePool};
use crate::error::GatewayError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::server::state::RouteEntry;
use crate::server::GatewayState;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of one downstream attempt, as seen by the circuit breaker.
/// A non-2xx response is a failure for the breaker but still surfaces to
/// the caller unchanged.
enum CallFailure {
    Status(Response<Incoming>),
    Transport(String),
    Timeout,
}

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. MANAGEMENT   — `/_lb/*` and `/_cb/*` are this layer's own surface
/// 2. RESOLVE      — path prefix → logical service name
/// 3. BREAKER GATE — fail fast while open, the pool is never consulted
/// 4. SELECT       — pick a healthy instance via the pool's strategy
/// 5. FORWARD      — guarded downstream call through the circuit breaker
/// 6. LOG          — observability headers, access log, metrics
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let uri_path = req.uri().path().to_string();

    if uri_path.starts_with("/_lb/") || uri_path.starts_with("/_cb/") {
        return crate::server::management::handle_management(req, state).await;
    }

    let method = req.method().as_str().to_string();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Trust an existing X-Forwarded-For left-most entry if present (assumes
    // a trusted reverse proxy in front), otherwise use the TCP peer address.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(uri_path, method, client_ip);

    let service = match resolve_service(&state.routes, &ctx.uri_path) {
        Some(s) => s,
        None => {
            debug!("proxy: no service resolved, path={}", ctx.uri_path);
            return Ok(ctx.error_response(
                StatusCode::NOT_FOUND,
                r#"{"error":"not found"}"#.to_string(),
            ));
        }
    };
    ctx.service = service.clone();

    let _in_flight = InFlightGuard::enter(&service);

    // Lookups never fail for unknown names — a first request to a fresh
    // service name gets an empty pool and a closed breaker.
    let pool = state.pools.get_or_create(&service);
    let breaker = state.breakers.get_or_create(&service);

    // Breaker gate: while open, reject without touching the pool.
    if matches!(breaker.check(), BreakerCheck::Rejected) {
        metrics::counter!(
            "gateway_circuit_breaker_rejected_total",
            "service" => service.clone(),
        )
        .increment(1);
        debug!("proxy: circuit open, service={}", service);
        let mut resp = unavailable(&ctx, &pool, "circuit breaker open");
        attach_observability_headers(&mut resp, &pool, &breaker, None);
        return Ok(resp);
    }

    let instance = match pool.select_instance() {
        Ok(inst) => inst,
        Err(e) => {
            metrics::counter!(
                "gateway_lb_no_healthy_instances_total",
                "service" => service.clone(),
            )
            .increment(1);
            warn!("proxy: {}", e);
            let mut resp = unavailable(&ctx, &pool, "no healthy instances");
            attach_observability_headers(&mut resp, &pool, &breaker, None);
            return Ok(resp);
        }
    };
    ctx.instance_id = instance.id.to_string();
    ctx.instance_url = instance.url.to_string();

    // Connection accounting brackets the downstream call; the guard's drop
    // runs on every exit path below, success or failure.
    let _conn = ConnectionGuard::acquire(&instance);

    let timeout = Duration::from_secs_f64(pool.config().timeout_secs);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let mut headers = req.headers().clone();
    inject_forwarded_headers(&mut headers, peer_addr, &host);
    remove_hop_headers(&mut headers);
    if let Ok(v) = HeaderValue::from_str(authority_of(&instance.url)) {
        headers.insert(HOST, v);
    }

    let upstream_uri = format!("{}{}", instance.url, path_and_query);
    let req_method = req.method().clone();
    let (_, body) = req.into_parts();

    let mut builder = Request::builder().method(req_method).uri(&upstream_uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "proxy: failed to build upstream request, service={}, error={}",
                service, e
            );
            return Ok(ctx.error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":"internal server error"}"#.to_string(),
            ));
        }
    };

    let client = pool.http_client().clone();
    let upstream_start = Instant::now();
    ctx.upstream_start = Some(upstream_start);

    // Downstream failures are never retried here; a timeout counts as a
    // breaker failure like any other.
    let result = breaker
        .execute(|| async move {
            match tokio::time::timeout(timeout, client.request(upstream_req)).await {
                Ok(Ok(resp)) if resp.status().is_success() => Ok(resp),
                Ok(Ok(resp)) => Err(CallFailure::Status(resp)),
                Ok(Err(e)) => Err(CallFailure::Transport(e.to_string())),
                Err(_) => Err(CallFailure::Timeout),
            }
        })
        .await;

    let upstream_elapsed = upstream_start.elapsed();

    match result {
        Ok(resp) => {
            instance.record_response_time(upstream_elapsed.as_secs_f64() * 1000.0);
            let mut final_resp = build_downstream_response(resp);
            attach_observability_headers(&mut final_resp, &pool, &breaker, Some(&ctx.instance_id));
            phase_log(&ctx, final_resp.status().as_u16(), upstream_elapsed);
            ctx.finalize_metrics(final_resp.status().as_u16());
            Ok(final_resp)
        }
        Err(BreakerError::Open(_)) => {
            // Opened between the gate above and the call — still a fast fail.
            metrics::counter!(
                "gateway_circuit_breaker_rejected_total",
                "service" => service.clone(),
            )
            .increment(1);
            let mut resp = unavailable(&ctx, &pool, "circuit breaker open");
            attach_observability_headers(&mut resp, &pool, &breaker, None);
            Ok(resp)
        }
        Err(BreakerError::Inner(CallFailure::Status(resp))) => {
            let mut final_resp = build_downstream_response(resp);
            attach_observability_headers(&mut final_resp, &pool, &breaker, Some(&ctx.instance_id));
            phase_log(&ctx, final_resp.status().as_u16(), upstream_elapsed);
            ctx.finalize_metrics(final_resp.status().as_u16());
            Ok(final_resp)
        }
        Err(BreakerError::Inner(CallFailure::Transport(msg))) => {
            let err = GatewayError::DownstreamFailure(msg);
            warn!(
                "proxy: {}, service={}, instance={}",
                err, service, ctx.instance_url
            );
            let mut resp = unavailable(&ctx, &pool, &err.to_string());
            attach_observability_headers(&mut resp, &pool, &breaker, Some(&ctx.instance_id));
            Ok(resp)
        }
        Err(BreakerError::Inner(CallFailure::Timeout)) => {
            let err = GatewayError::DownstreamTimeout;
            warn!(
                "proxy: {}, service={}, instance={}",
                err, service, ctx.instance_url
            );
            let mut resp = unavailable(&ctx, &pool, &err.to_string());
            attach_observability_headers(&mut resp, &pool, &breaker, Some(&ctx.instance_id));
            Ok(resp)
        }
    }
}

/// Longest configured prefix wins; otherwise the first path segment is
/// taken as the service name so unknown services resolve and fail safely
/// downstream instead of 404-ing here.
fn resolve_service(routes: &[RouteEntry], path: &str) -> Option<String> {
    for route in routes {
        if path == route.prefix
            || (path.starts_with(&route.prefix)
                && path.as_bytes().get(route.prefix.len()) == Some(&b'/'))
        {
            return Some(route.service.clone());
        }
    }
    let segment = path.trim_start_matches('/').split('/').next().unwrap_or("");
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

/// 503 with a JSON body naming the service and reason, plus the service's
/// canned fallback payload when configured.
fn unavailable(ctx: &RequestContext, pool: &Arc<ServicePool>, reason: &str) -> Response<BoxBody> {
    let mut body = serde_json::json!({
        "error": reason,
        "service": pool.service(),
    });
    if let Some(fallback) = &pool.config().fallback {
        body["fallback"] = fallback.clone();
    }
    ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, body.to_string())
}

fn attach_observability_headers(
    resp: &mut Response<BoxBody>,
    pool: &Arc<ServicePool>,
    breaker: &Arc<CircuitBreaker>,
    instance_id: Option<&str>,
) {
    let headers = resp.headers_mut();
    if let Some(id) = instance_id {
        if let Ok(v) = HeaderValue::from_str(id) {
            headers.insert(HeaderName::from_static("x-load-balancer-instance"), v);
        }
    }
    headers.insert(
        HeaderName::from_static("x-load-balancer-strategy"),
        HeaderValue::from_static(pool.strategy().name()),
    );
    let (healthy, total) = pool.health_ratio();
    if let Ok(v) = HeaderValue::from_str(&format!("{}/{}", healthy, total)) {
        headers.insert(HeaderName::from_static("x-service-pool-health"), v);
    }
    headers.insert(
        HeaderName::from_static("x-circuit-breaker-state"),
        HeaderValue::from_static(breaker.state().as_str()),
    );
    if let Ok(v) = HeaderValue::from_str(pool.service()) {
        headers.insert(HeaderName::from_static("x-service-name"), v);
    }
}

/// "host:port" part of an instance url, for the upstream Host header.
fn authority_of(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(body.boxed()).unwrap()
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so backends can
/// identify the original client and protocol.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    // X-Forwarded-For: append peer IP to any existing list.
    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    // X-Forwarded-Proto: trust the incoming value (e.g. set by an ALB after
    // TLS termination), only default to "http" when absent.
    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    // X-Real-IP: always the immediate peer.
    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

fn phase_log(ctx: &RequestContext, status: u16, upstream_elapsed: Duration) {
    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = upstream_elapsed.as_millis();

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.uri_path,
        status = status,
        service = %ctx.service,
        instance = %ctx.instance_url,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}

/// In-flight gauge bracket — decrements on every exit path.
struct InFlightGuard {
    service: String,
}

impl InFlightGuard {
    fn enter(service: &str) -> Self {
        metrics::gauge!(
            "gateway_http_requests_in_flight",
            "service" => service.to_string(),
        )
        .increment(1.0);
        Self {
            service: service.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        metrics::gauge!(
            "gateway_http_requests_in_flight",
            "service" => self.service.clone(),
        )
        .decrement(1.0);
    }
}
