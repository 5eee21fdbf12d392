//! End-to-end tests driving the gateway over real sockets: live backends,
//! proxied requests, observability headers, breaker trips, and the
//! management API.

use relay_gateway::config::{
    CircuitBreakerConfig, GatewayConfig, InstanceConfig, ServiceConfig,
};
use relay_gateway::server::{self, GatewayState};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal backend answering every connection with `status` and `marker`
/// as the body. Returns its base url.
async fn spawn_backend(status: Arc<AtomicU16>, marker: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let status = status.clone();
            tokio::spawn(async move {
                read_request_head(&mut stream).await;
                let code = status.load(Ordering::SeqCst);
                let resp = format!(
                    "HTTP/1.1 {} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    code,
                    marker.len(),
                    marker
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

async fn fixed_backend(status: u16, marker: &'static str) -> String {
    spawn_backend(Arc::new(AtomicU16::new(status)), marker).await
}

/// Read until the end of the request headers (or EOF).
async fn read_request_head(stream: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    return;
                }
            }
        }
    }
}

fn service(name: &str, strategy: &str, urls: &[String]) -> ServiceConfig {
    let mut cfg = ServiceConfig::unregistered(name);
    cfg.strategy = strategy.to_string();
    cfg.timeout_secs = 5.0;
    cfg.instances = urls
        .iter()
        .map(|url| InstanceConfig {
            url: url.clone(),
            weight: 1.0,
            metadata: Default::default(),
        })
        .collect();
    cfg
}

/// Boot a gateway on an ephemeral port. Returns (base_url, state).
async fn start_gateway(services: Vec<ServiceConfig>) -> (String, GatewayState) {
    let config = GatewayConfig {
        listen: "127.0.0.1:0".into(),
        admin_listen: "127.0.0.1:0".into(),
        services,
    };
    let state = GatewayState::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn({
        let state = state.clone();
        let shutdown = state.shutdown.clone();
        async move {
            let _ = server::serve_proxy(listener, state, shutdown).await;
        }
    });

    (format!("http://{}", addr), state)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_sequence_with_headers_then_failover() {
    let a = fixed_backend(200, "backend-a").await;
    let b = fixed_backend(200, "backend-b").await;
    let (gw, state) = start_gateway(vec![service("echo", "round-robin", &[a, b])]).await;
    let client = client();

    // Four requests alternate A, B, A, B in insertion order.
    let mut bodies = Vec::new();
    for _ in 0..4 {
        let resp = client
            .get(format!("{}/echo/hello", gw))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let headers = resp.headers();
        assert!(headers.contains_key("x-load-balancer-instance"));
        assert_eq!(headers["x-load-balancer-strategy"], "round-robin");
        assert_eq!(headers["x-service-pool-health"], "2/2");
        assert_eq!(headers["x-circuit-breaker-state"], "CLOSED");
        assert_eq!(headers["x-service-name"], "echo");

        bodies.push(resp.text().await.unwrap());
    }
    assert_eq!(bodies, vec!["backend-a", "backend-b", "backend-a", "backend-b"]);

    // Mark A unhealthy the way the health checker would; traffic shifts to B.
    let pool = state.pools.get("echo").unwrap();
    pool.instances()[0].set_healthy(false);

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/echo/hello", gw))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-service-pool-health"], "1/2");
        assert_eq!(resp.text().await.unwrap(), "backend-b");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_service_fails_safe_with_503() {
    let (gw, state) = start_gateway(vec![]).await;
    let resp = client()
        .get(format!("{}/ghost/ping", gw))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["service"], "ghost");
    assert_eq!(body["error"], "no healthy instances");

    // The lookup lazily created an empty pool and a closed breaker.
    assert!(state.pools.get("ghost").is_some());
    assert!(state.breakers.get("ghost").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn breaker_trips_serves_fallback_and_recovers() {
    let status = Arc::new(AtomicU16::new(500));
    let backend = spawn_backend(status.clone(), "flaky-body").await;

    let mut flaky = service("flaky", "adaptive", &[backend]);
    flaky.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 60_000,
    };
    flaky.fallback = Some(serde_json::json!({
        "message": "gamification temporarily unavailable",
        "data": []
    }));

    let (gw, _state) = start_gateway(vec![flaky]).await;
    let client = client();

    // Two 5xx responses pass through to the caller while feeding the breaker.
    for _ in 0..2 {
        let resp = client
            .get(format!("{}/flaky/score", gw))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), "flaky-body");
    }

    // Third call: breaker is open — fast 503 with the fallback payload,
    // no backend hit.
    let resp = client
        .get(format!("{}/flaky/score", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers()["x-circuit-breaker-state"], "OPEN");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "circuit breaker open");
    assert_eq!(body["service"], "flaky");
    assert_eq!(
        body["fallback"]["message"],
        "gamification temporarily unavailable"
    );

    // Operator forces a half-open trial; the backend has recovered.
    status.store(200, Ordering::SeqCst);
    let resp = client
        .post(format!("{}/_cb/control", gw))
        .json(&serde_json::json!({"service": "flaky", "action": "half-open"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/flaky/score", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "flaky-body");

    // Trial success closed the breaker.
    let resp = client
        .get(format!("{}/flaky/score", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-circuit-breaker-state"], "CLOSED");
}

#[tokio::test(flavor = "multi_thread")]
async fn management_api_adds_routes_and_removes_instances() {
    let backend = fixed_backend(200, "dyn-body").await;
    let (gw, _state) = start_gateway(vec![]).await;
    let client = client();

    // A service nobody configured: 503 at first.
    let resp = client.get(format!("{}/dyn/ping", gw)).send().await.unwrap();
    assert_eq!(resp.status(), 503);

    // Add an instance through the management API.
    let resp = client
        .post(format!("{}/_lb/manage", gw))
        .json(&serde_json::json!({
            "action": "add",
            "service": "dyn",
            "url": backend,
            "weight": 2.0,
            "metadata": {"region": "local"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let instance_id = body["instanceId"].as_str().unwrap().to_string();

    // Traffic now flows.
    let resp = client.get(format!("{}/dyn/ping", gw)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "dyn-body");

    // Pool metrics expose the instance.
    let resp = client.get(format!("{}/_lb/metrics", gw)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let pools: serde_json::Value = resp.json().await.unwrap();
    let dyn_pool = pools
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["service"] == "dyn")
        .expect("dyn pool listed");
    assert_eq!(dyn_pool["totalInstances"], 1);
    assert_eq!(dyn_pool["healthyInstances"], 1);
    assert_eq!(dyn_pool["instances"][0]["id"], instance_id.as_str());
    assert_eq!(dyn_pool["instances"][0]["weight"], 2.0);

    // Breaker metrics list the lazily-created breaker as CLOSED.
    let resp = client.get(format!("{}/_cb/metrics", gw)).send().await.unwrap();
    let breakers: serde_json::Value = resp.json().await.unwrap();
    let dyn_breaker = breakers
        .as_array()
        .unwrap()
        .iter()
        .find(|b| b["service"] == "dyn")
        .expect("dyn breaker listed");
    assert_eq!(dyn_breaker["state"], "CLOSED");

    // Remove the instance; the service degrades safely again.
    let resp = client
        .post(format!("{}/_lb/manage", gw))
        .json(&serde_json::json!({
            "action": "remove",
            "service": "dyn",
            "instanceId": instance_id
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{}/dyn/ping", gw)).send().await.unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test(flavor = "multi_thread")]
async fn management_api_validates_requests() {
    let (gw, _state) = start_gateway(vec![]).await;
    let client = client();

    // Missing url for add.
    let resp = client
        .post(format!("{}/_lb/manage", gw))
        .json(&serde_json::json!({"action": "add", "service": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown action.
    let resp = client
        .post(format!("{}/_lb/manage", gw))
        .json(&serde_json::json!({"action": "drain", "service": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Breaker control with an invalid action.
    let resp = client
        .post(format!("{}/_cb/control", gw))
        .json(&serde_json::json!({"service": "x", "action": "toggle"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Malformed JSON body.
    let resp = client
        .post(format!("{}/_cb/control", gw))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_can_force_breaker_open() {
    let backend = fixed_backend(200, "fine").await;
    let (gw, _state) = start_gateway(vec![service("steady", "round-robin", &[backend])]).await;
    let client = client();

    let resp = client
        .get(format!("{}/steady/ok", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{}/_cb/control", gw))
        .json(&serde_json::json!({"service": "steady", "action": "open"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Healthy backend, but the forced-open breaker rejects without a call.
    let resp = client
        .get(format!("{}/steady/ok", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers()["x-circuit-breaker-state"], "OPEN");

    // And close it again.
    let resp = client
        .post(format!("{}/_cb/control", gw))
        .json(&serde_json::json!({"service": "steady", "action": "close"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .get(format!("{}/steady/ok", gw))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
