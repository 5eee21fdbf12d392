use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody};
use crate::server::GatewayState;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Deserialize;
use std::collections::HashMap;

/// Body of `POST /_lb/manage`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManageRequest {
    action: Option<String>,
    service: Option<String>,
    url: Option<String>,
    weight: Option<f64>,
    metadata: Option<HashMap<String, String>>,
    instance_id: Option<String>,
}

/// Body of `POST /_cb/control`.
#[derive(Debug, Default, Deserialize)]
struct ControlRequest {
    service: Option<String>,
    action: Option<String>,
}

/// Operator surface of the load-balancing layer, served on the proxy
/// listener so it shares the lifecycle of the pools it mutates.
pub async fn handle_management(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/_lb/metrics") => {
            let body = serde_json::to_string_pretty(&state.pools.snapshots()).unwrap_or_default();
            Ok(json_response(StatusCode::OK, body))
        }

        (Method::POST, "/_lb/manage") => {
            let body = req.into_body().collect().await?.to_bytes();
            let parsed: ManageRequest = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => return Ok(bad_request(&format!("invalid json: {}", e))),
            };
            let (status, body) = apply_manage(&state, parsed);
            Ok(json_response(status, body))
        }

        (Method::GET, "/_cb/metrics") => {
            let body =
                serde_json::to_string_pretty(&state.breakers.snapshots()).unwrap_or_default();
            Ok(json_response(StatusCode::OK, body))
        }

        (Method::POST, "/_cb/control") => {
            let body = req.into_body().collect().await?.to_bytes();
            let parsed: ControlRequest = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => return Ok(bad_request(&format!("invalid json: {}", e))),
            };
            let (status, body) = apply_control(&state, parsed);
            Ok(json_response(status, body))
        }

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not found"}"#.to_string(),
        )),
    }
}

fn apply_manage(state: &GatewayState, req: ManageRequest) -> (StatusCode, String) {
    let Some(service) = req.service.filter(|s| !s.is_empty()) else {
        return invalid("missing 'service'");
    };
    let Some(action) = req.action.as_deref() else {
        return invalid("missing 'action'");
    };

    match action {
        "add" => {
            let Some(url) = req.url.filter(|u| !u.is_empty()) else {
                return invalid("missing 'url' for add");
            };
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return invalid("'url' must be http(s)");
            }
            let weight = req.weight.unwrap_or(1.0);
            if weight <= 0.0 {
                return invalid("'weight' must be positive");
            }
            let pool = state.pools.get_or_create(&service);
            let id = pool.add_instance(&url, weight, req.metadata.unwrap_or_default());
            (
                StatusCode::OK,
                serde_json::json!({
                    "status": "ok",
                    "service": service,
                    "instanceId": id,
                })
                .to_string(),
            )
        }
        "remove" => {
            let Some(instance_id) = req.instance_id.filter(|i| !i.is_empty()) else {
                return invalid("missing 'instanceId' for remove");
            };
            let pool = state.pools.get_or_create(&service);
            let removed = pool.remove_instance(&instance_id);
            (
                StatusCode::OK,
                serde_json::json!({
                    "status": "ok",
                    "service": service,
                    "removed": removed,
                })
                .to_string(),
            )
        }
        other => invalid(&format!("unknown action '{}'", other)),
    }
}

fn apply_control(state: &GatewayState, req: ControlRequest) -> (StatusCode, String) {
    let Some(service) = req.service.filter(|s| !s.is_empty()) else {
        return invalid("missing 'service'");
    };
    let Some(action) = req.action.as_deref() else {
        return invalid("missing 'action'");
    };

    let breaker = state.breakers.get_or_create(&service);
    match action {
        "open" => breaker.force_open(),
        "close" => breaker.force_close(),
        "half-open" => breaker.force_half_open(),
        other => return invalid(&format!("unknown action '{}'", other)),
    }

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "service": service,
            "state": breaker.state().as_str(),
        })
        .to_string(),
    )
}

fn invalid(msg: &str) -> (StatusCode, String) {
    let err = GatewayError::InvalidManagement(msg.to_string());
    (
        StatusCode::BAD_REQUEST,
        serde_json::json!({"error": err.to_string()}).to_string(),
    )
}

fn bad_request(msg: &str) -> Response<BoxBody> {
    let (status, body) = invalid(msg);
    json_response(status, body)
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}
