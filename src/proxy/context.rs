use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub struct RequestContext {
    pub uri_path: String,
    pub method: String,
    pub service: String,
    pub instance_id: String,
    pub instance_url: String,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            uri_path,
            method,
            service: String::new(),
            instance_id: String::new(),
            instance_url: String::new(),
            client_ip,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Terminal JSON error response; also finalizes the request metrics so
    /// every exit path is counted exactly once.
    pub fn error_response(&self, status: StatusCode, body: String) -> hyper::Response<BoxBody> {
        self.count_request(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap()
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        self.count_request(resp_status);

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "service" => self.service.clone(),
                "instance" => self.instance_url.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }

    fn count_request(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "service" => self.service.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "instance" => self.instance_url.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "service" => self.service.clone(),
            "instance" => self.instance_url.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ctx() -> RequestContext {
        RequestContext::new(
            "/api/analytics/summary".to_string(),
            "GET".to_string(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        )
    }

    #[test]
    fn test_new_context_is_blank() {
        let ctx = ctx();
        assert_eq!(ctx.uri_path, "/api/analytics/summary");
        assert_eq!(ctx.method, "GET");
        assert_eq!(ctx.service, "");
        assert_eq!(ctx.instance_id, "");
        assert!(ctx.upstream_start.is_none());
    }

    #[test]
    fn test_error_response_shape() {
        let resp = ctx().error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":"no healthy instances","service":"analytics"}"#.to_string(),
        );
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_finalize_metrics_with_and_without_upstream() {
        let mut c = ctx();
        c.service = "analytics".to_string();
        c.finalize_metrics(200);
        c.upstream_start = Some(Instant::now());
        c.instance_url = "http://10.0.0.1:8080".to_string();
        c.finalize_metrics(502);
    }

    #[test]
    fn test_body_helpers() {
        let _ = full_body("hello");
        let _ = full_body(bytes::Bytes::from_static(b"data"));
        let _ = empty_body();
    }
}
