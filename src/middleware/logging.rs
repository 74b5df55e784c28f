//! Request logging middleware.
//!
//! One line per request with method, path, status and latency. Health probes
//! are not logged.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

pub async fn request_logging(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms, client = %client, "Request failed (5xx)");
    } else if status >= 400 {
        info!(method = %method, path = %path, status, latency_ms, client = %client, "Request rejected (4xx)");
    } else {
        info!(method = %method, path = %path, status, latency_ms, "Request completed");
    }

    response
}
