//! Webhook ingress rate limiting.
//!
//! Fixed one-minute window per client IP with a burst allowance on top.
//! Rejected deliveries get `429` and a `Retry-After`; providers redeliver
//! later, and the writer's idempotency makes that harmless.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::IngestConfig;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Deliveries per window before burst kicks in.
    pub max_requests: u32,
    pub window: Duration,
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn from_ingest(cfg: &IngestConfig) -> Self {
        Self {
            max_requests: cfg.rate_limit_per_min,
            window: Duration::from_secs(60),
            burst: cfg.rate_limit_burst,
        }
    }
}

#[derive(Clone)]
pub struct IngressLimiter {
    config: RateLimitConfig,
    clients: Arc<Mutex<HashMap<IpAddr, Window>>>,
}

struct Window {
    count: u32,
    started: Instant,
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Allowed,
    Burst,
    Exceeded { retry_after: Duration },
}

impl IngressLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check(&self, ip: IpAddr, now: Instant) -> Verdict {
        let mut clients = self.clients.lock();
        let window = clients.entry(ip).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(window.started) >= self.config.window {
            window.count = 0;
            window.started = now;
        }
        window.count = window.count.saturating_add(1);

        let hard_limit = self.config.max_requests.saturating_add(self.config.burst);
        if window.count > hard_limit {
            Verdict::Exceeded {
                retry_after: (window.started + self.config.window).saturating_duration_since(now),
            }
        } else if window.count > self.config.max_requests {
            Verdict::Burst
        } else {
            Verdict::Allowed
        }
    }

    /// Drops windows idle for two periods. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let horizon = self.config.window * 2;
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, w| now.duration_since(w.started) < horizon);
        before - clients.len()
    }

    /// Prunes idle client windows once per window for the life of the process.
    pub fn spawn_pruner(&self) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.window);
            loop {
                ticker.tick().await;
                let removed = limiter.prune();
                if removed > 0 {
                    debug!(removed, "Pruned idle rate limit windows");
                }
            }
        })
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<IngressLimiter>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // Without peer info every delivery shares one window.
    let ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match limiter.check(ip, Instant::now()) {
        Verdict::Allowed => next.run(request).await,
        Verdict::Burst => {
            debug!(ip = %ip, "Webhook burst allowance in use");
            next.run(request).await
        }
        Verdict::Exceeded { retry_after } => {
            let secs = retry_after.as_secs().max(1);
            warn!(ip = %ip, retry_after_secs = secs, "Webhook rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", secs.to_string())],
                axum::Json(serde_json::json!({
                    "error": "rate_limit_exceeded",
                    "retry_after_seconds": secs,
                })),
            )
                .into_response()
        }
    }
}
