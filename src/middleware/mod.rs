//! HTTP middleware for the webhook listener.
//!
//! - Request logging with latency
//! - Per-IP ingress rate limiting

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, IngressLimiter, RateLimitConfig};
