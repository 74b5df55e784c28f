//! Webhook receiver.
//!
//! `POST /webhooks/:source` takes a JSON array of notifications signed with
//! HMAC-SHA256 over the raw body. Once the body verifies and parses, the
//! delivery is acknowledged with `200` whatever happens to individual events;
//! per-event failures live on `raw_events.error` for replay.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

use crate::events::{decode_notification, Notification};
use crate::middleware::{rate_limit_middleware, request_logging, IngressLimiter};
use crate::store::{now_ts, ApplyOutcome, EventContext, MirrorWriter};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct WebhookState {
    pub writer: MirrorWriter,
    pub program_id: Arc<str>,
    secret: Arc<[u8]>,
}

impl WebhookState {
    pub fn new(writer: MirrorWriter, program_id: impl Into<Arc<str>>, secret: &str) -> Self {
        Self {
            writer,
            program_id: program_id.into(),
            secret: Arc::from(secret.as_bytes()),
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub events_processed: usize,
}

#[derive(Debug)]
enum WebhookError {
    Unauthorized,
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            WebhookError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid signature".to_string()),
            WebhookError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            WebhookError::Internal(msg) => {
                error!("Webhook processing error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Listener routes. Rate limiting applies to deliveries only, not health.
pub fn router(state: WebhookState, limiter: IngressLimiter) -> Router {
    let webhooks = Router::new()
        .route("/webhooks/:source", post(receive))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(webhooks)
        .layer(middleware::from_fn(request_logging))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn receive(
    State(state): State<WebhookState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::Unauthorized)?;

    if !verify_signature(&state.secret, &body, signature) {
        warn!(source = %source, "Rejected webhook with bad signature");
        return Err(WebhookError::Unauthorized);
    }

    let notifications: Vec<Notification> = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::BadRequest(format!("unparsable notification batch: {}", e)))?;

    let received_at = now_ts();
    let count = notifications.len();

    // SQLite work is blocking; keep it off the reactor.
    let events_processed = tokio::task::spawn_blocking(move || {
        process_batch(&state, &source, &notifications, received_at)
    })
    .await
    .map_err(|e| WebhookError::Internal(e.to_string()))?;

    debug!(notifications = count, events_processed, "Webhook batch acknowledged");
    Ok(Json(WebhookAck {
        received: true,
        events_processed,
    }))
}

/// Decodes and applies every notification, returning how many program
/// instructions ended up applied (now or by an earlier delivery).
pub fn process_batch(
    state: &WebhookState,
    source: &str,
    notifications: &[Notification],
    received_at: i64,
) -> usize {
    let mut processed = 0;
    let mut failed = 0;

    for notification in notifications {
        for decoded in decode_notification(notification, &state.program_id) {
            let ctx = EventContext {
                signature: notification.signature.clone(),
                instruction_index: decoded.index,
                slot: notification.slot,
                block_time: notification.timestamp,
                received_at,
                source: source.to_string(),
            };
            match state.writer.ingest(&ctx, &decoded) {
                outcome if outcome.is_success() => processed += 1,
                ApplyOutcome::Unrecognized => {}
                _ => failed += 1,
            }
        }
    }

    if failed > 0 {
        warn!(source, processed, failed, "Webhook batch had failing events");
    } else if processed > 0 {
        info!(source, processed, "📥 Webhook batch applied");
    }
    processed
}

/// Constant-time check of a hex HMAC-SHA256, with or without a `sha256=` prefix.
pub fn verify_signature(secret: &[u8], body: &[u8], provided: &str) -> bool {
    let provided = provided.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let Ok(expected) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex HMAC-SHA256 of `body`, in the format the receiver expects.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
