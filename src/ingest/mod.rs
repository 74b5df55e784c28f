//! Inbound path: webhook deliveries into the mirror.

pub mod webhook;

pub use webhook::{process_batch, router, sign_body, verify_signature, WebhookAck, WebhookState};
