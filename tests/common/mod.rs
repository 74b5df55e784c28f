//! Shared builders for notification payloads.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use solana_sdk::pubkey::Pubkey;

use zmart_sync::events::Notification;
use zmart_sync::ingest::{process_batch, WebhookState};
use zmart_sync::store::{MirrorStore, MirrorWriter};

pub const DISPUTE_WINDOW: i64 = 3_600;

pub fn program() -> Pubkey {
    Pubkey::new_from_array([42; 32])
}

pub fn key(seed: u8) -> String {
    Pubkey::new_from_array([seed; 32]).to_string()
}

pub fn state() -> WebhookState {
    let writer = MirrorWriter::new(MirrorStore::in_memory().unwrap(), DISPUTE_WINDOW);
    WebhookState::new(writer, program().to_string(), "secret")
}

pub fn store(state: &WebhookState) -> &MirrorStore {
    state.writer.store()
}

pub fn instruction(discriminator: u8, body: &[u8], accounts: &[&str]) -> Value {
    let mut data = vec![discriminator];
    data.extend_from_slice(body);
    json!({
        "programAddress": program().to_string(),
        "accounts": accounts,
        "data": BASE64.encode(&data),
    })
}

pub fn notification(signature: &str, timestamp: i64, instructions: Vec<Value>) -> Notification {
    serde_json::from_value(json!({
        "signature": signature,
        "slot": 1,
        "timestamp": timestamp,
        "instructions": instructions,
    }))
    .unwrap()
}

pub fn deliver(state: &WebhookState, notifications: &[Notification]) -> usize {
    process_batch(state, "test", notifications, 0)
}

pub fn created(market: &str, creator: &str, market_id: [u8; 32]) -> Value {
    let mut body = market_id.to_vec();
    body.extend_from_slice(&1_000u64.to_le_bytes());
    body.extend_from_slice(&10_000u64.to_le_bytes());
    instruction(0, &body, &[market, creator])
}

pub fn trade(buy: bool, market: &str, trader: &str, yes: bool, shares: u64, amount: u64) -> Value {
    let mut body = vec![yes as u8];
    body.extend_from_slice(&shares.to_le_bytes());
    body.extend_from_slice(&amount.to_le_bytes());
    instruction(if buy { 1 } else { 2 }, &body, &[market, trader])
}

pub fn approved(market: &str) -> Value {
    let mut body = 7u32.to_le_bytes().to_vec();
    body.extend_from_slice(&2u32.to_le_bytes());
    instruction(3, &body, &[market])
}

pub fn activated(market: &str) -> Value {
    instruction(10, &[], &[market])
}

pub fn resolution_proposed(market: &str, resolver: &str, outcome: Option<bool>) -> Value {
    let body = match outcome {
        None => vec![0],
        Some(v) => vec![1, v as u8],
    };
    instruction(4, &body, &[market, resolver])
}

pub fn withdrawn(market: &str, creator: &str, amount: u64) -> Value {
    instruction(13, &amount.to_le_bytes(), &[market, creator])
}

pub fn finalized(market: &str, outcome: Option<bool>) -> Value {
    let body = match outcome {
        None => vec![0],
        Some(v) => vec![1, v as u8],
    };
    instruction(12, &body, &[market])
}
