//! zmart-sync library
//!
//! Off-chain mirror of the zmart prediction-market program: webhook ingestion
//! into SQLite, and the deadline finalizer that writes back to the ledger.
//! The binary in `main.rs` wires these together.

pub mod config;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod store;
