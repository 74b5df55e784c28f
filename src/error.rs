//! Error taxonomy shared by the ingestion pipeline and the finalizer.
//!
//! Startup glue uses `anyhow`; everything that crosses a component boundary
//! uses one of the typed errors below so callers can decide between
//! skip, retry and abort.

use thiserror::Error;

/// A notification instruction that could not be turned into a typed event.
///
/// Always logged and recorded on the raw event, never fatal for the batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("instruction data is empty")]
    EmptyData,
    #[error("instruction data is not valid base64: {0}")]
    Base64(String),
    #[error("malformed {event} body: {reason}")]
    Body { event: &'static str, reason: String },
    #[error("{event} expects at least {expected} accounts, got {actual}")]
    MissingAccounts {
        event: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid account address {0}")]
    InvalidAddress(String),
}

/// Failure while applying a decoded event to the mirror.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("value {value} for {field} does not fit the store")]
    Overflow { field: &'static str, value: u64 },
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Outcome classes for a ledger round-trip.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// RPC transport, rate limiting, blockhash expiry: worth another attempt.
    #[error("transient ledger error: {0}")]
    Transient(String),
    /// The program or runtime rejected the instruction. Never retried.
    #[error("ledger rejected instruction: {0}")]
    Rejected(String),
    #[error("confirmation timed out after {0}ms")]
    ConfirmationTimeout(u64),
    #[error("invalid ledger address: {0}")]
    InvalidAddress(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Transient(_) | LedgerError::ConfirmationTimeout(_)
        )
    }
}

/// Invalid configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(LedgerError::Transient("503".into()).is_retryable());
        assert!(LedgerError::ConfirmationTimeout(1000).is_retryable());
        assert!(!LedgerError::Rejected("InvalidMarketState".into()).is_retryable());
        assert!(!LedgerError::InvalidAddress("xyz".into()).is_retryable());
    }
}
