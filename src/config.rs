//! Runtime configuration.
//!
//! Everything comes from the environment (a `.env` file is loaded first by the
//! binary). Values are validated once at startup; a bad value is a
//! [`ConfigError`] and the process refuses to start.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;

use crate::error::ConfigError;
use crate::finalizer::retry::RetryPolicy;

pub const DEFAULT_RPC_URL: &str = "https://api.devnet.solana.com";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ingest: IngestConfig,
    pub finalizer: FinalizerConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub program_id: Pubkey,
    pub webhook_secret: String,
    pub rate_limit_per_min: u32,
    pub rate_limit_burst: u32,
    pub dispute_window_secs: i64,
}

#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    pub enabled: bool,
    pub dry_run: bool,
    /// Raises per-market logs from debug to info.
    pub debug: bool,
    pub interval: Duration,
    pub batch_size: usize,
    /// Resubmissions after the first attempt.
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff_factor: f64,
    pub confirmation_timeout: Duration,
    /// Wall-clock cap for one market, across all of its attempts.
    pub max_processing_time: Duration,
    pub safety_buffer_secs: i64,
    pub shutdown_max_wait: Duration,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            debug: false,
            interval: Duration::from_secs(300),
            batch_size: 10,
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            confirmation_timeout: Duration::from_millis(60_000),
            max_processing_time: Duration::from_millis(120_000),
            safety_buffer_secs: 60,
            shutdown_max_wait: Duration::from_secs(30),
        }
    }
}

impl FinalizerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            initial_delay: self.initial_retry_delay,
            max_delay: self.max_retry_delay,
            factor: self.backoff_factor,
        }
    }

    /// Submitting requires a signer; dry runs and a disabled finalizer don't.
    pub fn needs_signer(&self) -> bool {
        self.enabled && !self.dry_run
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub commitment: CommitmentConfig,
    pub keypair_path: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let program_id = vars.required("ZMART_PROGRAM_ID")?;
        let program_id = Pubkey::from_str(program_id.trim()).map_err(|e| ConfigError::Invalid {
            key: "ZMART_PROGRAM_ID",
            value: program_id.clone(),
            reason: e.to_string(),
        })?;

        let webhook_secret = vars.required("WEBHOOK_SECRET")?;

        let ingest = IngestConfig {
            program_id,
            webhook_secret,
            rate_limit_per_min: vars.number("WEBHOOK_RATE_LIMIT_PER_MIN", 600, 1, u32::MAX)?,
            rate_limit_burst: vars.number("WEBHOOK_RATE_LIMIT_BURST", 100, 0, u32::MAX)?,
            dispute_window_secs: vars.number("DISPUTE_WINDOW_SECS", 259_200, 1, i64::MAX)?,
        };

        let defaults = FinalizerConfig::default();
        let initial_ms: u64 = vars.number("FINALIZER_RETRY_INITIAL_DELAY_MS", 1_000, 0, u64::MAX)?;
        let max_ms: u64 = vars.number("FINALIZER_RETRY_MAX_DELAY_MS", 30_000, 0, u64::MAX)?;
        if max_ms < initial_ms {
            return Err(ConfigError::Invalid {
                key: "FINALIZER_RETRY_MAX_DELAY_MS",
                value: max_ms.to_string(),
                reason: format!("must be at least FINALIZER_RETRY_INITIAL_DELAY_MS ({})", initial_ms),
            });
        }

        let confirmation_ms: u64 =
            vars.number("FINALIZER_CONFIRMATION_TIMEOUT_MS", 60_000, 1, u64::MAX)?;
        let entity_ms: u64 = vars.number("FINALIZER_ENTITY_TIMEOUT_MS", 120_000, 1, u64::MAX)?;
        if entity_ms <= confirmation_ms {
            return Err(ConfigError::Invalid {
                key: "FINALIZER_ENTITY_TIMEOUT_MS",
                value: entity_ms.to_string(),
                reason: format!(
                    "must exceed FINALIZER_CONFIRMATION_TIMEOUT_MS ({})",
                    confirmation_ms
                ),
            });
        }

        let backoff_factor = vars.float("FINALIZER_BACKOFF_FACTOR", defaults.backoff_factor)?;
        if backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                key: "FINALIZER_BACKOFF_FACTOR",
                value: backoff_factor.to_string(),
                reason: "must be at least 1.0".into(),
            });
        }

        let finalizer = FinalizerConfig {
            enabled: vars.flag("FINALIZER_ENABLED", defaults.enabled)?,
            dry_run: vars.flag("FINALIZER_DRY_RUN", defaults.dry_run)?,
            debug: vars.flag("FINALIZER_DEBUG", defaults.debug)?,
            interval: Duration::from_secs(vars.number("FINALIZER_INTERVAL_SECS", 300, 1, u64::MAX)?),
            batch_size: vars.number("FINALIZER_BATCH_SIZE", 10, 1, 100)?,
            max_retries: vars.number("FINALIZER_MAX_RETRIES", 3, 1, 10)?,
            initial_retry_delay: Duration::from_millis(initial_ms),
            max_retry_delay: Duration::from_millis(max_ms),
            backoff_factor,
            confirmation_timeout: Duration::from_millis(confirmation_ms),
            max_processing_time: Duration::from_millis(entity_ms),
            safety_buffer_secs: vars.number("FINALIZER_SAFETY_BUFFER_SECS", 60, 0, i64::MAX)?,
            shutdown_max_wait: Duration::from_secs(vars.number(
                "FINALIZER_SHUTDOWN_MAX_WAIT_SECS",
                30,
                0,
                u64::MAX,
            )?),
        };

        let commitment = match vars.get("SOLANA_COMMITMENT") {
            None => CommitmentConfig::confirmed(),
            Some(raw) => parse_commitment(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "SOLANA_COMMITMENT",
                value: raw.clone(),
                reason: "expected processed, confirmed or finalized".into(),
            })?,
        };

        let keypair_path = vars.get("BACKEND_KEYPAIR_PATH");
        if finalizer.needs_signer() && keypair_path.is_none() {
            return Err(ConfigError::Missing("BACKEND_KEYPAIR_PATH"));
        }

        let ledger = LedgerConfig {
            rpc_url: vars.get("SOLANA_RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            commitment,
            keypair_path,
        };

        Ok(Self {
            ingest,
            finalizer,
            ledger,
        })
    }
}

pub fn parse_commitment(raw: &str) -> Option<CommitmentConfig> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "processed" => Some(CommitmentConfig::processed()),
        "confirmed" => Some(CommitmentConfig::confirmed()),
        "finalized" => Some(CommitmentConfig::finalized()),
        _ => None,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank are the same thing.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse_flag(&raw).ok_or(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected a boolean".into(),
            }),
        }
    }

    fn number<T>(&self, key: &'static str, default: T, min: T, max: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + std::fmt::Display + Copy,
    {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        let value = raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: "not a number".into(),
        })?;
        if value < min || value > max {
            return Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: format!("must be between {} and {}", min, max),
            });
        }
        Ok(value)
    }

    fn float(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or(ConfigError::Invalid {
                key,
                value: raw,
                reason: "not a finite number".into(),
            })
    }
}
