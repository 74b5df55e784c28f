//! Finalization Submitter.
//!
//! For one due market: build and send `finalize_market`, wait for
//! confirmation, retry transient failures with backoff, and write one audit
//! row. The whole thing runs under a per-market wall-clock cap.
//!
//! The submitter never touches `lifecycle_state`. The market only becomes
//! `finalized` in the mirror when the resulting ledger event comes back
//! through the webhook.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::ledger::{FinalizeTarget, LedgerClient, SignatureState};
use super::retry::RetryPolicy;
use crate::config::FinalizerConfig;
use crate::error::LedgerError;
use crate::models::{FinalizationAttempt, FinalizationOutcome, MarketRecord};
use crate::store::{now_ts, MirrorStore};

const CONFIRMATION_POLL: Duration = Duration::from_millis(500);

/// What one market's submission got through, readable after the per-market
/// timeout has dropped the retry future.
#[derive(Default)]
struct Progress {
    attempts: AtomicU32,
    last_signature: Mutex<Option<Signature>>,
}

impl Progress {
    fn sent(&self, signature: Signature) {
        *self.last_signature.lock() = Some(signature);
    }

    fn last_signature(&self) -> Option<String> {
        self.last_signature.lock().map(|s| s.to_string())
    }
}

#[derive(Clone)]
pub struct FinalizationSubmitter {
    store: MirrorStore,
    ledger: Arc<dyn LedgerClient>,
    program_id: Pubkey,
    policy: RetryPolicy,
    confirmation_timeout: Duration,
    max_processing_time: Duration,
    dry_run: bool,
    verbose: bool,
}

impl FinalizationSubmitter {
    pub fn new(
        store: MirrorStore,
        ledger: Arc<dyn LedgerClient>,
        program_id: Pubkey,
        cfg: &FinalizerConfig,
    ) -> Self {
        let policy = cfg.retry_policy();
        let worst_case = policy.total_backoff() + cfg.confirmation_timeout * policy.max_attempts;
        if worst_case > cfg.max_processing_time {
            warn!(
                worst_case_ms = worst_case.as_millis() as u64,
                cap_ms = cfg.max_processing_time.as_millis() as u64,
                "Retry budget exceeds the per-market timeout, late attempts will be cut off"
            );
        }

        Self {
            store,
            ledger,
            program_id,
            policy,
            confirmation_timeout: cfg.confirmation_timeout,
            max_processing_time: cfg.max_processing_time,
            dry_run: cfg.dry_run,
            verbose: cfg.debug,
        }
    }

    /// Finalizes one market and records the attempt. Never returns an error;
    /// the outcome is in the returned audit row.
    pub async fn finalize(&self, market: &MarketRecord) -> FinalizationAttempt {
        let started = Instant::now();
        let progress = Progress::default();

        let (outcome, signature, error) = if self.dry_run {
            info!(market = %market.ledger_address, deadline = ?market.deadline_timestamp, "🧪 Dry run: would finalize");
            (FinalizationOutcome::DryRun, None, None)
        } else {
            match FinalizeTarget::from_record(market, &self.program_id) {
                Err(e) => (FinalizationOutcome::Rejected, None, Some(e.to_string())),
                Ok(target) => {
                    match timeout(self.max_processing_time, self.submit_with_retry(&target, &progress)).await {
                        Ok(Ok(sig)) => (FinalizationOutcome::Success, Some(sig.to_string()), None),
                        Ok(Err(e)) if e.is_retryable() => (
                            FinalizationOutcome::Failed,
                            progress.last_signature(),
                            Some(e.to_string()),
                        ),
                        Ok(Err(e)) => (
                            FinalizationOutcome::Rejected,
                            progress.last_signature(),
                            Some(e.to_string()),
                        ),
                        Err(_) => (
                            FinalizationOutcome::Timeout,
                            progress.last_signature(),
                            Some(format!(
                                "gave up after {}ms",
                                self.max_processing_time.as_millis()
                            )),
                        ),
                    }
                }
            }
        };

        let attempt = FinalizationAttempt {
            market_id: market.id,
            attempted_at: now_ts(),
            outcome,
            ledger_signature: signature,
            error_message: error,
            attempts: progress.attempts.load(Ordering::Relaxed),
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        match outcome {
            FinalizationOutcome::Success => info!(
                market = %market.ledger_address,
                signature = attempt.ledger_signature.as_deref().unwrap_or_default(),
                attempts = attempt.attempts,
                "✅ Finalization confirmed"
            ),
            FinalizationOutcome::DryRun => {}
            _ => warn!(
                market = %market.ledger_address,
                outcome = outcome.as_str(),
                attempts = attempt.attempts,
                signature = attempt.ledger_signature.as_deref().unwrap_or_default(),
                error = attempt.error_message.as_deref().unwrap_or_default(),
                "Finalization did not complete"
            ),
        }

        let store = self.store.clone();
        let row = attempt.clone();
        match tokio::task::spawn_blocking(move || store.record_finalization_attempt(&row)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(market = %market.ledger_address, error = %e, "Failed to record finalization attempt")
            }
            Err(e) => {
                warn!(market = %market.ledger_address, error = %e, "Finalization audit task failed")
            }
        }
        attempt
    }

    async fn submit_with_retry(
        &self,
        target: &FinalizeTarget,
        progress: &Progress,
    ) -> Result<Signature, LedgerError> {
        // Sent but never seen confirmed. Any of them may still land.
        let mut unconfirmed: Vec<Signature> = Vec::new();
        let mut last_error = LedgerError::Transient("no attempt made".into());

        for attempt in 0..self.policy.max_attempts {
            if let Some(landed) = self.first_landed(&unconfirmed).await {
                return Ok(landed);
            }

            progress.attempts.store(attempt + 1, Ordering::Relaxed);
            self.trace(target, format_args!("submitting attempt {}", attempt + 1));

            match self.submit_once(target, progress).await {
                Ok(signature) => return Ok(signature),
                Err((e, _)) if !e.is_retryable() => {
                    // A resubmission is refused once an earlier one finalized the market.
                    if let Some(landed) = self.first_landed(&unconfirmed).await {
                        return Ok(landed);
                    }
                    return Err(e);
                }
                Err((e, signature)) => {
                    unconfirmed.extend(signature);
                    warn!(market = %target.address, attempt = attempt + 1, error = %e, "Finalization attempt failed");
                    last_error = e;
                }
            }

            if self.policy.has_next(attempt) {
                let delay = self.policy.delay_after(attempt);
                debug!(market = %target.address, delay_ms = delay.as_millis() as u64, "Backing off");
                sleep(delay).await;
            }
        }

        if let Some(landed) = self.first_landed(&unconfirmed).await {
            return Ok(landed);
        }
        Err(last_error)
    }

    /// One send plus confirmation wait. On failure the signature is returned
    /// alongside the error when one was obtained.
    async fn submit_once(
        &self,
        target: &FinalizeTarget,
        progress: &Progress,
    ) -> Result<Signature, (LedgerError, Option<Signature>)> {
        let signature = self
            .ledger
            .submit_finalize(target)
            .await
            .map_err(|e| (e, None))?;
        progress.sent(signature);
        self.trace(target, format_args!("sent {}", signature));

        match timeout(self.confirmation_timeout, self.await_confirmation(&signature)).await {
            Ok(Ok(())) => Ok(signature),
            Ok(Err(e)) => Err((e, Some(signature))),
            Err(_) => Err((
                LedgerError::ConfirmationTimeout(self.confirmation_timeout.as_millis() as u64),
                Some(signature),
            )),
        }
    }

    async fn await_confirmation(&self, signature: &Signature) -> Result<(), LedgerError> {
        loop {
            match self.ledger.signature_state(signature).await {
                Ok(SignatureState::Confirmed) => return Ok(()),
                Ok(SignatureState::Failed(reason)) => return Err(LedgerError::Rejected(reason)),
                Ok(SignatureState::Pending) => {}
                Err(e) if e.is_retryable() => {
                    debug!(signature = %signature, error = %e, "Status poll failed, polling again");
                }
                Err(e) => return Err(e),
            }
            sleep(CONFIRMATION_POLL).await;
        }
    }

    async fn first_landed(&self, signatures: &[Signature]) -> Option<Signature> {
        for signature in signatures {
            if matches!(
                self.ledger.signature_state(signature).await,
                Ok(SignatureState::Confirmed)
            ) {
                debug!(signature = %signature, "Earlier submission landed");
                return Some(*signature);
            }
        }
        None
    }

    fn trace(&self, target: &FinalizeTarget, message: std::fmt::Arguments<'_>) {
        if self.verbose {
            info!(market = %target.address, "{}", message);
        } else {
            debug!(market = %target.address, "{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LifecycleState;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeLedger {
        /// Scripted submit results; `Ok` with a fresh signature once empty.
        submits: Mutex<VecDeque<Result<(), LedgerError>>>,
        submit_calls: AtomicU32,
        sent: Mutex<Vec<Signature>>,
        /// Signatures report confirmed once tokio time reaches this.
        lands_at: Mutex<Option<tokio::time::Instant>>,
        rejects_on_chain: bool,
        hang: bool,
    }

    #[async_trait]
    impl LedgerClient for FakeLedger {
        fn signer(&self) -> Option<Pubkey> {
            Some(Pubkey::new_from_array([8; 32]))
        }

        async fn backend_authority(&self) -> Result<Pubkey, LedgerError> {
            Ok(Pubkey::new_from_array([8; 32]))
        }

        async fn submit_finalize(&self, _target: &FinalizeTarget) -> Result<Signature, LedgerError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(Err(e)) = self.submits.lock().pop_front() {
                return Err(e);
            }
            let signature = Signature::new_unique();
            self.sent.lock().push(signature);
            Ok(signature)
        }

        async fn signature_state(&self, _signature: &Signature) -> Result<SignatureState, LedgerError> {
            if self.rejects_on_chain {
                return Ok(SignatureState::Failed("custom program error: 0x1771".into()));
            }
            match *self.lands_at.lock() {
                Some(at) if tokio::time::Instant::now() < at => Ok(SignatureState::Pending),
                _ => Ok(SignatureState::Confirmed),
            }
        }
    }

    fn config() -> FinalizerConfig {
        FinalizerConfig {
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            confirmation_timeout: Duration::from_millis(2_000),
            max_processing_time: Duration::from_millis(60_000),
            ..FinalizerConfig::default()
        }
    }

    fn setup(ledger: Arc<FakeLedger>, cfg: &FinalizerConfig) -> (MirrorStore, FinalizationSubmitter, MarketRecord) {
        let store = MirrorStore::in_memory().unwrap();
        let address = Pubkey::new_unique().to_string();
        let id = {
            let conn = store.conn().lock();
            conn.execute(
                "INSERT INTO markets (ledger_address, lifecycle_state, deadline_timestamp, first_seen_at)
                 VALUES (?1, 'resolving', 100, 0)",
                rusqlite::params![address],
            )
            .unwrap();
            conn.last_insert_rowid()
        };
        let market = store.market_by_address(&address).unwrap().unwrap();
        assert_eq!(market.id, id);
        let submitter = FinalizationSubmitter::new(store.clone(), ledger, Pubkey::new_unique(), cfg);
        (store, submitter, market)
    }

    fn transient() -> Result<(), LedgerError> {
        Err(LedgerError::Transient("rpc 503".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_before_success() {
        let ledger = Arc::new(FakeLedger::default());
        ledger.submits.lock().extend([transient(), transient()]);
        let cfg = config();
        let (store, submitter, market) = setup(ledger.clone(), &cfg);

        let start = tokio::time::Instant::now();
        let attempt = submitter.finalize(&market).await;

        assert_eq!(attempt.outcome, FinalizationOutcome::Success);
        assert_eq!(attempt.attempts, 3);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 3);
        // initial + initial * factor
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3_000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3_010), "{:?}", elapsed);

        let rows = store.finalization_attempts(market.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, FinalizationOutcome::Success);
        // Mirror state is left to the ingestion path.
        let m = store.market_by_address(&market.ledger_address).unwrap().unwrap();
        assert_eq!(m.lifecycle_state, LifecycleState::Resolving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let ledger = Arc::new(FakeLedger::default());
        ledger
            .submits
            .lock()
            .push_back(Err(LedgerError::Rejected("InvalidMarketState".into())));
        let (_, submitter, market) = setup(ledger.clone(), &config());

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Rejected);
        assert_eq!(attempt.attempts, 1);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_chain_failure_is_terminal() {
        let ledger = Arc::new(FakeLedger {
            rejects_on_chain: true,
            ..Default::default()
        });
        let (_, submitter, market) = setup(ledger.clone(), &config());

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Rejected);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail() {
        let ledger = Arc::new(FakeLedger::default());
        ledger
            .submits
            .lock()
            .extend([transient(), transient(), transient(), transient(), transient()]);
        let (store, submitter, market) = setup(ledger.clone(), &config());

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Failed);
        // First attempt plus three retries.
        assert_eq!(attempt.attempts, 4);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 4);
        assert_eq!(attempt.ledger_signature, None);
        assert!(attempt.error_message.unwrap().contains("rpc 503"));
        assert_eq!(store.finalization_attempts(market.id).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_confirmation_is_not_resubmitted() {
        let ledger = Arc::new(FakeLedger::default());
        *ledger.lands_at.lock() = Some(tokio::time::Instant::now() + Duration::from_millis(2_200));
        let (_, submitter, market) = setup(ledger.clone(), &config());

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Success);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_signature_checked_after_transient_failure() {
        let ledger = Arc::new(FakeLedger::default());
        // sig1 times out at 2s and lands at 3.5s. The resubmission at 3s
        // fails before sending anything.
        *ledger.lands_at.lock() = Some(tokio::time::Instant::now() + Duration::from_millis(3_500));
        ledger.submits.lock().extend([Ok(()), transient()]);
        let (store, submitter, market) = setup(ledger.clone(), &config());

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Success);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.sent.lock().len(), 1);
        let first = ledger.sent.lock()[0].to_string();
        assert_eq!(attempt.ledger_signature.as_deref(), Some(first.as_str()));
        assert_eq!(
            store.finalization_attempts(market.id).unwrap()[0].ledger_signature.as_deref(),
            Some(first.as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_row_keeps_last_sent_signature() {
        let ledger = Arc::new(FakeLedger::default());
        *ledger.lands_at.lock() = Some(tokio::time::Instant::now() + Duration::from_secs(3_600));
        let cfg = FinalizerConfig {
            max_processing_time: Duration::from_millis(2_500),
            ..config()
        };
        let (store, submitter, market) = setup(ledger.clone(), &cfg);

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Timeout);
        let sent = ledger.sent.lock()[0].to_string();
        assert_eq!(attempt.ledger_signature.as_deref(), Some(sent.as_str()));
        let rows = store.finalization_attempts(market.id).unwrap();
        assert_eq!(rows[0].ledger_signature.as_deref(), Some(sent.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entity_timeout() {
        let ledger = Arc::new(FakeLedger {
            hang: true,
            ..Default::default()
        });
        let cfg = FinalizerConfig {
            max_processing_time: Duration::from_millis(5_000),
            ..config()
        };
        let (store, submitter, market) = setup(ledger, &cfg);

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Timeout);
        assert_eq!(attempt.attempts, 1);
        assert_eq!(
            store.finalization_attempts(market.id).unwrap()[0].outcome,
            FinalizationOutcome::Timeout
        );
    }

    #[tokio::test]
    async fn test_dry_run_never_submits() {
        let ledger = Arc::new(FakeLedger::default());
        let cfg = FinalizerConfig {
            dry_run: true,
            ..config()
        };
        let (store, submitter, market) = setup(ledger.clone(), &cfg);

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::DryRun);
        assert_eq!(attempt.attempts, 0);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.finalization_attempts(market.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pda_mismatch_is_terminal_without_submitting() {
        let ledger = Arc::new(FakeLedger::default());
        let (store, submitter, mut market) = setup(ledger.clone(), &config());
        market.market_id = Some(hex::encode([3u8; 32]));

        let attempt = submitter.finalize(&market).await;
        assert_eq!(attempt.outcome, FinalizationOutcome::Rejected);
        assert_eq!(ledger.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.finalization_attempts(market.id).unwrap().len(), 1);
    }
}
