//! Full write-back loop: ingest to resolving, finalize on the ledger, then
//! ingest the ledger's own finalization event.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

use common::*;
use zmart_sync::config::FinalizerConfig;
use zmart_sync::error::LedgerError;
use zmart_sync::finalizer::ledger::market_pda;
use zmart_sync::finalizer::{
    verify_authority, DeadlineScanner, FinalizationScheduler, FinalizationSubmitter, FinalizeTarget,
    LedgerClient, SignatureState,
};
use zmart_sync::models::{FinalizationOutcome, LifecycleState, Outcome};

#[derive(Default)]
struct RecordingLedger {
    calls: AtomicU32,
    targets: Mutex<Vec<FinalizeTarget>>,
}

#[async_trait]
impl LedgerClient for RecordingLedger {
    fn signer(&self) -> Option<Pubkey> {
        Some(Pubkey::new_from_array([8; 32]))
    }

    async fn backend_authority(&self) -> Result<Pubkey, LedgerError> {
        Ok(Pubkey::new_from_array([9; 32]))
    }

    async fn submit_finalize(&self, target: &FinalizeTarget) -> Result<Signature, LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(*target);
        Ok(Signature::new_unique())
    }

    async fn signature_state(&self, _signature: &Signature) -> Result<SignatureState, LedgerError> {
        Ok(SignatureState::Confirmed)
    }
}

fn finalizer_config() -> FinalizerConfig {
    FinalizerConfig {
        safety_buffer_secs: 60,
        shutdown_max_wait: Duration::from_secs(1),
        ..FinalizerConfig::default()
    }
}

#[tokio::test]
async fn test_resolved_market_is_finalized_once() {
    let state = state();
    let market_id = [5u8; 32];
    let (market_pda, _) = market_pda(&program(), &market_id);
    let market = market_pda.to_string();

    deliver(
        &state,
        &[
            notification("s0", 1_000, vec![created(&market, &key(2), market_id)]),
            notification("s1", 1_100, vec![approved(&market)]),
            notification("s2", 1_200, vec![activated(&market)]),
            notification("s3", 2_000, vec![resolution_proposed(&market, &key(4), Some(true))]),
        ],
    );

    let store = store(&state).clone();
    let cfg = finalizer_config();
    let ledger = Arc::new(RecordingLedger::default());
    let scanner = DeadlineScanner::new(store.clone(), cfg.safety_buffer_secs, cfg.batch_size);
    let submitter = FinalizationSubmitter::new(store.clone(), ledger.clone(), program(), &cfg);
    let scheduler = FinalizationScheduler::new(scanner, submitter, &cfg);

    // Deadline (2_000 + window) is long past in wall-clock terms.
    let summary = scheduler.run_once().await.unwrap();
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.finalized, 1);
    assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.targets.lock()[0].address, market_pda);
    assert_eq!(ledger.targets.lock()[0].market_id, Some(market_id));

    // Submission alone does not change the mirror.
    let m = store.market_by_address(&market).unwrap().unwrap();
    assert_eq!(m.lifecycle_state, LifecycleState::Resolving);
    let audit = store.finalization_attempts(m.id).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].outcome, FinalizationOutcome::Success);
    assert!(audit[0].ledger_signature.is_some());

    // The ledger's event comes back through the webhook.
    deliver(&state, &[notification("s4", 9_000, vec![finalized(&market, Some(true))])]);
    let m = store.market_by_address(&market).unwrap().unwrap();
    assert_eq!(m.lifecycle_state, LifecycleState::Finalized);
    assert_eq!(m.final_outcome, Some(Outcome::Yes));

    let summary = scheduler.run_once().await.unwrap();
    assert_eq!(summary.scanned, 0);
    assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    assert!(scheduler.shutdown().await);
}

#[tokio::test]
async fn test_authority_mismatch_is_fatal() {
    let ledger = RecordingLedger::default();
    let err = verify_authority(&ledger).await.unwrap_err();
    assert!(err.to_string().contains("not the configured backend authority"));
}
