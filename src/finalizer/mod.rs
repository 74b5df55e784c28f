//! Write-back path: finalize markets whose dispute window has closed.
//!
//! Scheduler -> Scanner (read) -> Submitter -> ledger. The mirror only learns
//! the outcome when the ledger's own event arrives through the webhook.

pub mod ledger;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod submitter;

pub use ledger::{verify_authority, FinalizeTarget, LedgerClient, RpcLedgerClient, SignatureState};
pub use retry::RetryPolicy;
pub use scanner::DeadlineScanner;
pub use scheduler::{FinalizationScheduler, RunSummary};
pub use submitter::FinalizationSubmitter;
