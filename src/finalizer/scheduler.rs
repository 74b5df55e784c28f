//! Scheduler: drives scan + finalize cycles on a fixed interval.
//!
//! At most one cycle runs per process. A cycle that finds the run token held
//! returns immediately with `skipped = 1` instead of queueing. Shutdown stops
//! new cycles, lets the current one finish its in-flight market, and waits
//! for it up to a bounded time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use super::scanner::DeadlineScanner;
use super::submitter::FinalizationSubmitter;
use crate::config::FinalizerConfig;
use crate::models::FinalizationOutcome;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub scanned: usize,
    pub finalized: usize,
    pub failed: usize,
    pub rejected: usize,
    pub timed_out: usize,
    pub dry_run: usize,
    /// 1 when the cycle didn't run because another held the token.
    pub skipped: usize,
}

impl RunSummary {
    fn tally(&mut self, outcome: FinalizationOutcome) {
        match outcome {
            FinalizationOutcome::Success => self.finalized += 1,
            FinalizationOutcome::Failed => self.failed += 1,
            FinalizationOutcome::Rejected => self.rejected += 1,
            FinalizationOutcome::Timeout => self.timed_out += 1,
            FinalizationOutcome::DryRun => self.dry_run += 1,
        }
    }

    fn attempted(&self) -> usize {
        self.finalized + self.failed + self.rejected + self.timed_out + self.dry_run
    }
}

pub struct FinalizationScheduler {
    scanner: DeadlineScanner,
    submitter: FinalizationSubmitter,
    interval: Duration,
    shutdown_max_wait: Duration,
    run_token: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl FinalizationScheduler {
    pub fn new(scanner: DeadlineScanner, submitter: FinalizationSubmitter, cfg: &FinalizerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            scanner,
            submitter,
            interval: cfg.interval,
            shutdown_max_wait: cfg.shutdown_max_wait,
            run_token: Mutex::new(()),
            shutdown,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One scan + finalize cycle.
    ///
    /// Per-market failures are counted, not returned. A failing scan query is
    /// the only error.
    pub async fn run_once(&self) -> anyhow::Result<RunSummary> {
        let Ok(_token) = self.run_token.try_lock() else {
            info!("⏭️ Finalization cycle already running, skipping");
            return Ok(RunSummary {
                skipped: 1,
                ..Default::default()
            });
        };

        let scanner = self.scanner.clone();
        let due = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .context("deadline scan task failed")?
            .context("deadline scan failed")?;
        let mut summary = RunSummary {
            scanned: due.len(),
            ..Default::default()
        };

        for market in &due {
            if self.is_shutting_down() {
                info!(remaining = due.len() - summary.attempted(), "Shutdown requested, stopping cycle");
                break;
            }
            let attempt = self.submitter.finalize(market).await;
            summary.tally(attempt.outcome);
        }

        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                finalized = summary.finalized,
                failed = summary.failed,
                rejected = summary.rejected,
                timed_out = summary.timed_out,
                dry_run = summary.dry_run,
                "🏁 Finalization cycle complete"
            );
        }
        Ok(summary)
    }

    /// Runs a cycle immediately, then every `interval` until shutdown.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = this.interval.as_secs(), "⏰ Finalization scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.run_once().await {
                            error!("Finalization cycle failed: {:#}", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
            }
            info!("Finalization scheduler stopped");
        })
    }

    /// Stops new cycles and waits up to the configured bound for the running
    /// one. Returns `false` if it was still running when the wait ran out.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.send_replace(true);
        match timeout(self.shutdown_max_wait, self.run_token.lock()).await {
            Ok(_) => {
                info!("Finalization scheduler drained");
                true
            }
            Err(_) => {
                warn!(
                    waited_secs = self.shutdown_max_wait.as_secs(),
                    "Finalization cycle still running at shutdown"
                );
                false
            }
        }
    }
}
