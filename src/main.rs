//! zmart-sync
//!
//! Webhook listener that mirrors the prediction-market program into SQLite,
//! plus the scheduler that finalizes markets once their dispute window closes.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zmart_sync::config::SyncConfig;
use zmart_sync::finalizer::{
    verify_authority, DeadlineScanner, FinalizationScheduler, FinalizationSubmitter, LedgerClient,
    RpcLedgerClient,
};
use zmart_sync::ingest::{self, WebhookState};
use zmart_sync::middleware::{IngressLimiter, RateLimitConfig};
use zmart_sync::store::{MirrorStore, MirrorWriter};

#[derive(Parser, Debug)]
#[command(name = "zmart-sync", version)]
#[command(about = "Mirror the zmart program off-chain and finalize expired markets")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "ZMART_DB_PATH", default_value = "zmart_mirror.db", global = true)]
    db_path: String,

    /// Listen address for the webhook receiver
    #[arg(long, env = "ZMART_BIND", default_value = "0.0.0.0:3001", global = true)]
    bind: SocketAddr,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook receiver and the finalization scheduler (default)
    Serve,
    /// Re-apply raw events that were recorded but never processed
    Replay {
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
    },
    /// Print the markets the next finalization cycle would pick up
    Scan,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let cfg = SyncConfig::from_env().context("invalid configuration")?;
    let store = MirrorStore::open(&args.db_path)?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cfg, store, args.bind).await,
        Commands::Replay { limit } => {
            let writer = MirrorWriter::new(store, cfg.ingest.dispute_window_secs);
            let summary = tokio::task::spawn_blocking(move || writer.replay_unprocessed(limit))
                .await
                .context("replay task panicked")??;
            println!(
                "scanned={} applied={} failed={}",
                summary.scanned, summary.applied, summary.failed
            );
            Ok(())
        }
        Commands::Scan => {
            let scanner = DeadlineScanner::new(
                store,
                cfg.finalizer.safety_buffer_secs,
                cfg.finalizer.batch_size,
            );
            for market in scanner.scan().context("deadline scan failed")? {
                println!("{}", serde_json::to_string(&market)?);
            }
            Ok(())
        }
    }
}

async fn serve(cfg: SyncConfig, store: MirrorStore, bind: SocketAddr) -> Result<()> {
    info!(
        program = %cfg.ingest.program_id,
        finalizer = cfg.finalizer.enabled,
        dry_run = cfg.finalizer.dry_run,
        "🚀 Starting zmart-sync"
    );

    let scheduler = if cfg.finalizer.enabled {
        let ledger: Arc<dyn LedgerClient> =
            Arc::new(RpcLedgerClient::new(cfg.ingest.program_id, &cfg.ledger)?);
        if cfg.finalizer.needs_signer() {
            verify_authority(ledger.as_ref())
                .await
                .context("backend authority check failed")?;
        }

        let scanner = DeadlineScanner::new(
            store.clone(),
            cfg.finalizer.safety_buffer_secs,
            cfg.finalizer.batch_size,
        );
        let submitter =
            FinalizationSubmitter::new(store.clone(), ledger, cfg.ingest.program_id, &cfg.finalizer);
        let scheduler = Arc::new(FinalizationScheduler::new(scanner, submitter, &cfg.finalizer));
        let handle = scheduler.spawn();
        Some((scheduler, handle))
    } else {
        warn!("Finalizer disabled, running ingestion only");
        None
    };

    let limiter = IngressLimiter::new(RateLimitConfig::from_ingest(&cfg.ingest));
    limiter.spawn_pruner();

    let writer = MirrorWriter::new(store, cfg.ingest.dispute_window_secs);
    let state = WebhookState::new(
        writer,
        cfg.ingest.program_id.to_string(),
        &cfg.ingest.webhook_secret,
    );
    let app = ingest::router(state, limiter);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!("🎯 Webhook receiver listening on {}", bind);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some((scheduler, handle)) = scheduler {
        if scheduler.shutdown().await {
            let _ = handle.await;
        } else {
            handle.abort();
        }
    }

    info!("👋 zmart-sync stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    info!("Shutdown signal received, draining");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zmart_sync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // cwd and parents first, then the crate root when run from elsewhere
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
