//! SQLite-backed mirror of ledger state.
//!
//! Key properties:
//! - WAL mode so webhook writes and finalizer reads don't block each other
//! - Idempotency lives in the schema (unique keys + conditional updates),
//!   not in application locks
//! - One connection behind a mutex; every operation is a short critical section

pub mod queries;
pub mod writer;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

pub use writer::{ApplyOutcome, EventContext, MirrorWriter};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;

-- Every instruction delivered by the webhook, decoded or not
CREATE TABLE IF NOT EXISTS raw_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    ledger_signature TEXT NOT NULL,
    instruction_index INTEGER NOT NULL,
    slot INTEGER NOT NULL,
    block_time INTEGER,
    source TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    received_at INTEGER NOT NULL,
    processed_at INTEGER,
    UNIQUE (ledger_signature, event_type, instruction_index)
);

CREATE INDEX IF NOT EXISTS idx_raw_events_unprocessed
    ON raw_events(processed, id) WHERE processed = 0;

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ledger_address TEXT NOT NULL UNIQUE,
    market_id TEXT,
    creator TEXT,
    lifecycle_state TEXT NOT NULL DEFAULT 'proposed',
    b_parameter INTEGER,
    initial_liquidity INTEGER,
    shares_yes INTEGER NOT NULL DEFAULT 0,
    shares_no INTEGER NOT NULL DEFAULT 0,
    total_volume INTEGER NOT NULL DEFAULT 0,
    proposed_outcome TEXT,
    final_outcome TEXT,
    created_at INTEGER,
    approved_at INTEGER,
    activated_at INTEGER,
    resolution_proposed_at INTEGER,
    disputed_at INTEGER,
    finalized_at INTEGER,
    cancelled_at INTEGER,
    deadline_timestamp INTEGER,
    liquidity_withdrawn_at INTEGER,
    withdrawn_amount INTEGER,
    first_seen_at INTEGER NOT NULL
);

-- Deadline scan: state filter + ascending deadline
CREATE INDEX IF NOT EXISTS idx_markets_state_deadline
    ON markets(lifecycle_state, deadline_timestamp);

CREATE TABLE IF NOT EXISTS actors (
    address TEXT PRIMARY KEY,
    trade_count INTEGER NOT NULL DEFAULT 0,
    volume INTEGER NOT NULL DEFAULT 0,
    first_seen_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    actor TEXT NOT NULL REFERENCES actors(address),
    side TEXT NOT NULL,
    outcome TEXT NOT NULL,
    shares INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    ledger_signature TEXT NOT NULL,
    instruction_index INTEGER NOT NULL,
    slot INTEGER NOT NULL,
    block_time INTEGER NOT NULL,
    UNIQUE (ledger_signature, instruction_index)
);

CREATE INDEX IF NOT EXISTS idx_trades_market_time
    ON trades(market_id, block_time DESC);

CREATE TABLE IF NOT EXISTS positions (
    market_id INTEGER NOT NULL REFERENCES markets(id),
    actor TEXT NOT NULL REFERENCES actors(address),
    shares_yes INTEGER NOT NULL DEFAULT 0,
    shares_no INTEGER NOT NULL DEFAULT 0,
    total_invested INTEGER NOT NULL DEFAULT 0,
    trades_count INTEGER NOT NULL DEFAULT 0,
    last_trade_at INTEGER,
    has_claimed INTEGER NOT NULL DEFAULT 0,
    claimed_amount INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (market_id, actor)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS proposals (
    market_id INTEGER PRIMARY KEY REFERENCES markets(id),
    likes INTEGER NOT NULL,
    dislikes INTEGER NOT NULL,
    approved_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS resolutions (
    market_id INTEGER PRIMARY KEY REFERENCES markets(id),
    resolver TEXT,
    proposed_outcome TEXT,
    proposed_at INTEGER,
    deadline_timestamp INTEGER,
    status TEXT NOT NULL,
    final_outcome TEXT,
    finalized_at INTEGER
);

CREATE TABLE IF NOT EXISTS disputes (
    market_id INTEGER PRIMARY KEY REFERENCES markets(id),
    initiator TEXT REFERENCES actors(address),
    initiated_at INTEGER,
    agree_votes INTEGER,
    disagree_votes INTEGER,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at INTEGER
);

-- Submitter audit trail; never read by the scanner
CREATE TABLE IF NOT EXISTS finalization_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    attempted_at INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    ledger_signature TEXT,
    error_message TEXT,
    attempts INTEGER NOT NULL,
    processing_time_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_finalization_attempts_market
    ON finalization_attempts(market_id, attempted_at DESC);
"#;

/// Shared handle to the mirror database.
#[derive(Clone)]
pub struct MirrorStore {
    conn: Arc<Mutex<Connection>>,
}

impl MirrorStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open mirror database at {}", db_path))?;
        let store = Self::init(conn)?;

        let journal_mode: String = store
            .conn
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!(db_path, "📊 Mirror database initialized");
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize mirror schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> &Mutex<Connection> {
        &self.conn
    }
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
