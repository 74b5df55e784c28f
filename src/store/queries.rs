//! Read paths over the mirror plus the submitter's append-only audit insert.

use rusqlite::{params, OptionalExtension, Row};

use super::MirrorStore;
use crate::models::{
    ActorAggregate, FinalizationAttempt, FinalizationOutcome, LifecycleState, MarketRecord,
    Outcome, PositionAggregate, RawEventRecord,
};

const MARKET_COLUMNS: &str = "id, ledger_address, market_id, creator, lifecycle_state,
    proposed_outcome, final_outcome, resolution_proposed_at, deadline_timestamp,
    shares_yes, shares_no, total_volume, created_at, liquidity_withdrawn_at, withdrawn_amount";

const RAW_EVENT_COLUMNS: &str = "id, event_type, ledger_signature, instruction_index, slot,
    block_time, source, payload_json, processed, error, received_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeRecord {
    pub initiator: Option<String>,
    pub initiated_at: Option<i64>,
    pub agree_votes: Option<i64>,
    pub disagree_votes: Option<i64>,
    pub resolved: bool,
}

fn market_from_row(row: &Row) -> rusqlite::Result<MarketRecord> {
    let state: String = row.get(4)?;
    let proposed: Option<String> = row.get(5)?;
    let final_outcome: Option<String> = row.get(6)?;
    Ok(MarketRecord {
        id: row.get(0)?,
        ledger_address: row.get(1)?,
        market_id: row.get(2)?,
        creator: row.get(3)?,
        lifecycle_state: LifecycleState::from_str(&state).unwrap_or(LifecycleState::Proposed),
        proposed_outcome: proposed.as_deref().and_then(Outcome::from_str),
        final_outcome: final_outcome.as_deref().and_then(Outcome::from_str),
        resolution_proposed_at: row.get(7)?,
        deadline_timestamp: row.get(8)?,
        shares_yes: row.get(9)?,
        shares_no: row.get(10)?,
        total_volume: row.get(11)?,
        created_at: row.get(12)?,
        liquidity_withdrawn_at: row.get(13)?,
        withdrawn_amount: row.get(14)?,
    })
}

fn raw_event_from_row(row: &Row) -> rusqlite::Result<RawEventRecord> {
    Ok(RawEventRecord {
        id: row.get(0)?,
        event_type: row.get(1)?,
        ledger_signature: row.get(2)?,
        instruction_index: row.get(3)?,
        slot: row.get(4)?,
        block_time: row.get(5)?,
        source: row.get(6)?,
        payload_json: row.get(7)?,
        processed: row.get::<_, i64>(8)? != 0,
        error: row.get(9)?,
        received_at: row.get(10)?,
    })
}

impl MirrorStore {
    /// Deadline scan.
    ///
    /// Markets in `resolving` whose `deadline + safety_buffer <= now`, oldest
    /// deadline first, at most `batch_size` rows.
    pub fn overdue_markets(
        &self,
        now: i64,
        safety_buffer_secs: i64,
        batch_size: usize,
    ) -> rusqlite::Result<Vec<MarketRecord>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM markets
             WHERE lifecycle_state = 'resolving'
               AND deadline_timestamp IS NOT NULL
               AND deadline_timestamp + ?2 <= ?1
             ORDER BY deadline_timestamp ASC, id ASC
             LIMIT ?3",
            MARKET_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![now, safety_buffer_secs, batch_size as i64],
            market_from_row,
        )?;
        rows.collect()
    }

    pub fn market_by_address(&self, ledger_address: &str) -> rusqlite::Result<Option<MarketRecord>> {
        let conn = self.conn().lock();
        conn.query_row(
            &format!("SELECT {} FROM markets WHERE ledger_address = ?1", MARKET_COLUMNS),
            params![ledger_address],
            market_from_row,
        )
        .optional()
    }

    pub fn market_count(&self) -> rusqlite::Result<i64> {
        let conn = self.conn().lock();
        conn.query_row("SELECT COUNT(*) FROM markets", [], |row| row.get(0))
    }

    pub fn position(
        &self,
        market_address: &str,
        actor: &str,
    ) -> rusqlite::Result<Option<PositionAggregate>> {
        let conn = self.conn().lock();
        conn.query_row(
            "SELECT p.market_id, p.actor, p.shares_yes, p.shares_no, p.total_invested,
                    p.trades_count, p.has_claimed, p.claimed_amount
             FROM positions p JOIN markets m ON m.id = p.market_id
             WHERE m.ledger_address = ?1 AND p.actor = ?2",
            params![market_address, actor],
            |row| {
                Ok(PositionAggregate {
                    market_id: row.get(0)?,
                    actor: row.get(1)?,
                    shares_yes: row.get(2)?,
                    shares_no: row.get(3)?,
                    total_invested: row.get(4)?,
                    trades_count: row.get(5)?,
                    has_claimed: row.get::<_, i64>(6)? != 0,
                    claimed_amount: row.get(7)?,
                })
            },
        )
        .optional()
    }

    pub fn actor(&self, address: &str) -> rusqlite::Result<Option<ActorAggregate>> {
        let conn = self.conn().lock();
        conn.query_row(
            "SELECT address, trade_count, volume FROM actors WHERE address = ?1",
            params![address],
            |row| {
                Ok(ActorAggregate {
                    address: row.get(0)?,
                    trade_count: row.get(1)?,
                    volume: row.get(2)?,
                })
            },
        )
        .optional()
    }

    pub fn dispute_for(&self, market_address: &str) -> rusqlite::Result<Option<DisputeRecord>> {
        let conn = self.conn().lock();
        conn.query_row(
            "SELECT d.initiator, d.initiated_at, d.agree_votes, d.disagree_votes, d.resolved
             FROM disputes d JOIN markets m ON m.id = d.market_id
             WHERE m.ledger_address = ?1",
            params![market_address],
            |row| {
                Ok(DisputeRecord {
                    initiator: row.get(0)?,
                    initiated_at: row.get(1)?,
                    agree_votes: row.get(2)?,
                    disagree_votes: row.get(3)?,
                    resolved: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
    }

    pub fn raw_events_for_signature(&self, signature: &str) -> rusqlite::Result<Vec<RawEventRecord>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM raw_events WHERE ledger_signature = ?1 ORDER BY instruction_index ASC",
            RAW_EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![signature], raw_event_from_row)?;
        rows.collect()
    }

    /// Unprocessed raw events that can be re-decoded, oldest first.
    pub fn unprocessed_raw_events(&self, limit: usize) -> rusqlite::Result<Vec<RawEventRecord>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM raw_events
             WHERE processed = 0 AND event_type NOT IN ('unknown', 'malformed')
             ORDER BY id ASC
             LIMIT ?1",
            RAW_EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], raw_event_from_row)?;
        rows.collect()
    }

    pub fn record_finalization_attempt(&self, attempt: &FinalizationAttempt) -> rusqlite::Result<i64> {
        let conn = self.conn().lock();
        conn.execute(
            "INSERT INTO finalization_attempts
             (market_id, attempted_at, outcome, ledger_signature, error_message, attempts, processing_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attempt.market_id,
                attempt.attempted_at,
                attempt.outcome.as_str(),
                &attempt.ledger_signature,
                &attempt.error_message,
                attempt.attempts,
                attempt.processing_time_ms as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finalization_attempts(&self, market_id: i64) -> rusqlite::Result<Vec<FinalizationAttempt>> {
        let conn = self.conn().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, attempted_at, outcome, ledger_signature, error_message, attempts, processing_time_ms
             FROM finalization_attempts WHERE market_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![market_id], |row| {
            let outcome: String = row.get(2)?;
            Ok(FinalizationAttempt {
                market_id: row.get(0)?,
                attempted_at: row.get(1)?,
                outcome: FinalizationOutcome::from_str(&outcome).unwrap_or(FinalizationOutcome::Failed),
                ledger_signature: row.get(3)?,
                error_message: row.get(4)?,
                attempts: row.get(5)?,
                processing_time_ms: row.get::<_, i64>(6)? as u64,
            })
        })?;
        rows.collect()
    }
}
