//! Mirror Writer: applies typed events to the store under at-least-once delivery.
//!
//! Apply sequence per instruction, all under the store mutex:
//! 1. insert-if-absent the raw event on (signature, type, instruction index)
//! 2. claim it (`processed 0 -> 1`) inside an IMMEDIATE transaction
//! 3. ensure-or-create referenced actor/market rows
//! 4. apply the mutation as delta upserts or set-if-null milestones
//! 5. commit; on failure roll back and store the error on the raw event
//!
//! Because the claim and the mutation commit together, a domain mutation is
//! applied at most once no matter how often the notification is redelivered.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use super::{now_ts, MirrorStore};
use crate::error::ApplyError;
use crate::events::catalogue::{
    DisputeRaised, DisputeResolved, LiquidityWithdrawn, MarketCreated, ProposalApproved,
    ResolutionProposed, TradeSide, Traded, VotesAggregated, WinningsClaimed,
};
use crate::events::{decode_instruction, DecodedInstruction, RawInstruction, TypedEvent};
use crate::models::{LifecycleState, Milestones, Outcome};

/// Where an instruction came from.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub signature: String,
    pub instruction_index: usize,
    pub slot: u64,
    /// Block time as delivered, `None` when the provider omitted it.
    pub block_time: Option<i64>,
    pub received_at: i64,
    pub source: String,
}

impl EventContext {
    /// Block time, falling back to receive time.
    pub fn effective_time(&self) -> i64 {
        self.block_time.unwrap_or(self.received_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already processed by an earlier delivery.
    Duplicate,
    /// Discriminator outside the catalogue; recorded, not applied.
    Unrecognized,
    Failed(String),
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Applied | ApplyOutcome::Duplicate)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub scanned: usize,
    pub applied: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct MirrorWriter {
    store: MirrorStore,
    dispute_window_secs: i64,
}

impl MirrorWriter {
    pub fn new(store: MirrorStore, dispute_window_secs: i64) -> Self {
        Self {
            store,
            dispute_window_secs,
        }
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    /// Records and applies one decoded instruction. Never panics or aborts the
    /// caller's batch; failures come back as [`ApplyOutcome::Failed`].
    pub fn ingest(&self, ctx: &EventContext, decoded: &DecodedInstruction) -> ApplyOutcome {
        let mut conn = self.store.conn().lock();

        let (raw_id, processed) = match record_raw_event(&conn, ctx, decoded.event_type, &decoded.raw) {
            Ok(row) => row,
            Err(e) => {
                warn!(signature = %ctx.signature, error = %e, "Failed to record raw event");
                return ApplyOutcome::Failed(e.to_string());
            }
        };

        if processed {
            debug!(signature = %ctx.signature, event_type = decoded.event_type, "Duplicate delivery ignored");
            return ApplyOutcome::Duplicate;
        }

        match &decoded.event {
            Ok(event) => self.apply_recorded(&mut conn, raw_id, ctx, event),
            Err(e) => {
                warn!(
                    signature = %ctx.signature,
                    index = ctx.instruction_index,
                    error = %e,
                    "Skipping undecodable instruction"
                );
                record_error(&conn, raw_id, &e.to_string());
                ApplyOutcome::Failed(e.to_string())
            }
        }
    }

    /// Re-applies raw events left unprocessed by earlier failures, oldest first.
    pub fn replay_unprocessed(&self, limit: usize) -> Result<ReplaySummary, ApplyError> {
        let pending = self.store.unprocessed_raw_events(limit)?;
        let mut summary = ReplaySummary {
            scanned: pending.len(),
            ..Default::default()
        };

        for row in pending {
            let ctx = EventContext {
                signature: row.ledger_signature.clone(),
                instruction_index: row.instruction_index as usize,
                slot: row.slot as u64,
                block_time: row.block_time,
                received_at: row.received_at,
                source: row.source.clone(),
            };

            let outcome = match serde_json::from_str::<RawInstruction>(&row.payload_json) {
                Ok(raw) => match decode_instruction(&raw) {
                    Ok(event) => {
                        let mut conn = self.store.conn().lock();
                        self.apply_recorded(&mut conn, row.id, &ctx, &event)
                    }
                    Err(e) => {
                        record_error(&self.store.conn().lock(), row.id, &e.to_string());
                        ApplyOutcome::Failed(e.to_string())
                    }
                },
                Err(e) => ApplyOutcome::Failed(e.to_string()),
            };

            match outcome {
                ApplyOutcome::Applied | ApplyOutcome::Duplicate => summary.applied += 1,
                _ => summary.failed += 1,
            }
        }

        info!(
            scanned = summary.scanned,
            applied = summary.applied,
            failed = summary.failed,
            "🔁 Replay finished"
        );
        Ok(summary)
    }

    fn apply_recorded(
        &self,
        conn: &mut Connection,
        raw_id: i64,
        ctx: &EventContext,
        event: &TypedEvent,
    ) -> ApplyOutcome {
        if let TypedEvent::Unknown { discriminator } = event {
            let msg = format!("unrecognized discriminator {}", discriminator);
            info!(signature = %ctx.signature, discriminator, "Unrecognized instruction recorded");
            record_error(conn, raw_id, &msg);
            return ApplyOutcome::Unrecognized;
        }

        match self.apply_in_transaction(conn, raw_id, ctx, event) {
            Ok(true) => ApplyOutcome::Applied,
            Ok(false) => ApplyOutcome::Duplicate,
            Err(e) => {
                warn!(
                    signature = %ctx.signature,
                    event_type = event.event_type(),
                    market = event.market().unwrap_or_default(),
                    error = %e,
                    "Failed to apply event"
                );
                record_error(conn, raw_id, &e.to_string());
                ApplyOutcome::Failed(e.to_string())
            }
        }
    }

    /// Returns `Ok(false)` when another delivery claimed the raw event first.
    fn apply_in_transaction(
        &self,
        conn: &mut Connection,
        raw_id: i64,
        ctx: &EventContext,
        event: &TypedEvent,
    ) -> Result<bool, ApplyError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed = tx.execute(
            "UPDATE raw_events SET processed = 1, processed_at = ?2, error = NULL
             WHERE id = ?1 AND processed = 0",
            params![raw_id, now_ts()],
        )?;
        if claimed == 0 {
            return Ok(false);
        }

        let now = ctx.received_at;
        let at = ctx.effective_time();

        match event {
            TypedEvent::MarketCreated(e) => apply_created(&tx, e, at, now)?,
            TypedEvent::Traded(e) => apply_trade(&tx, ctx, e, now)?,
            TypedEvent::ProposalApproved(e) => apply_proposal_approved(&tx, e, at, now)?,
            TypedEvent::ResolutionProposed(e) => {
                apply_resolution_proposed(&tx, e, at, self.dispute_window_secs, now)?
            }
            TypedEvent::DisputeRaised(e) => apply_dispute_raised(&tx, e, at, now)?,
            TypedEvent::DisputeResolved(e) => apply_dispute_resolved(&tx, e, at, now)?,
            TypedEvent::WinningsClaimed(e) => apply_claim(&tx, e, now)?,
            TypedEvent::VotesAggregated(e) => log_votes(ctx, e),
            TypedEvent::MarketActivated { market } => {
                let id = ensure_market(&tx, market, now)?;
                set_milestone(&tx, id, "activated_at", at)?;
                advance_lifecycle(&tx, id)?;
            }
            TypedEvent::MarketCancelled { market } => {
                let id = ensure_market(&tx, market, now)?;
                set_milestone(&tx, id, "cancelled_at", at)?;
                advance_lifecycle(&tx, id)?;
            }
            TypedEvent::MarketFinalized(e) => {
                let id = ensure_market(&tx, &e.market, now)?;
                finalize(&tx, id, e.final_outcome, at)?;
            }
            TypedEvent::LiquidityWithdrawn(e) => apply_withdrawal(&tx, e, at, now)?,
            TypedEvent::Unknown { .. } => {}
        }

        tx.commit()?;
        Ok(true)
    }
}

/// Insert-if-absent on the idempotency key, returning `(id, processed)`.
fn record_raw_event(
    conn: &Connection,
    ctx: &EventContext,
    event_type: &str,
    raw: &RawInstruction,
) -> Result<(i64, bool), ApplyError> {
    let payload_json = serde_json::to_string(raw)?;
    conn.execute(
        "INSERT OR IGNORE INTO raw_events
         (event_type, ledger_signature, instruction_index, slot, block_time, source, payload_json, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event_type,
            &ctx.signature,
            ctx.instruction_index as i64,
            to_i64("slot", ctx.slot)?,
            ctx.block_time,
            &ctx.source,
            payload_json,
            ctx.received_at,
        ],
    )?;

    let row = conn.query_row(
        "SELECT id, processed FROM raw_events
         WHERE ledger_signature = ?1 AND event_type = ?2 AND instruction_index = ?3",
        params![&ctx.signature, event_type, ctx.instruction_index as i64],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0)),
    )?;
    Ok(row)
}

fn record_error(conn: &Connection, raw_id: i64, message: &str) {
    if let Err(e) = conn.execute(
        "UPDATE raw_events SET error = ?2 WHERE id = ?1",
        params![raw_id, message],
    ) {
        warn!(raw_id, error = %e, "Failed to store raw event error");
    }
}

fn to_i64(field: &'static str, value: u64) -> Result<i64, ApplyError> {
    i64::try_from(value).map_err(|_| ApplyError::Overflow { field, value })
}

fn ensure_actor(tx: &Transaction, address: &str, now: i64) -> Result<(), ApplyError> {
    tx.execute(
        "INSERT OR IGNORE INTO actors (address, first_seen_at) VALUES (?1, ?2)",
        params![address, now],
    )?;
    Ok(())
}

/// Returns the surrogate id, creating a placeholder row if the creation event
/// hasn't been seen yet.
fn ensure_market(tx: &Transaction, ledger_address: &str, now: i64) -> Result<i64, ApplyError> {
    tx.execute(
        "INSERT OR IGNORE INTO markets (ledger_address, first_seen_at) VALUES (?1, ?2)",
        params![ledger_address, now],
    )?;
    let id = tx.query_row(
        "SELECT id FROM markets WHERE ledger_address = ?1",
        params![ledger_address],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Set-if-null on one of the fixed milestone columns.
fn set_milestone(tx: &Transaction, market_id: i64, column: &'static str, at: i64) -> Result<(), ApplyError> {
    debug_assert!(matches!(
        column,
        "approved_at" | "activated_at" | "resolution_proposed_at" | "disputed_at" | "finalized_at" | "cancelled_at"
    ));
    tx.execute(
        &format!(
            "UPDATE markets SET {col} = COALESCE({col}, ?2) WHERE id = ?1",
            col = column
        ),
        params![market_id, at],
    )?;
    Ok(())
}

/// Moves `lifecycle_state` to whatever the recorded milestones justify.
///
/// Compare-and-set on the state read in the same transaction; terminal states
/// and backward moves are never written.
fn advance_lifecycle(tx: &Transaction, market_id: i64) -> Result<(), ApplyError> {
    let (current, milestones): (String, Milestones) = tx.query_row(
        "SELECT lifecycle_state,
                approved_at IS NOT NULL, activated_at IS NOT NULL,
                resolution_proposed_at IS NOT NULL, disputed_at IS NOT NULL,
                finalized_at IS NOT NULL, cancelled_at IS NOT NULL
         FROM markets WHERE id = ?1",
        params![market_id],
        |row| {
            Ok((
                row.get(0)?,
                Milestones {
                    approved: row.get(1)?,
                    activated: row.get(2)?,
                    resolution_proposed: row.get(3)?,
                    disputed: row.get(4)?,
                    finalized: row.get(5)?,
                    cancelled: row.get(6)?,
                },
            ))
        },
    )?;

    let current = LifecycleState::from_str(&current).unwrap_or(LifecycleState::Proposed);
    let target = LifecycleState::derive(&milestones);

    if current == target || current.is_terminal() || !current.can_advance_to(target) {
        return Ok(());
    }

    let changed = tx.execute(
        "UPDATE markets SET lifecycle_state = ?3 WHERE id = ?1 AND lifecycle_state = ?2",
        params![market_id, current.as_str(), target.as_str()],
    )?;
    if changed > 0 {
        info!(
            market_id,
            from = current.as_str(),
            to = target.as_str(),
            "Lifecycle advanced"
        );
    }
    Ok(())
}

fn apply_created(tx: &Transaction, e: &MarketCreated, at: i64, now: i64) -> Result<(), ApplyError> {
    ensure_actor(tx, &e.creator, now)?;
    let id = ensure_market(tx, &e.market, now)?;
    tx.execute(
        "UPDATE markets SET
            market_id = COALESCE(market_id, ?2),
            creator = COALESCE(creator, ?3),
            b_parameter = COALESCE(b_parameter, ?4),
            initial_liquidity = COALESCE(initial_liquidity, ?5),
            created_at = COALESCE(created_at, ?6)
         WHERE id = ?1",
        params![
            id,
            hex::encode(e.market_id),
            &e.creator,
            to_i64("b_parameter", e.b_parameter)?,
            to_i64("initial_liquidity", e.initial_liquidity)?,
            at,
        ],
    )?;
    info!(market = %e.market, creator = %e.creator, "🆕 Market created");
    Ok(())
}

fn apply_trade(tx: &Transaction, ctx: &EventContext, e: &Traded, now: i64) -> Result<(), ApplyError> {
    ensure_actor(tx, &e.trader, now)?;
    let market_id = ensure_market(tx, &e.market, now)?;
    let at = ctx.effective_time();

    let shares = to_i64("shares", e.shares)?;
    let amount = to_i64("amount", e.amount)?;
    let outcome = if e.outcome { Outcome::Yes } else { Outcome::No };

    let inserted = tx.execute(
        "INSERT OR IGNORE INTO trades
         (market_id, actor, side, outcome, shares, amount, ledger_signature, instruction_index, slot, block_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            market_id,
            &e.trader,
            e.side.as_str(),
            outcome.as_str(),
            shares,
            amount,
            &ctx.signature,
            ctx.instruction_index as i64,
            to_i64("slot", ctx.slot)?,
            at,
        ],
    )?;
    if inserted == 0 {
        return Ok(());
    }

    let signed = match e.side {
        TradeSide::Buy => shares,
        TradeSide::Sell => -shares,
    };
    let (yes_delta, no_delta) = if e.outcome { (signed, 0) } else { (0, signed) };
    let invested_delta = match e.side {
        TradeSide::Buy => amount,
        TradeSide::Sell => 0,
    };

    // Deltas only: replay order may differ from chain order.
    tx.execute(
        "INSERT INTO positions
         (market_id, actor, shares_yes, shares_no, total_invested, trades_count, last_trade_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
         ON CONFLICT(market_id, actor) DO UPDATE SET
            shares_yes = shares_yes + excluded.shares_yes,
            shares_no = shares_no + excluded.shares_no,
            total_invested = total_invested + excluded.total_invested,
            trades_count = trades_count + 1,
            last_trade_at = MAX(COALESCE(last_trade_at, 0), excluded.last_trade_at)",
        params![market_id, &e.trader, yes_delta, no_delta, invested_delta, at],
    )?;

    tx.execute(
        "UPDATE actors SET trade_count = trade_count + 1, volume = volume + ?2 WHERE address = ?1",
        params![&e.trader, amount],
    )?;

    tx.execute(
        "UPDATE markets SET
            shares_yes = shares_yes + ?2,
            shares_no = shares_no + ?3,
            total_volume = total_volume + ?4
         WHERE id = ?1",
        params![market_id, yes_delta, no_delta, amount],
    )?;

    debug!(
        market = %e.market,
        trader = %e.trader,
        side = e.side.as_str(),
        shares = e.shares,
        amount = e.amount,
        "Trade applied"
    );
    Ok(())
}

fn apply_proposal_approved(
    tx: &Transaction,
    e: &ProposalApproved,
    at: i64,
    now: i64,
) -> Result<(), ApplyError> {
    let id = ensure_market(tx, &e.market, now)?;
    tx.execute(
        "INSERT INTO proposals (market_id, likes, dislikes, approved_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(market_id) DO NOTHING",
        params![id, e.likes, e.dislikes, at],
    )?;
    set_milestone(tx, id, "approved_at", at)?;
    advance_lifecycle(tx, id)
}

fn apply_resolution_proposed(
    tx: &Transaction,
    e: &ResolutionProposed,
    at: i64,
    dispute_window_secs: i64,
    now: i64,
) -> Result<(), ApplyError> {
    ensure_actor(tx, &e.resolver, now)?;
    let id = ensure_market(tx, &e.market, now)?;
    let deadline = at.saturating_add(dispute_window_secs);

    tx.execute(
        "UPDATE markets SET
            resolution_proposed_at = COALESCE(resolution_proposed_at, ?2),
            proposed_outcome = COALESCE(proposed_outcome, ?3),
            deadline_timestamp = COALESCE(deadline_timestamp, ?4)
         WHERE id = ?1",
        params![id, at, e.outcome.as_str(), deadline],
    )?;

    tx.execute(
        "INSERT INTO resolutions (market_id, resolver, proposed_outcome, proposed_at, deadline_timestamp, status)
         VALUES (?1, ?2, ?3, ?4, ?5, 'proposed')
         ON CONFLICT(market_id) DO UPDATE SET
            resolver = COALESCE(resolver, excluded.resolver),
            proposed_outcome = COALESCE(proposed_outcome, excluded.proposed_outcome),
            proposed_at = COALESCE(proposed_at, excluded.proposed_at),
            deadline_timestamp = COALESCE(deadline_timestamp, excluded.deadline_timestamp)",
        params![id, &e.resolver, e.outcome.as_str(), at, deadline],
    )?;

    advance_lifecycle(tx, id)?;
    info!(market = %e.market, outcome = e.outcome.as_str(), deadline, "⚖️ Resolution proposed");
    Ok(())
}

fn apply_dispute_raised(tx: &Transaction, e: &DisputeRaised, at: i64, now: i64) -> Result<(), ApplyError> {
    ensure_actor(tx, &e.initiator, now)?;
    let id = ensure_market(tx, &e.market, now)?;

    set_milestone(tx, id, "disputed_at", at)?;
    tx.execute(
        "INSERT INTO disputes (market_id, initiator, initiated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(market_id) DO UPDATE SET
            initiator = COALESCE(initiator, excluded.initiator),
            initiated_at = COALESCE(initiated_at, excluded.initiated_at)",
        params![id, &e.initiator, at],
    )?;
    tx.execute(
        "INSERT INTO resolutions (market_id, status) VALUES (?1, 'disputed')
         ON CONFLICT(market_id) DO UPDATE SET status = 'disputed' WHERE status = 'proposed'",
        params![id],
    )?;

    advance_lifecycle(tx, id)?;
    info!(market = %e.market, initiator = %e.initiator, "🚩 Dispute raised");
    Ok(())
}

fn apply_dispute_resolved(
    tx: &Transaction,
    e: &DisputeResolved,
    at: i64,
    now: i64,
) -> Result<(), ApplyError> {
    let id = ensure_market(tx, &e.market, now)?;

    // Only the first resolution counts; redelivery must not rewrite the tally.
    tx.execute(
        "INSERT INTO disputes (market_id, agree_votes, disagree_votes, resolved, resolved_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(market_id) DO UPDATE SET
            agree_votes = excluded.agree_votes,
            disagree_votes = excluded.disagree_votes,
            resolved = 1,
            resolved_at = excluded.resolved_at
         WHERE resolved = 0",
        params![id, e.agree, e.disagree, at],
    )?;

    finalize(tx, id, e.final_outcome, at)
}

fn apply_claim(tx: &Transaction, e: &WinningsClaimed, now: i64) -> Result<(), ApplyError> {
    ensure_actor(tx, &e.claimer, now)?;
    let id = ensure_market(tx, &e.market, now)?;
    tx.execute(
        "INSERT INTO positions (market_id, actor, has_claimed, claimed_amount)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(market_id, actor) DO UPDATE SET
            has_claimed = 1,
            claimed_amount = excluded.claimed_amount
         WHERE has_claimed = 0",
        params![id, &e.claimer, to_i64("claimed_amount", e.amount)?],
    )?;
    info!(market = %e.market, claimer = %e.claimer, amount = e.amount, "💰 Winnings claimed");
    Ok(())
}

/// First withdrawal wins. The program empties the pool, so a later one can't
/// carry a different amount.
fn apply_withdrawal(tx: &Transaction, e: &LiquidityWithdrawn, at: i64, now: i64) -> Result<(), ApplyError> {
    ensure_actor(tx, &e.creator, now)?;
    let id = ensure_market(tx, &e.market, now)?;
    tx.execute(
        "UPDATE markets SET
            creator = COALESCE(creator, ?2),
            liquidity_withdrawn_at = COALESCE(liquidity_withdrawn_at, ?3),
            withdrawn_amount = COALESCE(withdrawn_amount, ?4)
         WHERE id = ?1",
        params![id, &e.creator, at, to_i64("withdrawn_amount", e.amount)?],
    )?;
    info!(market = %e.market, creator = %e.creator, amount = e.amount, "🏦 Liquidity withdrawn");
    Ok(())
}

fn finalize(tx: &Transaction, market_id: i64, outcome: Outcome, at: i64) -> Result<(), ApplyError> {
    set_milestone(tx, market_id, "finalized_at", at)?;
    tx.execute(
        "UPDATE markets SET final_outcome = COALESCE(final_outcome, ?2) WHERE id = ?1",
        params![market_id, outcome.as_str()],
    )?;
    tx.execute(
        "INSERT INTO resolutions (market_id, status, final_outcome, finalized_at)
         VALUES (?1, 'finalized', ?2, ?3)
         ON CONFLICT(market_id) DO UPDATE SET
            status = 'finalized',
            final_outcome = COALESCE(final_outcome, excluded.final_outcome),
            finalized_at = COALESCE(finalized_at, excluded.finalized_at)",
        params![market_id, outcome.as_str(), at],
    )?;
    advance_lifecycle(tx, market_id)?;
    info!(market_id, outcome = outcome.as_str(), "🏁 Market finalized");
    Ok(())
}

fn log_votes(ctx: &EventContext, e: &VotesAggregated) {
    info!(
        signature = %ctx.signature,
        market = %e.market,
        kind = ?e.kind,
        for_votes = e.for_votes,
        against_votes = e.against_votes,
        "🗳️ Votes aggregated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::catalogue::VoteKind;
    use solana_sdk::pubkey::Pubkey;

    fn addr(seed: u8) -> String {
        Pubkey::new_from_array([seed; 32]).to_string()
    }

    fn writer() -> MirrorWriter {
        MirrorWriter::new(MirrorStore::in_memory().unwrap(), 3_600)
    }

    fn ctx(signature: &str, index: usize, time: i64) -> EventContext {
        EventContext {
            signature: signature.to_string(),
            instruction_index: index,
            slot: 1,
            block_time: Some(time),
            received_at: time,
            source: "test".to_string(),
        }
    }

    fn decoded(event: TypedEvent) -> DecodedInstruction {
        DecodedInstruction {
            index: 0,
            event_type: event.event_type(),
            event: Ok(event),
            raw: RawInstruction {
                program_address: addr(99),
                accounts: vec![],
                data: String::new(),
            },
        }
    }

    fn state(w: &MirrorWriter, market: &str) -> LifecycleState {
        w.store().market_by_address(market).unwrap().unwrap().lifecycle_state
    }

    fn transition(market: &str, disc: &str) -> TypedEvent {
        match disc {
            "approve" => TypedEvent::ProposalApproved(ProposalApproved {
                market: market.into(),
                likes: 7,
                dislikes: 3,
            }),
            "activate" => TypedEvent::MarketActivated {
                market: market.into(),
            },
            "resolve" => TypedEvent::ResolutionProposed(ResolutionProposed {
                market: market.into(),
                resolver: addr(5),
                outcome: Outcome::Yes,
            }),
            "finalize" => TypedEvent::MarketFinalized(crate::events::catalogue::MarketFinalized {
                market: market.into(),
                final_outcome: Outcome::Yes,
            }),
            other => panic!("unknown transition {}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_recorded_not_applied() {
        let w = writer();
        let out = w.ingest(&ctx("s1", 0, 100), &decoded(TypedEvent::Unknown { discriminator: 77 }));
        assert_eq!(out, ApplyOutcome::Unrecognized);

        let raw = w.store().raw_events_for_signature("s1").unwrap();
        assert_eq!(raw.len(), 1);
        assert!(!raw[0].processed);
        assert!(raw[0].error.as_deref().unwrap().contains("77"));
    }

    #[test]
    fn test_lifecycle_converges_for_any_order() {
        let market = addr(1);
        let steps = ["approve", "activate", "resolve", "finalize"];
        let orders: [[usize; 4]; 3] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]];

        for order in orders {
            let w = writer();
            for &i in order.iter() {
                let sig = format!("sig-{}", i);
                w.ingest(&ctx(&sig, 0, 1_000 + i as i64), &decoded(transition(&market, steps[i])));
            }
            assert_eq!(state(&w, &market), LifecycleState::Finalized);
        }
    }

    #[test]
    fn test_resolution_without_activation_does_not_skip_states() {
        let w = writer();
        let market = addr(1);
        w.ingest(&ctx("a", 0, 10), &decoded(transition(&market, "approve")));
        w.ingest(&ctx("r", 0, 20), &decoded(transition(&market, "resolve")));
        assert_eq!(state(&w, &market), LifecycleState::Approved);

        w.ingest(&ctx("b", 0, 15), &decoded(transition(&market, "activate")));
        assert_eq!(state(&w, &market), LifecycleState::Resolving);
    }

    #[test]
    fn test_liquidity_withdrawal_is_set_once() {
        let w = writer();
        let market = addr(1);
        let withdraw = |amount| {
            decoded(TypedEvent::LiquidityWithdrawn(LiquidityWithdrawn {
                market: market.clone(),
                creator: addr(2),
                amount,
            }))
        };

        assert_eq!(w.ingest(&ctx("w1", 0, 500), &withdraw(9_000)), ApplyOutcome::Applied);
        assert_eq!(w.ingest(&ctx("w1", 0, 500), &withdraw(9_000)), ApplyOutcome::Duplicate);
        assert_eq!(w.ingest(&ctx("w2", 0, 600), &withdraw(1)), ApplyOutcome::Applied);

        let m = w.store().market_by_address(&market).unwrap().unwrap();
        assert_eq!(m.liquidity_withdrawn_at, Some(500));
        assert_eq!(m.withdrawn_amount, Some(9_000));
        assert_eq!(m.creator, Some(addr(2)));
        assert_eq!(m.lifecycle_state, LifecycleState::Proposed);
        assert!(w.store().actor(&addr(2)).unwrap().is_some());
    }

    #[test]
    fn test_cancelled_market_stays_cancelled() {
        let w = writer();
        let market = addr(1);
        w.ingest(
            &ctx("c", 0, 10),
            &decoded(TypedEvent::MarketCancelled {
                market: market.clone(),
            }),
        );
        assert_eq!(state(&w, &market), LifecycleState::Cancelled);

        w.ingest(&ctx("a", 0, 11), &decoded(transition(&market, "approve")));
        assert_eq!(state(&w, &market), LifecycleState::Cancelled);
    }

    #[test]
    fn test_resolution_sets_deadline_from_dispute_window() {
        let w = writer();
        let market = addr(1);
        w.ingest(&ctx("r", 0, 50_000), &decoded(transition(&market, "resolve")));

        let m = w.store().market_by_address(&market).unwrap().unwrap();
        assert_eq!(m.resolution_proposed_at, Some(50_000));
        assert_eq!(m.deadline_timestamp, Some(53_600));
        assert_eq!(m.proposed_outcome, Some(Outcome::Yes));
    }

    #[test]
    fn test_dispute_resolution_is_applied_once() {
        let w = writer();
        let market = addr(1);
        for (sig, step) in [("a", "approve"), ("b", "activate"), ("c", "resolve")] {
            w.ingest(&ctx(sig, 0, 100), &decoded(transition(&market, step)));
        }
        w.ingest(
            &ctx("d", 0, 200),
            &decoded(TypedEvent::DisputeRaised(DisputeRaised {
                market: market.clone(),
                initiator: addr(6),
            })),
        );
        assert_eq!(state(&w, &market), LifecycleState::Disputed);

        let resolved = |agree| {
            decoded(TypedEvent::DisputeResolved(DisputeResolved {
                market: market.clone(),
                agree,
                disagree: 4,
                final_outcome: Outcome::No,
            }))
        };
        w.ingest(&ctx("e", 0, 300), &resolved(6));
        // Different signature, same market: the tally must not be rewritten.
        w.ingest(&ctx("f", 0, 400), &resolved(1));

        let dispute = w.store().dispute_for(&market).unwrap().unwrap();
        assert_eq!(dispute.agree_votes, Some(6));
        assert!(dispute.resolved);
        let m = w.store().market_by_address(&market).unwrap().unwrap();
        assert_eq!(m.lifecycle_state, LifecycleState::Finalized);
        assert_eq!(m.final_outcome, Some(Outcome::No));
    }

    #[test]
    fn test_claim_only_once() {
        let w = writer();
        let market = addr(1);
        let claim = |amount| {
            decoded(TypedEvent::WinningsClaimed(WinningsClaimed {
                market: market.clone(),
                claimer: addr(2),
                amount,
            }))
        };
        w.ingest(&ctx("c1", 0, 10), &claim(500));
        w.ingest(&ctx("c2", 0, 11), &claim(900));

        let pos = w.store().position(&market, &addr(2)).unwrap().unwrap();
        assert!(pos.has_claimed);
        assert_eq!(pos.claimed_amount, 500);
    }

    #[test]
    fn test_votes_aggregated_touch_no_domain_tables() {
        let w = writer();
        let out = w.ingest(
            &ctx("v", 0, 10),
            &decoded(TypedEvent::VotesAggregated(VotesAggregated {
                market: addr(1),
                kind: VoteKind::Proposal,
                for_votes: 10,
                against_votes: 2,
            })),
        );
        assert_eq!(out, ApplyOutcome::Applied);
        assert!(w.store().market_by_address(&addr(1)).unwrap().is_none());
    }

    #[test]
    fn test_failed_decode_is_stored_on_raw_event() {
        let w = writer();
        let mut d = decoded(TypedEvent::Unknown { discriminator: 0 });
        d.event_type = "shares_bought";
        d.event = Err(crate::error::DecodeError::EmptyData);

        let out = w.ingest(&ctx("bad", 0, 10), &d);
        assert!(matches!(out, ApplyOutcome::Failed(_)));
        let raw = w.store().raw_events_for_signature("bad").unwrap();
        assert_eq!(raw[0].error.as_deref(), Some("instruction data is empty"));
    }
}
