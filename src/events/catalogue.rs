//! Typed event catalogue.
//!
//! Every instruction the program can emit maps to exactly one variant of
//! [`TypedEvent`]. Discriminators outside the catalogue become
//! [`TypedEvent::Unknown`] so a new instruction on the ledger never stalls
//! ingestion of its siblings.

use borsh::BorshDeserialize;
use serde::{Deserialize, Serialize};

use crate::models::Outcome;

pub const MARKET_CREATED: u8 = 0;
pub const SHARES_BOUGHT: u8 = 1;
pub const SHARES_SOLD: u8 = 2;
pub const PROPOSAL_APPROVED: u8 = 3;
pub const RESOLUTION_PROPOSED: u8 = 4;
pub const DISPUTE_RAISED: u8 = 5;
pub const DISPUTE_RESOLVED: u8 = 6;
pub const WINNINGS_CLAIMED: u8 = 7;
pub const PROPOSAL_VOTES_AGGREGATED: u8 = 8;
pub const DISPUTE_VOTES_AGGREGATED: u8 = 9;
pub const MARKET_ACTIVATED: u8 = 10;
pub const MARKET_CANCELLED: u8 = 11;
pub const MARKET_FINALIZED: u8 = 12;
pub const LIQUIDITY_WITHDRAWN: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketCreated {
    pub market: String,
    pub creator: String,
    pub market_id: [u8; 32],
    pub b_parameter: u64,
    pub initial_liquidity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traded {
    pub market: String,
    pub trader: String,
    pub side: TradeSide,
    /// `true` for YES shares.
    pub outcome: bool,
    pub shares: u64,
    /// Cost for buys, proceeds for sells.
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalApproved {
    pub market: String,
    pub likes: u32,
    pub dislikes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionProposed {
    pub market: String,
    pub resolver: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeRaised {
    pub market: String,
    pub initiator: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeResolved {
    pub market: String,
    pub agree: u32,
    pub disagree: u32,
    pub final_outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinningsClaimed {
    pub market: String,
    pub claimer: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    Proposal,
    Dispute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotesAggregated {
    pub market: String,
    pub kind: VoteKind,
    pub for_votes: u32,
    pub against_votes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketFinalized {
    pub market: String,
    pub final_outcome: Outcome,
}

/// Creator pulls the remaining pool out of a finalized market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidityWithdrawn {
    pub market: String,
    pub creator: String,
    pub amount: u64,
}

/// Closed union over the program's event catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedEvent {
    MarketCreated(MarketCreated),
    Traded(Traded),
    ProposalApproved(ProposalApproved),
    ResolutionProposed(ResolutionProposed),
    DisputeRaised(DisputeRaised),
    DisputeResolved(DisputeResolved),
    WinningsClaimed(WinningsClaimed),
    VotesAggregated(VotesAggregated),
    MarketActivated { market: String },
    MarketCancelled { market: String },
    MarketFinalized(MarketFinalized),
    LiquidityWithdrawn(LiquidityWithdrawn),
    Unknown { discriminator: u8 },
}

impl TypedEvent {
    /// Stable name stored in `raw_events.event_type`.
    pub fn event_type(&self) -> &'static str {
        match self {
            TypedEvent::MarketCreated(_) => "market_created",
            TypedEvent::Traded(t) => match t.side {
                TradeSide::Buy => "shares_bought",
                TradeSide::Sell => "shares_sold",
            },
            TypedEvent::ProposalApproved(_) => "proposal_approved",
            TypedEvent::ResolutionProposed(_) => "resolution_proposed",
            TypedEvent::DisputeRaised(_) => "dispute_raised",
            TypedEvent::DisputeResolved(_) => "dispute_resolved",
            TypedEvent::WinningsClaimed(_) => "winnings_claimed",
            TypedEvent::VotesAggregated(v) => match v.kind {
                VoteKind::Proposal => "proposal_votes_aggregated",
                VoteKind::Dispute => "dispute_votes_aggregated",
            },
            TypedEvent::MarketActivated { .. } => "market_activated",
            TypedEvent::MarketCancelled { .. } => "market_cancelled",
            TypedEvent::MarketFinalized(_) => "market_finalized",
            TypedEvent::LiquidityWithdrawn(_) => "liquidity_withdrawn",
            TypedEvent::Unknown { .. } => "unknown",
        }
    }

    /// Ledger address of the market the event refers to.
    pub fn market(&self) -> Option<&str> {
        match self {
            TypedEvent::MarketCreated(e) => Some(&e.market),
            TypedEvent::Traded(e) => Some(&e.market),
            TypedEvent::ProposalApproved(e) => Some(&e.market),
            TypedEvent::ResolutionProposed(e) => Some(&e.market),
            TypedEvent::DisputeRaised(e) => Some(&e.market),
            TypedEvent::DisputeResolved(e) => Some(&e.market),
            TypedEvent::WinningsClaimed(e) => Some(&e.market),
            TypedEvent::VotesAggregated(e) => Some(&e.market),
            TypedEvent::MarketActivated { market } | TypedEvent::MarketCancelled { market } => {
                Some(market)
            }
            TypedEvent::MarketFinalized(e) => Some(&e.market),
            TypedEvent::LiquidityWithdrawn(e) => Some(&e.market),
            TypedEvent::Unknown { .. } => None,
        }
    }
}

/// Name used in `raw_events.event_type` for a discriminator, whether or not
/// its body decodes.
pub fn event_type_name(discriminator: u8) -> &'static str {
    match discriminator {
        MARKET_CREATED => "market_created",
        SHARES_BOUGHT => "shares_bought",
        SHARES_SOLD => "shares_sold",
        PROPOSAL_APPROVED => "proposal_approved",
        RESOLUTION_PROPOSED => "resolution_proposed",
        DISPUTE_RAISED => "dispute_raised",
        DISPUTE_RESOLVED => "dispute_resolved",
        WINNINGS_CLAIMED => "winnings_claimed",
        PROPOSAL_VOTES_AGGREGATED => "proposal_votes_aggregated",
        DISPUTE_VOTES_AGGREGATED => "dispute_votes_aggregated",
        MARKET_ACTIVATED => "market_activated",
        MARKET_CANCELLED => "market_cancelled",
        MARKET_FINALIZED => "market_finalized",
        LIQUIDITY_WITHDRAWN => "liquidity_withdrawn",
        _ => "unknown",
    }
}

// ===== Borsh bodies (everything after the discriminator byte) =====

#[derive(BorshDeserialize)]
pub(crate) struct CreatedBody {
    pub market_id: [u8; 32],
    pub b_parameter: u64,
    pub initial_liquidity: u64,
}

#[derive(BorshDeserialize)]
pub(crate) struct TradeBody {
    pub outcome: bool,
    pub shares: u64,
    pub amount: u64,
}

#[derive(BorshDeserialize)]
pub(crate) struct VoteCountBody {
    pub for_votes: u32,
    pub against_votes: u32,
}

#[derive(BorshDeserialize)]
pub(crate) struct OutcomeBody {
    pub outcome: Option<bool>,
}

#[derive(BorshDeserialize)]
pub(crate) struct DisputeResolvedBody {
    pub agree: u32,
    pub disagree: u32,
    pub final_outcome: Option<bool>,
}

/// Winnings claims and liquidity withdrawals.
#[derive(BorshDeserialize)]
pub(crate) struct AmountBody {
    pub amount: u64,
}
