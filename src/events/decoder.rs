//! Pure decoding of webhook notifications into typed events.
//!
//! No I/O happens here. One malformed instruction produces a [`DecodeError`]
//! for that instruction only; its siblings still decode.

use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use borsh::BorshDeserialize;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use super::catalogue::*;
use crate::error::DecodeError;
use crate::models::Outcome;

/// One ledger transaction as delivered by the webhook provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Transaction signature, the deduplication key.
    pub signature: String,
    pub slot: u64,
    /// Block time in unix seconds; some providers send null for fresh blocks.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub instructions: Vec<RawInstruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstruction {
    pub program_address: String,
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Base64; first byte is the event discriminator.
    pub data: String,
}

/// Decode result for one instruction of a notification.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    /// Position of the instruction inside the transaction.
    pub index: usize,
    /// `raw_events.event_type` for this instruction, known even when the
    /// body failed to decode.
    pub event_type: &'static str,
    pub event: Result<TypedEvent, DecodeError>,
    pub raw: RawInstruction,
}

/// Decodes every instruction addressed to `program_id`; others are ignored.
pub fn decode_notification(notification: &Notification, program_id: &str) -> Vec<DecodedInstruction> {
    notification
        .instructions
        .iter()
        .enumerate()
        .filter(|(_, ix)| ix.program_address == program_id)
        .map(|(index, ix)| {
            let discriminator = peek_discriminator(&ix.data);
            let event = decode_instruction(ix);
            let event_type = match (&event, discriminator) {
                (Ok(ev), _) => ev.event_type(),
                (Err(_), Some(d)) => event_type_name(d),
                (Err(_), None) => "malformed",
            };
            DecodedInstruction {
                index,
                event_type,
                event,
                raw: ix.clone(),
            }
        })
        .collect()
}

fn peek_discriminator(data: &str) -> Option<u8> {
    BASE64.decode(data).ok()?.first().copied()
}

/// Decodes a single instruction regardless of its program address.
pub fn decode_instruction(ix: &RawInstruction) -> Result<TypedEvent, DecodeError> {
    let bytes = BASE64
        .decode(&ix.data)
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    let (&discriminator, body) = bytes.split_first().ok_or(DecodeError::EmptyData)?;
    let name = event_type_name(discriminator);
    let accounts = &ix.accounts;

    let event = match discriminator {
        MARKET_CREATED => {
            let [market, creator] = take_accounts::<2>(name, accounts)?;
            let b: CreatedBody = parse_body(name, body)?;
            TypedEvent::MarketCreated(MarketCreated {
                market,
                creator,
                market_id: b.market_id,
                b_parameter: b.b_parameter,
                initial_liquidity: b.initial_liquidity,
            })
        }
        SHARES_BOUGHT | SHARES_SOLD => {
            let [market, trader] = take_accounts::<2>(name, accounts)?;
            let b: TradeBody = parse_body(name, body)?;
            let side = if discriminator == SHARES_BOUGHT {
                TradeSide::Buy
            } else {
                TradeSide::Sell
            };
            TypedEvent::Traded(Traded {
                market,
                trader,
                side,
                outcome: b.outcome,
                shares: b.shares,
                amount: b.amount,
            })
        }
        PROPOSAL_APPROVED => {
            let [market] = take_accounts::<1>(name, accounts)?;
            let b: VoteCountBody = parse_body(name, body)?;
            TypedEvent::ProposalApproved(ProposalApproved {
                market,
                likes: b.for_votes,
                dislikes: b.against_votes,
            })
        }
        RESOLUTION_PROPOSED => {
            let [market, resolver] = take_accounts::<2>(name, accounts)?;
            let b: OutcomeBody = parse_body(name, body)?;
            TypedEvent::ResolutionProposed(ResolutionProposed {
                market,
                resolver,
                outcome: Outcome::from_ledger(b.outcome),
            })
        }
        DISPUTE_RAISED => {
            let [market, initiator] = take_accounts::<2>(name, accounts)?;
            expect_empty(name, body)?;
            TypedEvent::DisputeRaised(DisputeRaised { market, initiator })
        }
        DISPUTE_RESOLVED => {
            let [market] = take_accounts::<1>(name, accounts)?;
            let b: DisputeResolvedBody = parse_body(name, body)?;
            TypedEvent::DisputeResolved(DisputeResolved {
                market,
                agree: b.agree,
                disagree: b.disagree,
                final_outcome: Outcome::from_ledger(b.final_outcome),
            })
        }
        WINNINGS_CLAIMED => {
            let [market, claimer] = take_accounts::<2>(name, accounts)?;
            let b: AmountBody = parse_body(name, body)?;
            TypedEvent::WinningsClaimed(WinningsClaimed {
                market,
                claimer,
                amount: b.amount,
            })
        }
        PROPOSAL_VOTES_AGGREGATED | DISPUTE_VOTES_AGGREGATED => {
            let [market] = take_accounts::<1>(name, accounts)?;
            let b: VoteCountBody = parse_body(name, body)?;
            let kind = if discriminator == PROPOSAL_VOTES_AGGREGATED {
                VoteKind::Proposal
            } else {
                VoteKind::Dispute
            };
            TypedEvent::VotesAggregated(VotesAggregated {
                market,
                kind,
                for_votes: b.for_votes,
                against_votes: b.against_votes,
            })
        }
        MARKET_ACTIVATED => {
            let [market] = take_accounts::<1>(name, accounts)?;
            expect_empty(name, body)?;
            TypedEvent::MarketActivated { market }
        }
        MARKET_CANCELLED => {
            let [market] = take_accounts::<1>(name, accounts)?;
            expect_empty(name, body)?;
            TypedEvent::MarketCancelled { market }
        }
        MARKET_FINALIZED => {
            let [market] = take_accounts::<1>(name, accounts)?;
            let b: OutcomeBody = parse_body(name, body)?;
            TypedEvent::MarketFinalized(MarketFinalized {
                market,
                final_outcome: Outcome::from_ledger(b.outcome),
            })
        }
        LIQUIDITY_WITHDRAWN => {
            let [market, creator] = take_accounts::<2>(name, accounts)?;
            let b: AmountBody = parse_body(name, body)?;
            TypedEvent::LiquidityWithdrawn(LiquidityWithdrawn {
                market,
                creator,
                amount: b.amount,
            })
        }
        other => TypedEvent::Unknown {
            discriminator: other,
        },
    };

    Ok(event)
}

fn parse_body<T: BorshDeserialize>(event: &'static str, body: &[u8]) -> Result<T, DecodeError> {
    T::try_from_slice(body).map_err(|e| DecodeError::Body {
        event,
        reason: e.to_string(),
    })
}

fn expect_empty(event: &'static str, body: &[u8]) -> Result<(), DecodeError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::Body {
            event,
            reason: format!("{} unexpected trailing bytes", body.len()),
        })
    }
}

/// First `N` accounts, each validated as a ledger address.
fn take_accounts<const N: usize>(
    event: &'static str,
    accounts: &[String],
) -> Result<[String; N], DecodeError> {
    if accounts.len() < N {
        return Err(DecodeError::MissingAccounts {
            event,
            expected: N,
            actual: accounts.len(),
        });
    }
    for account in &accounts[..N] {
        Pubkey::from_str(account).map_err(|_| DecodeError::InvalidAddress(account.clone()))?;
    }
    Ok(std::array::from_fn(|i| accounts[i].clone()))
}
