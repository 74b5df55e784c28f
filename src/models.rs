use serde::{Deserialize, Serialize};

/// Binary market outcome. `Invalid` is the ledger's `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Yes,
    No,
    Invalid,
}

impl Outcome {
    pub fn from_ledger(value: Option<bool>) -> Self {
        match value {
            Some(true) => Outcome::Yes,
            Some(false) => Outcome::No,
            None => Outcome::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
            Outcome::Invalid => "invalid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Outcome::Yes),
            "no" => Some(Outcome::No),
            "invalid" => Some(Outcome::Invalid),
            _ => None,
        }
    }
}

/// Market lifecycle as mirrored off-chain.
///
/// ```text
/// Proposed -> Approved -> Active -> Resolving -> Disputed -> Finalized
///                                            \-------------> Finalized
/// Proposed | Approved -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Proposed,
    Approved,
    Active,
    Resolving,
    Disputed,
    Finalized,
    Cancelled,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Proposed => "proposed",
            LifecycleState::Approved => "approved",
            LifecycleState::Active => "active",
            LifecycleState::Resolving => "resolving",
            LifecycleState::Disputed => "disputed",
            LifecycleState::Finalized => "finalized",
            LifecycleState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(LifecycleState::Proposed),
            "approved" => Some(LifecycleState::Approved),
            "active" => Some(LifecycleState::Active),
            "resolving" => Some(LifecycleState::Resolving),
            "disputed" => Some(LifecycleState::Disputed),
            "finalized" => Some(LifecycleState::Finalized),
            "cancelled" => Some(LifecycleState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Finalized | LifecycleState::Cancelled)
    }

    /// Single-edge transitions of the FSM.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (*self, next),
            (Proposed, Approved)
                | (Approved, Active)
                | (Active, Resolving)
                | (Resolving, Disputed)
                | (Resolving, Finalized)
                | (Disputed, Finalized)
                | (Proposed, Cancelled)
                | (Approved, Cancelled)
        )
    }

    /// True when `target` is reachable from `self` along one or more edges.
    pub fn can_advance_to(&self, target: LifecycleState) -> bool {
        let mut frontier = vec![*self];
        while let Some(state) = frontier.pop() {
            for next in ALL_STATES {
                if state.can_transition_to(next) {
                    if next == target {
                        return true;
                    }
                    frontier.push(next);
                }
            }
        }
        false
    }

    /// Furthest state whose whole predecessor chain is evidenced by `m`.
    ///
    /// Milestones are only ever set, so the result is monotone in arrival
    /// order: applying the same set of events in any order derives the same
    /// state.
    pub fn derive(m: &Milestones) -> LifecycleState {
        if m.cancelled && !m.activated {
            return LifecycleState::Cancelled;
        }
        if !m.approved {
            return LifecycleState::Proposed;
        }
        if !m.activated {
            return LifecycleState::Approved;
        }
        if !m.resolution_proposed {
            return LifecycleState::Active;
        }
        if m.finalized {
            return LifecycleState::Finalized;
        }
        if m.disputed {
            return LifecycleState::Disputed;
        }
        LifecycleState::Resolving
    }
}

const ALL_STATES: [LifecycleState; 7] = [
    LifecycleState::Proposed,
    LifecycleState::Approved,
    LifecycleState::Active,
    LifecycleState::Resolving,
    LifecycleState::Disputed,
    LifecycleState::Finalized,
    LifecycleState::Cancelled,
];

/// Which transition events have been observed for a market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Milestones {
    pub approved: bool,
    pub activated: bool,
    pub resolution_proposed: bool,
    pub disputed: bool,
    pub finalized: bool,
    pub cancelled: bool,
}

/// Mirror row for a ledger market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRecord {
    pub id: i64,
    pub ledger_address: String,
    /// Hex of the 32-byte on-chain market id, once the creation event is seen.
    pub market_id: Option<String>,
    pub creator: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub proposed_outcome: Option<Outcome>,
    pub final_outcome: Option<Outcome>,
    pub resolution_proposed_at: Option<i64>,
    pub deadline_timestamp: Option<i64>,
    pub shares_yes: i64,
    pub shares_no: i64,
    pub total_volume: i64,
    pub created_at: Option<i64>,
    pub liquidity_withdrawn_at: Option<i64>,
    pub withdrawn_amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionAggregate {
    pub market_id: i64,
    pub actor: String,
    pub shares_yes: i64,
    pub shares_no: i64,
    pub total_invested: i64,
    pub trades_count: i64,
    pub has_claimed: bool,
    pub claimed_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorAggregate {
    pub address: String,
    pub trade_count: i64,
    pub volume: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub id: i64,
    pub event_type: String,
    pub ledger_signature: String,
    pub instruction_index: i64,
    pub slot: i64,
    pub block_time: Option<i64>,
    pub source: String,
    pub payload_json: String,
    pub processed: bool,
    pub error: Option<String>,
    pub received_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationOutcome {
    Success,
    Failed,
    Rejected,
    Timeout,
    DryRun,
}

impl FinalizationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizationOutcome::Success => "success",
            FinalizationOutcome::Failed => "failed",
            FinalizationOutcome::Rejected => "rejected",
            FinalizationOutcome::Timeout => "timeout",
            FinalizationOutcome::DryRun => "dry_run",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(FinalizationOutcome::Success),
            "failed" => Some(FinalizationOutcome::Failed),
            "rejected" => Some(FinalizationOutcome::Rejected),
            "timeout" => Some(FinalizationOutcome::Timeout),
            "dry_run" => Some(FinalizationOutcome::DryRun),
            _ => None,
        }
    }
}

/// Append-only audit row written by the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationAttempt {
    pub market_id: i64,
    pub attempted_at: i64,
    pub outcome: FinalizationOutcome,
    pub ledger_signature: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub processing_time_ms: u64,
}
