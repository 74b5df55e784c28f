//! Deadline Scanner: which markets are due for finalization.

use tracing::debug;

use crate::models::MarketRecord;
use crate::store::{now_ts, MirrorStore};

#[derive(Clone)]
pub struct DeadlineScanner {
    store: MirrorStore,
    safety_buffer_secs: i64,
    batch_size: usize,
}

impl DeadlineScanner {
    pub fn new(store: MirrorStore, safety_buffer_secs: i64, batch_size: usize) -> Self {
        Self {
            store,
            safety_buffer_secs,
            batch_size,
        }
    }

    /// Markets still `resolving` whose dispute deadline plus the safety
    /// buffer has passed at `now`, oldest deadline first.
    ///
    /// Read-only. An error here means the whole cycle has nothing to work on.
    pub fn scan_at(&self, now: i64) -> rusqlite::Result<Vec<MarketRecord>> {
        let due = self
            .store
            .overdue_markets(now, self.safety_buffer_secs, self.batch_size)?;
        debug!(now, due = due.len(), "Deadline scan");
        Ok(due)
    }

    pub fn scan(&self) -> rusqlite::Result<Vec<MarketRecord>> {
        self.scan_at(now_ts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::catalogue::{ProposalApproved, ResolutionProposed};
    use crate::events::{DecodedInstruction, RawInstruction, TypedEvent};
    use crate::models::Outcome;
    use crate::store::{EventContext, MirrorWriter};

    const WINDOW: i64 = 1_000;

    fn apply(writer: &MirrorWriter, sig: &str, time: i64, event: TypedEvent) {
        let ctx = EventContext {
            signature: sig.to_string(),
            instruction_index: 0,
            slot: 1,
            block_time: Some(time),
            received_at: time,
            source: "test".into(),
        };
        let decoded = DecodedInstruction {
            index: 0,
            event_type: event.event_type(),
            event: Ok(event),
            raw: RawInstruction {
                program_address: "p".into(),
                accounts: vec![],
                data: String::new(),
            },
        };
        assert!(writer.ingest(&ctx, &decoded).is_success());
    }

    fn resolving_market(writer: &MirrorWriter, market: &str, proposed_at: i64) {
        apply(
            writer,
            &format!("{}-a", market),
            0,
            TypedEvent::ProposalApproved(ProposalApproved {
                market: market.into(),
                likes: 1,
                dislikes: 0,
            }),
        );
        apply(
            writer,
            &format!("{}-b", market),
            0,
            TypedEvent::MarketActivated {
                market: market.into(),
            },
        );
        apply(
            writer,
            &format!("{}-c", market),
            proposed_at,
            TypedEvent::ResolutionProposed(ResolutionProposed {
                market: market.into(),
                resolver: "resolver".into(),
                outcome: Outcome::Yes,
            }),
        );
    }

    #[test]
    fn test_safety_buffer_boundary() {
        let writer = MirrorWriter::new(MirrorStore::in_memory().unwrap(), WINDOW);
        resolving_market(&writer, "m1", 10_000);
        let deadline = 10_000 + WINDOW;
        let scanner = DeadlineScanner::new(writer.store().clone(), 60, 10);

        assert!(scanner.scan_at(deadline + 59).unwrap().is_empty());
        let due = scanner.scan_at(deadline + 60).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].ledger_address, "m1");
    }

    #[test]
    fn test_batch_is_ordered_and_capped() {
        let writer = MirrorWriter::new(MirrorStore::in_memory().unwrap(), WINDOW);
        resolving_market(&writer, "newer", 3_000);
        resolving_market(&writer, "oldest", 1_000);
        resolving_market(&writer, "middle", 2_000);

        let scanner = DeadlineScanner::new(writer.store().clone(), 0, 2);
        let due = scanner.scan_at(100_000).unwrap();
        let names: Vec<_> = due.iter().map(|m| m.ledger_address.as_str()).collect();
        assert_eq!(names, vec!["oldest", "middle"]);
    }
}
