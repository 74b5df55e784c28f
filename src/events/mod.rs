//! Event catalogue and the pure decoder that produces it.

pub mod catalogue;
pub mod decoder;

pub use catalogue::{TradeSide, TypedEvent, VoteKind};
pub use decoder::{decode_instruction, decode_notification, DecodedInstruction, Notification, RawInstruction};
