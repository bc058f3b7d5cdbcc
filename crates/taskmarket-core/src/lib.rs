//! Agent task market engine.
//!
//! Creators post tasks whose reward is locked in escrow, runners bid, the
//! creator accepts one bid, work is submitted and then either approved
//! (escrow released to the runner) or disputed before a council. Runners
//! accumulate a reputation score and derived badges.
//!
//! [`TaskRegistry`] is the entry point; the other components are driven by it.

pub mod bids;
pub mod clock;
pub mod config;
pub mod disputes;
pub mod error;
pub mod escrow;
pub mod events;
pub mod registry;
pub mod reputation;
pub mod settlement;
pub mod types;

pub use bids::{BidBook, BidList};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{InProgressCancelPolicy, MarketConfig};
pub use disputes::{CouncilVote, DisputeArbiter, DisputeCase, VoteOutcome};
pub use error::{MarketError, Result};
pub use escrow::{EscrowAccount, EscrowLedger};
pub use events::{MarketEvent, MarketEventKind};
pub use registry::{TaskQuery, TaskRegistry, TaskSort};
pub use reputation::{derive_badges, AgentStats, Badge, ReputationCounters, ReputationEngine};
pub use settlement::{
    InMemoryTransport, SettlementDirection, SettlementInstruction, SettlementReceipt,
    SettlementTarget, SettlementTransport,
};
pub use types::*;
