use crate::types::{AgentId, BidIndex, DisputeId, TaskId, TaskStatus, TokenAmount, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event emitted after a successful state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub task_id: TaskId,
    /// Task status after the change
    pub status: TaskStatus,
    pub kind: MarketEventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketEventKind {
    TaskCreated {
        creator: AgentId,
        reward: TokenAmount,
    },
    BidSubmitted {
        bidder: AgentId,
        index: BidIndex,
    },
    BidAccepted {
        runner: AgentId,
        index: BidIndex,
    },
    WorkSubmitted {
        runner: AgentId,
    },
    TaskCompleted {
        runner: AgentId,
        amount: TokenAmount,
        rating: u8,
    },
    TaskCancelled {
        refunded: TokenAmount,
    },
    DisputeRaised {
        dispute_id: DisputeId,
        raised_by: AgentId,
    },
    VoteCast {
        member: AgentId,
        verdict: Verdict,
    },
    DisputeResolved {
        verdict: Verdict,
    },
}

impl MarketEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::BidSubmitted { .. } => "bid_submitted",
            Self::BidAccepted { .. } => "bid_accepted",
            Self::WorkSubmitted { .. } => "work_submitted",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::DisputeRaised { .. } => "dispute_raised",
            Self::VoteCast { .. } => "vote_cast",
            Self::DisputeResolved { .. } => "dispute_resolved",
        }
    }
}
