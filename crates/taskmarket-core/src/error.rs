use crate::types::{AgentId, Disposition, TaskId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state for task {task_id}: expected {expected}, got {actual}")]
    InvalidState {
        task_id: TaskId,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    // Escrow invariants
    #[error("Escrow already exists for task {0}")]
    DuplicateEscrow(TaskId),

    #[error("Escrow for task {task_id} already settled ({disposition:?})")]
    AlreadySettled {
        task_id: TaskId,
        disposition: Disposition,
    },

    #[error("Settlement failed for task {task_id}: {reason}")]
    SettlementFailed { task_id: TaskId, reason: String },

    #[error("Settlement already in flight for task {0}")]
    SettlementInFlight(TaskId),

    // Arbitration invariants
    #[error("Dispute already open for task {0}")]
    DuplicateDispute(TaskId),

    #[error("Council member {member} already voted on task {task_id}")]
    DuplicateVote { task_id: TaskId, member: AgentId },

    #[error("Escrow failure for task {task_id}: {source}")]
    EscrowFailure {
        task_id: TaskId,
        #[source]
        source: Box<MarketError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl MarketError {
    pub(crate) fn invalid_state(
        task_id: TaskId,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            task_id,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn escrow_failure(task_id: TaskId, source: MarketError) -> Self {
        Self::EscrowFailure {
            task_id,
            source: Box::new(source),
        }
    }

    /// Settlement-class failures are the only ones a caller should retry as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SettlementFailed { .. } | Self::SettlementInFlight(_) => true,
            Self::EscrowFailure { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
