use crate::types::{AgentId, Rating};
use crate::{MarketError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What happens to the creator when an `InProgress` task is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InProgressCancelPolicy {
    /// Refund only; an audit note is still recorded
    #[default]
    NoPenalty,
    /// Subtract `points` from the creator's score
    PenalizeCreator { points: u64 },
}

/// Marketplace engine parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Starting score for newly seen agents
    pub baseline_score: u64,
    /// Agents allowed to vote on disputes
    pub council: Vec<AgentId>,
    /// Minimum votes before a verdict binds
    pub quorum: usize,
    /// Rating recorded when a dispute is resolved for the runner
    pub dispute_rating: u8,
    /// Reject acceptBid/submitWork once the deadline has passed
    pub reject_after_deadline: bool,
    pub max_title_len: usize,
    pub max_description_len: usize,
    /// Limit for proposals, deliverables and reasons
    pub max_text_len: usize,
    pub in_progress_cancel: InProgressCancelPolicy,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            baseline_score: 100,
            council: Vec::new(),
            quorum: 3,
            dispute_rating: Rating::NEUTRAL.stars(),
            reject_after_deadline: false,
            max_title_len: 200,
            max_description_len: 10_000,
            max_text_len: 10_000,
            in_progress_cancel: InProgressCancelPolicy::NoPenalty,
        }
    }
}

impl MarketConfig {
    pub fn with_council(mut self, council: Vec<AgentId>, quorum: usize) -> Self {
        self.council = council;
        self.quorum = quorum;
        self
    }

    pub fn dispute_rating(&self) -> Result<Rating> {
        Rating::new(self.dispute_rating)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quorum == 0 {
            return Err(MarketError::InvalidConfiguration(
                "quorum must be > 0".to_string(),
            ));
        }

        // An empty council is allowed; raise_dispute is then refused
        if !self.council.is_empty() && self.quorum > self.council.len() {
            return Err(MarketError::InvalidConfiguration(format!(
                "quorum {} exceeds council size {}",
                self.quorum,
                self.council.len()
            )));
        }

        let unique: HashSet<_> = self.council.iter().collect();
        if unique.len() != self.council.len() {
            return Err(MarketError::InvalidConfiguration(
                "council members must be unique".to_string(),
            ));
        }

        self.dispute_rating().map_err(|e| {
            MarketError::InvalidConfiguration(format!("dispute_rating: {e}"))
        })?;

        if self.max_title_len == 0 || self.max_description_len == 0 || self.max_text_len == 0 {
            return Err(MarketError::InvalidConfiguration(
                "text length limits must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
