use crate::types::{AgentId, Rating, TokenAmount};
use crate::{MarketError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Reputation engine with additive per-completion updates
///
/// - Completion: score += 5 + (rating - 3) * 3, floored at 0
/// - Task creation: counted, never rewarded
/// - Badges: recomputed from counters on every read
pub struct ReputationEngine {
    baseline_score: u64,
    agents: Arc<RwLock<HashMap<AgentId, ReputationCounters>>>,
}

/// Raw per-agent counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationCounters {
    pub score: u64,
    pub tasks_completed: u64,
    pub tasks_created: u64,
    pub early_completions: u64,
    pub rating_sum: u64,
    pub total_earned: TokenAmount,
}

impl ReputationCounters {
    pub fn with_score(score: u64) -> Self {
        Self {
            score,
            ..Default::default()
        }
    }

    /// Average rating in hundredths (450 == 4.5 stars)
    pub fn average_rating_centi(&self) -> Option<u64> {
        (self.tasks_completed > 0).then(|| self.rating_sum * 100 / self.tasks_completed)
    }

    fn average_at_least(&self, tenths: u64) -> bool {
        self.tasks_completed > 0 && self.rating_sum * 10 >= tenths * self.tasks_completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Badge {
    /// ≥100 completions, average rating ≥4.5
    TrustedPro,
    /// ≥80% of completions submitted before half the deadline window
    QuickSolver,
    /// 5–20 completions, average rating ≥4.0
    RisingStar,
}

/// Derive the badge set from counters. Pure.
pub fn derive_badges(counters: &ReputationCounters) -> BTreeSet<Badge> {
    let mut badges = BTreeSet::new();

    if counters.tasks_completed >= 100 && counters.average_at_least(45) {
        badges.insert(Badge::TrustedPro);
    }

    if counters.tasks_completed > 0 && counters.early_completions * 5 >= counters.tasks_completed * 4 {
        badges.insert(Badge::QuickSolver);
    }

    if (5..=20).contains(&counters.tasks_completed) && counters.average_at_least(40) {
        badges.insert(Badge::RisingStar);
    }

    badges
}

/// Score change for one completion
pub fn completion_delta(rating: Rating) -> i64 {
    5 + (i64::from(rating.stars()) - 3) * 3
}

fn apply_delta(score: u64, delta: i64) -> u64 {
    if delta >= 0 {
        score.saturating_add(delta as u64)
    } else {
        score.saturating_sub(delta.unsigned_abs())
    }
}

/// Read-only view returned to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent: AgentId,
    pub counters: ReputationCounters,
    pub badges: BTreeSet<Badge>,
}

impl AgentStats {
    pub fn score(&self) -> u64 {
        self.counters.score
    }

    pub fn average_rating(&self) -> Option<f64> {
        self.counters
            .average_rating_centi()
            .map(|centi| centi as f64 / 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationUpdate {
    pub agent: AgentId,
    pub old_score: u64,
    pub new_score: u64,
}

impl ReputationEngine {
    pub fn new(baseline_score: u64) -> Self {
        Self {
            baseline_score,
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn baseline_score(&self) -> u64 {
        self.baseline_score
    }

    /// Create the agent record on first interaction.
    pub async fn ensure_agent(&self, agent: AgentId) {
        let mut agents = self.agents.write().await;
        if !agents.contains_key(&agent) {
            agents.insert(agent, ReputationCounters::with_score(self.baseline_score));
            debug!(agent = %agent.short(), baseline = self.baseline_score, "Agent registered");
        }
    }

    /// Update runner reputation after a completed task
    pub async fn record_completion(
        &self,
        runner: AgentId,
        rating: Rating,
        on_time: bool,
    ) -> ReputationUpdate {
        let mut agents = self.agents.write().await;
        let counters = agents
            .entry(runner)
            .or_insert_with(|| ReputationCounters::with_score(self.baseline_score));

        let old_score = counters.score;
        counters.score = apply_delta(old_score, completion_delta(rating));
        counters.tasks_completed += 1;
        counters.rating_sum += u64::from(rating.stars());
        if on_time {
            counters.early_completions += 1;
        }

        info!(
            agent = %runner.short(),
            rating = rating.stars(),
            on_time,
            old_score,
            new_score = counters.score,
            completed = counters.tasks_completed,
            "📊 Reputation updated"
        );

        ReputationUpdate {
            agent: runner,
            old_score,
            new_score: counters.score,
        }
    }

    /// Count a task creation; no score change.
    pub async fn record_creator_activity(&self, creator: AgentId) {
        let mut agents = self.agents.write().await;
        let counters = agents
            .entry(creator)
            .or_insert_with(|| ReputationCounters::with_score(self.baseline_score));
        counters.tasks_created += 1;
        debug!(agent = %creator.short(), created = counters.tasks_created, "Creator activity recorded");
    }

    pub async fn record_earnings(&self, runner: AgentId, amount: TokenAmount) {
        let mut agents = self.agents.write().await;
        let counters = agents
            .entry(runner)
            .or_insert_with(|| ReputationCounters::with_score(self.baseline_score));
        counters.total_earned = counters.total_earned.saturating_add(amount);
    }

    /// Subtract `points` from an agent's score (floored at 0).
    pub async fn record_penalty(&self, agent: AgentId, points: u64, reason: &str) -> ReputationUpdate {
        let mut agents = self.agents.write().await;
        let counters = agents
            .entry(agent)
            .or_insert_with(|| ReputationCounters::with_score(self.baseline_score));
        let old_score = counters.score;
        counters.score = old_score.saturating_sub(points);

        info!(
            agent = %agent.short(),
            points,
            reason,
            old_score,
            new_score = counters.score,
            "⚖️ Reputation penalty applied"
        );

        ReputationUpdate {
            agent,
            old_score,
            new_score: counters.score,
        }
    }

    /// Score for a known agent, baseline otherwise
    pub async fn get_score(&self, agent: &AgentId) -> u64 {
        self.agents
            .read()
            .await
            .get(agent)
            .map(|c| c.score)
            .unwrap_or(self.baseline_score)
    }

    pub async fn get_stats(&self, agent: &AgentId) -> Result<AgentStats> {
        let agents = self.agents.read().await;
        let counters = agents
            .get(agent)
            .cloned()
            .ok_or_else(|| MarketError::NotFound(format!("agent {agent}")))?;
        let badges = derive_badges(&counters);
        Ok(AgentStats {
            agent: *agent,
            counters,
            badges,
        })
    }

    pub async fn get_badges(&self, agent: &AgentId) -> Result<BTreeSet<Badge>> {
        Ok(self.get_stats(agent).await?.badges)
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }
}
