use crate::types::{AgentId, DisputeId, TaskId, Verdict};
use crate::{MarketError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouncilVote {
    pub member: AgentId,
    pub verdict: Verdict,
    pub cast_at: DateTime<Utc>,
}

/// Dispute bound 1:1 to a task in `Disputed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeCase {
    pub id: DisputeId,
    pub task_id: TaskId,
    pub raised_by: AgentId,
    pub reason: String,
    pub votes: Vec<CouncilVote>,
    /// Set once quorum and a strict majority are reached
    pub resolution: Option<Verdict>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DisputeCase {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.votes.iter().filter(|v| v.verdict == verdict).count()
    }

    pub fn has_voted(&self, member: &AgentId) -> bool {
        self.votes.iter().any(|v| v.member == *member)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Below quorum or tied
    Pending {
        for_runner: usize,
        for_creator: usize,
    },
    /// Binding verdict; the caller must carry it out and then `finalize`
    Decided(Verdict),
}

/// Decide a verdict from the votes cast so far.
///
/// Requires at least `quorum` votes and a strict majority; an exact split
/// stays undecided.
pub fn tally(votes: &[CouncilVote], quorum: usize) -> Option<Verdict> {
    if votes.len() < quorum {
        return None;
    }
    let for_runner = votes
        .iter()
        .filter(|v| v.verdict == Verdict::FavorRunner)
        .count();
    let for_creator = votes.len() - for_runner;

    match for_runner.cmp(&for_creator) {
        std::cmp::Ordering::Greater => Some(Verdict::FavorRunner),
        std::cmp::Ordering::Less => Some(Verdict::FavorCreator),
        std::cmp::Ordering::Equal => None,
    }
}

/// Council arbitration over disputed completions
pub struct DisputeArbiter {
    council: Vec<AgentId>,
    quorum: usize,
    open: Arc<RwLock<HashMap<TaskId, DisputeCase>>>,
    archive: Arc<RwLock<HashMap<TaskId, DisputeCase>>>,
    next_id: AtomicU64,
}

impl DisputeArbiter {
    pub fn new(council: Vec<AgentId>, quorum: usize) -> Self {
        Self {
            council,
            quorum,
            open: Arc::new(RwLock::new(HashMap::new())),
            archive: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn council(&self) -> &[AgentId] {
        &self.council
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn is_council_member(&self, agent: &AgentId) -> bool {
        self.council.contains(agent)
    }

    /// Open a case for `task_id`.
    pub async fn raise(
        &self,
        task_id: TaskId,
        raised_by: AgentId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<DisputeId> {
        let mut open = self.open.write().await;
        if open.contains_key(&task_id) {
            return Err(MarketError::DuplicateDispute(task_id));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        open.insert(
            task_id,
            DisputeCase {
                id,
                task_id,
                raised_by,
                reason,
                votes: Vec::new(),
                resolution: None,
                opened_at: now,
                resolved_at: None,
            },
        );

        info!(
            task_id,
            dispute_id = id,
            raised_by = %raised_by.short(),
            quorum = self.quorum,
            "⚖️ Dispute opened"
        );

        Ok(id)
    }

    /// Record a council vote and re-tally.
    pub async fn cast_vote(
        &self,
        task_id: TaskId,
        member: AgentId,
        verdict: Verdict,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome> {
        if !self.is_council_member(&member) {
            return Err(MarketError::invalid_state(
                task_id,
                "council member",
                format!("non-member {}", member.short()),
            ));
        }

        let mut open = self.open.write().await;
        let Some(case) = open.get_mut(&task_id) else {
            if self.archive.read().await.contains_key(&task_id) {
                return Err(MarketError::invalid_state(
                    task_id,
                    "open dispute",
                    "dispute already resolved",
                ));
            }
            return Err(MarketError::NotFound(format!("dispute for task {task_id}")));
        };

        if case.resolution.is_some() {
            return Err(MarketError::invalid_state(
                task_id,
                "open dispute",
                "verdict being carried out",
            ));
        }
        if case.has_voted(&member) {
            return Err(MarketError::DuplicateVote { task_id, member });
        }

        case.votes.push(CouncilVote {
            member,
            verdict,
            cast_at: now,
        });

        let outcome = match tally(&case.votes, self.quorum) {
            Some(decided) => {
                case.resolution = Some(decided);
                VoteOutcome::Decided(decided)
            }
            None => VoteOutcome::Pending {
                for_runner: case.count(Verdict::FavorRunner),
                for_creator: case.count(Verdict::FavorCreator),
            },
        };

        debug!(
            task_id,
            member = %member.short(),
            verdict = ?verdict,
            votes = case.votes.len(),
            outcome = ?outcome,
            "Council vote recorded"
        );

        Ok(outcome)
    }

    /// Undo `member`'s vote after its verdict could not be carried out.
    pub async fn retract_vote(&self, task_id: TaskId, member: &AgentId) {
        if let Some(case) = self.open.write().await.get_mut(&task_id) {
            case.votes.retain(|v| v.member != *member);
            case.resolution = None;
            debug!(task_id, member = %member.short(), "Council vote retracted");
        }
    }

    /// Archive a decided case.
    pub async fn finalize(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<DisputeCase> {
        let mut case = {
            let mut open = self.open.write().await;
            match open.get(&task_id) {
                Some(case) if case.resolution.is_some() => {}
                Some(_) => {
                    return Err(MarketError::invalid_state(
                        task_id,
                        "decided dispute",
                        "no verdict",
                    ))
                }
                None => return Err(MarketError::NotFound(format!("dispute for task {task_id}"))),
            }
            open.remove(&task_id)
                .ok_or_else(|| MarketError::NotFound(format!("dispute for task {task_id}")))?
        };
        case.resolved_at = Some(now);

        info!(
            task_id,
            dispute_id = case.id,
            verdict = ?case.resolution,
            for_runner = case.count(Verdict::FavorRunner),
            for_creator = case.count(Verdict::FavorCreator),
            "✅ Dispute resolved"
        );

        self.archive.write().await.insert(task_id, case.clone());
        Ok(case)
    }

    /// Open case first, then the archive
    pub async fn get_case(&self, task_id: TaskId) -> Option<DisputeCase> {
        if let Some(case) = self.open.read().await.get(&task_id) {
            return Some(case.clone());
        }
        self.archive.read().await.get(&task_id).cloned()
    }

    pub async fn has_open_case(&self, task_id: TaskId) -> bool {
        self.open.read().await.contains_key(&task_id)
    }

    pub async fn open_count(&self) -> usize {
        self.open.read().await.len()
    }

    /// Drop the archived case for a purged task.
    pub async fn purge(&self, task_id: TaskId) {
        self.archive.write().await.remove(&task_id);
    }
}
