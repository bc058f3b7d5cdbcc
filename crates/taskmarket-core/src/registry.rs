use crate::bids::{BidBook, BidList};
use crate::clock::{Clock, SystemClock};
use crate::config::{InProgressCancelPolicy, MarketConfig};
use crate::disputes::{DisputeArbiter, DisputeCase, VoteOutcome};
use crate::escrow::EscrowLedger;
use crate::events::{MarketEvent, MarketEventKind};
use crate::reputation::{AgentStats, Badge, ReputationEngine};
use crate::settlement::{SettlementReceipt, SettlementTransport};
use crate::types::{
    AgentId, AuditNote, Bid, BidIndex, DisputeId, LifecycleState, MarketStats, Rating, Task,
    TaskId, TaskStatus, TokenAmount, Verdict,
};
use crate::{MarketError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Sort order for [`TaskQuery`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSort {
    /// Highest id first
    #[default]
    Newest,
    /// Largest reward first, newest breaking ties
    Reward,
}

/// Filter for [`TaskRegistry::list_tasks`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub min_reward: Option<TokenAmount>,
    pub sort: TaskSort,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn open() -> Self {
        Self {
            status: Some(TaskStatus::Open),
            ..Default::default()
        }
    }

    pub fn with_min_reward(mut self, min_reward: TokenAmount) -> Self {
        self.min_reward = Some(min_reward);
        self
    }

    pub fn sorted_by(mut self, sort: TaskSort) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.min_reward.map_or(true, |min| task.reward >= min)
    }
}

/// Task lifecycle engine.
///
/// Owns the task table and drives the escrow ledger, bid book, reputation
/// engine and dispute arbiter. Every mutating operation on a task runs under
/// that task's lock, including the settlement call, so operations on the same
/// task are serialized while different tasks proceed in parallel.
pub struct TaskRegistry {
    config: MarketConfig,
    clock: Arc<dyn Clock>,
    escrow: Arc<EscrowLedger>,
    bids: Arc<BidBook>,
    reputation: Arc<ReputationEngine>,
    arbiter: Arc<DisputeArbiter>,
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    task_locks: RwLock<HashMap<TaskId, Arc<Mutex<()>>>>,
    notes: RwLock<HashMap<TaskId, Vec<AuditNote>>>,
    // Held across the escrow deposit so ids are only consumed by successful creations
    creation: Mutex<()>,
    next_task_id: AtomicU64,
    event_tx: Option<mpsc::UnboundedSender<MarketEvent>>,
}

impl TaskRegistry {
    pub fn new(config: MarketConfig, transport: Arc<dyn SettlementTransport>) -> Result<Self> {
        config.validate()?;

        let reputation = Arc::new(ReputationEngine::new(config.baseline_score));
        let arbiter = Arc::new(DisputeArbiter::new(config.council.clone(), config.quorum));

        info!(
            council = config.council.len(),
            quorum = config.quorum,
            baseline_score = config.baseline_score,
            reject_after_deadline = config.reject_after_deadline,
            "🏪 Task registry initialized"
        );

        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            escrow: Arc::new(EscrowLedger::new(transport)),
            bids: Arc::new(BidBook::new()),
            reputation,
            arbiter,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            task_locks: RwLock::new(HashMap::new()),
            notes: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            next_task_id: AtomicU64::new(0),
            event_tx: None,
        })
    }

    /// Create a registry that emits a [`MarketEvent`] after every state change
    pub fn with_events(
        config: MarketConfig,
        transport: Arc<dyn SettlementTransport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MarketEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = Self::new(config, transport)?;
        registry.event_tx = Some(tx);
        Ok((registry, rx))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn escrow(&self) -> &EscrowLedger {
        &self.escrow
    }

    pub fn reputation(&self) -> &ReputationEngine {
        &self.reputation
    }

    pub fn arbiter(&self) -> &DisputeArbiter {
        &self.arbiter
    }

    // ---- lifecycle operations ----

    /// Create a task and lock its reward in escrow.
    ///
    /// The task is only stored once the deposit has succeeded.
    pub async fn create_task(
        &self,
        creator: AgentId,
        title: &str,
        description: &str,
        reward: TokenAmount,
        deadline_days: u32,
    ) -> Result<TaskId> {
        let start = Instant::now();

        if reward == 0 {
            return Err(MarketError::InvalidInput(
                "reward must be positive".to_string(),
            ));
        }
        if deadline_days == 0 {
            return Err(MarketError::InvalidInput(
                "deadline must be at least one day".to_string(),
            ));
        }
        let title = required_text("title", title, self.config.max_title_len)?;
        if description.len() > self.config.max_description_len {
            return Err(MarketError::InvalidInput(format!(
                "description exceeds {} bytes",
                self.config.max_description_len
            )));
        }

        let _creating = self.creation.lock().await;
        let task_id = self.next_task_id.load(Ordering::SeqCst);
        let now = self.clock.now();

        self.escrow
            .lock(task_id, creator, reward, now)
            .await
            .map_err(|e| MarketError::escrow_failure(task_id, e))?;

        let task = Task {
            id: task_id,
            creator,
            runner: None,
            title,
            description: description.to_string(),
            reward,
            deadline: now + Duration::days(i64::from(deadline_days)),
            status: TaskStatus::Open,
            deliverables: String::new(),
            accepted_bid: None,
            created_at: now,
            submitted_at: None,
            completed_at: None,
        };
        self.tasks.write().await.insert(task_id, task);
        self.next_task_id.store(task_id + 1, Ordering::SeqCst);

        self.reputation.record_creator_activity(creator).await;

        info!(
            task_id,
            creator = %creator.short(),
            reward,
            deadline_days,
            duration_ms = start.elapsed().as_millis() as u64,
            "📝 Task created"
        );
        self.emit(
            task_id,
            TaskStatus::Open,
            MarketEventKind::TaskCreated { creator, reward },
        );

        Ok(task_id)
    }

    /// Bid on an open task. Resubmitting replaces the bidder's proposal.
    pub async fn submit_bid(
        &self,
        task_id: TaskId,
        bidder: AgentId,
        proposal: &str,
    ) -> Result<BidIndex> {
        let proposal = required_text("proposal", proposal, self.config.max_text_len)?;
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let task = self.load(task_id).await?;
        require_status(&task, &[TaskStatus::Open])?;
        if bidder == task.creator {
            return Err(MarketError::invalid_state(
                task_id,
                "bidder other than creator",
                "creator",
            ));
        }

        let index = self
            .bids
            .add(task_id, bidder, proposal, self.clock.now())
            .await?;
        self.reputation.ensure_agent(bidder).await;

        info!(task_id, bidder = %bidder.short(), index, "🙋 Bid submitted");
        self.emit(
            task_id,
            task.status,
            MarketEventKind::BidSubmitted { bidder, index },
        );

        Ok(index)
    }

    /// Accept one bid; the bidder becomes the runner.
    pub async fn accept_bid(&self, task_id: TaskId, caller: AgentId, bid_index: BidIndex) -> Result<()> {
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        require_status(&task, &[TaskStatus::Open])?;
        require_creator(&task, &caller)?;
        self.check_deadline(&task)?;

        let bid = self.bids.get(task_id, bid_index).await?;
        advance(&mut task, TaskStatus::InProgress)?;
        task.runner = Some(bid.bidder);
        task.accepted_bid = Some(bid_index);
        self.store(task).await;
        // Remaining bids stay readable but can no longer be accepted or replaced
        self.bids.seal(task_id).await;

        info!(
            task_id,
            runner = %bid.bidder.short(),
            index = bid_index,
            "🤝 Bid accepted"
        );
        self.emit(
            task_id,
            TaskStatus::InProgress,
            MarketEventKind::BidAccepted {
                runner: bid.bidder,
                index: bid_index,
            },
        );

        Ok(())
    }

    pub async fn submit_work(&self, task_id: TaskId, caller: AgentId, deliverables: &str) -> Result<()> {
        let deliverables = required_text("deliverables", deliverables, self.config.max_text_len)?;
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        require_status(&task, &[TaskStatus::InProgress])?;
        if task.runner != Some(caller) {
            return Err(MarketError::invalid_state(
                task_id,
                "caller is runner",
                format!("caller {}", caller.short()),
            ));
        }
        self.check_deadline(&task)?;

        advance(&mut task, TaskStatus::Submitted)?;
        task.deliverables = deliverables;
        task.submitted_at = Some(self.clock.now());
        let early = task.finished_early();
        self.store(task).await;

        info!(task_id, runner = %caller.short(), early, "📦 Work submitted");
        self.emit(
            task_id,
            TaskStatus::Submitted,
            MarketEventKind::WorkSubmitted { runner: caller },
        );

        Ok(())
    }

    /// Approve submitted work: pay the runner and record the rating.
    ///
    /// On a settlement failure the task stays `Submitted` and the call can be
    /// retried.
    pub async fn complete_task(&self, task_id: TaskId, caller: AgentId, rating: u8) -> Result<()> {
        let rating = Rating::new(rating)?;
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        require_status(&task, &[TaskStatus::Submitted])?;
        require_creator(&task, &caller)?;

        self.pay_runner(&mut task, rating).await?;
        Ok(())
    }

    /// Cancel an `Open` or `InProgress` task and refund the creator.
    pub async fn cancel_task(&self, task_id: TaskId, caller: AgentId, reason: &str) -> Result<()> {
        if reason.len() > self.config.max_text_len {
            return Err(MarketError::InvalidInput(format!(
                "reason exceeds {} bytes",
                self.config.max_text_len
            )));
        }
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        require_status(&task, &[TaskStatus::Open, TaskStatus::InProgress])?;
        require_creator(&task, &caller)?;

        let previous = task.status;
        self.refund_creator(&mut task).await?;

        let reason = reason.trim();
        if !reason.is_empty() {
            self.add_note(task_id, Some(caller), format!("cancelled: {reason}"))
                .await;
        }

        if previous == TaskStatus::InProgress {
            let runner = task
                .runner
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            self.add_note(
                task_id,
                Some(caller),
                format!("cancelled while in progress with runner {runner}"),
            )
            .await;

            if let InProgressCancelPolicy::PenalizeCreator { points } = self.config.in_progress_cancel {
                self.reputation
                    .record_penalty(task.creator, points, "in-progress cancellation")
                    .await;
            }
        }

        Ok(())
    }

    /// Open a dispute over submitted work.
    pub async fn raise_dispute(&self, task_id: TaskId, caller: AgentId, reason: &str) -> Result<DisputeId> {
        let reason = required_text("reason", reason, self.config.max_text_len)?;
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        if task.status == TaskStatus::Disputed || self.arbiter.has_open_case(task_id).await {
            return Err(MarketError::DuplicateDispute(task_id));
        }
        require_status(&task, &[TaskStatus::Submitted])?;
        if !task.is_participant(&caller) {
            return Err(MarketError::invalid_state(
                task_id,
                "creator or runner",
                format!("caller {}", caller.short()),
            ));
        }
        // Without a council able to reach quorum the escrow could never leave Disputed
        if self.config.council.len() < self.config.quorum {
            return Err(MarketError::invalid_state(
                task_id,
                format!("council of at least {} members", self.config.quorum),
                format!("council of {}", self.config.council.len()),
            ));
        }

        let dispute_id = self
            .arbiter
            .raise(task_id, caller, reason, self.clock.now())
            .await?;
        advance(&mut task, TaskStatus::Disputed)?;
        self.store(task).await;

        self.emit(
            task_id,
            TaskStatus::Disputed,
            MarketEventKind::DisputeRaised {
                dispute_id,
                raised_by: caller,
            },
        );

        Ok(dispute_id)
    }

    /// Record a council vote. Returns `true` when this vote resolved the dispute.
    ///
    /// A binding verdict is carried out immediately: `FavorRunner` pays the
    /// runner with the configured dispute rating, `FavorCreator` refunds the
    /// creator. If that settlement fails the vote is withdrawn so the same
    /// member can retry.
    pub async fn cast_vote(&self, task_id: TaskId, member: AgentId, verdict: Verdict) -> Result<bool> {
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        if task.status != TaskStatus::Disputed {
            let actual = if self.arbiter.get_case(task_id).await.is_some() {
                format!("{} (dispute already resolved)", task.status)
            } else {
                task.status.to_string()
            };
            return Err(MarketError::invalid_state(task_id, "Disputed", actual));
        }

        let now = self.clock.now();
        let outcome = self.arbiter.cast_vote(task_id, member, verdict, now).await?;

        let decided = match outcome {
            VoteOutcome::Pending {
                for_runner,
                for_creator,
            } => {
                debug!(task_id, for_runner, for_creator, "Dispute still open");
                self.emit(
                    task_id,
                    TaskStatus::Disputed,
                    MarketEventKind::VoteCast { member, verdict },
                );
                return Ok(false);
            }
            VoteOutcome::Decided(decided) => decided,
        };

        let carried_out = match decided {
            Verdict::FavorRunner => match self.config.dispute_rating() {
                Ok(rating) => self.pay_runner(&mut task, rating).await.map(|_| ()),
                Err(e) => Err(e),
            },
            Verdict::FavorCreator => self.refund_creator(&mut task).await.map(|_| ()),
        };
        if let Err(e) = carried_out {
            self.arbiter.retract_vote(task_id, &member).await;
            warn!(task_id, verdict = ?decided, error = %e, "Verdict not carried out, vote withdrawn");
            return Err(e);
        }

        self.arbiter.finalize(task_id, self.clock.now()).await?;
        self.add_note(task_id, None, format!("dispute resolved: {decided:?}"))
            .await;
        self.emit(
            task_id,
            TaskStatus::Disputed,
            MarketEventKind::VoteCast { member, verdict },
        );
        self.emit(
            task_id,
            task.status,
            MarketEventKind::DisputeResolved { verdict: decided },
        );

        Ok(true)
    }

    /// Forget a terminal task together with its bids, archived dispute,
    /// settled escrow account and notes.
    pub async fn purge_task(&self, task_id: TaskId) -> Result<()> {
        let lock = self.task_lock(task_id).await?;
        let _guard = lock.lock().await;

        let task = self.load(task_id).await?;
        if !task.status.is_terminal() {
            return Err(MarketError::invalid_state(
                task_id,
                "Completed|Cancelled",
                task.status.to_string(),
            ));
        }

        self.escrow.remove_settled(task_id).await?;
        self.bids.purge(task_id).await;
        self.arbiter.purge(task_id).await;
        self.notes.write().await.remove(&task_id);
        self.tasks.write().await.remove(&task_id);
        self.task_locks.write().await.remove(&task_id);

        debug!(task_id, status = %task.status, "Task purged");
        Ok(())
    }

    // ---- queries ----

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.load(task_id).await
    }

    /// Number of tasks ever created
    pub fn get_task_count(&self) -> u64 {
        self.next_task_id.load(Ordering::SeqCst)
    }

    pub async fn list_bids(&self, task_id: TaskId) -> Result<BidList> {
        self.ensure_task(task_id).await?;
        Ok(self.bids.list(task_id).await)
    }

    pub async fn get_bid(&self, task_id: TaskId, index: BidIndex) -> Result<Bid> {
        self.ensure_task(task_id).await?;
        self.bids.get(task_id, index).await
    }

    pub async fn get_stats(&self, agent: &AgentId) -> Result<AgentStats> {
        self.reputation.get_stats(agent).await
    }

    pub async fn get_badges(&self, agent: &AgentId) -> Result<BTreeSet<Badge>> {
        self.reputation.get_badges(agent).await
    }

    pub async fn get_dispute(&self, task_id: TaskId) -> Option<DisputeCase> {
        self.arbiter.get_case(task_id).await
    }

    /// Deadline check against the registry clock; never changes state
    pub async fn is_expired(&self, task_id: TaskId) -> Result<bool> {
        let task = self.load(task_id).await?;
        Ok(task.is_expired(self.clock.now()))
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();

        match query.sort {
            TaskSort::Newest => tasks.sort_by(|a, b| b.id.cmp(&a.id)),
            TaskSort::Reward => tasks.sort_by(|a, b| b.reward.cmp(&a.reward).then(b.id.cmp(&a.id))),
        }
        if let Some(limit) = query.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    pub async fn tasks_created_by(&self, agent: &AgentId) -> Vec<Task> {
        self.collect_sorted(|t| t.creator == *agent).await
    }

    pub async fn tasks_run_by(&self, agent: &AgentId) -> Vec<Task> {
        self.collect_sorted(|t| t.runner.as_ref() == Some(agent)).await
    }

    pub async fn audit_notes(&self, task_id: TaskId) -> Vec<AuditNote> {
        self.notes
            .read()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn market_stats(&self) -> MarketStats {
        let mut stats = MarketStats::default();
        for task in self.tasks.read().await.values() {
            stats.total_tasks += 1;
            match task.status {
                TaskStatus::Open => stats.open_tasks += 1,
                TaskStatus::InProgress => stats.in_progress_tasks += 1,
                TaskStatus::Submitted => stats.submitted_tasks += 1,
                TaskStatus::Disputed => stats.disputed_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Cancelled => stats.cancelled_tasks += 1,
            }
        }
        stats.total_locked = self.escrow.total_locked().await;
        stats.total_paid_out = self.escrow.total_released().await;
        stats.total_refunded = self.escrow.total_refunded().await;
        stats
    }

    // ---- internals ----

    /// Release escrow to the runner, then mark the task completed and
    /// update reputation. Nothing changes if the release fails.
    async fn pay_runner(&self, task: &mut Task, rating: Rating) -> Result<SettlementReceipt> {
        let start = Instant::now();
        let runner = task.runner.ok_or_else(|| {
            MarketError::invalid_state(task.id, "runner assigned", "no runner")
        })?;
        if !task.status.can_transition_to(&TaskStatus::Completed) {
            return Err(MarketError::invalid_state(
                task.id,
                "Submitted|Disputed",
                task.status.to_string(),
            ));
        }

        let receipt = self
            .escrow
            .release(task.id, runner)
            .await
            .map_err(|e| MarketError::escrow_failure(task.id, e))?;

        let on_time = task.finished_early();
        advance(task, TaskStatus::Completed)?;
        task.completed_at = Some(self.clock.now());
        self.store(task.clone()).await;
        self.bids.seal(task.id).await;

        self.reputation.record_completion(runner, rating, on_time).await;
        self.reputation.record_earnings(runner, receipt.amount).await;

        info!(
            task_id = task.id,
            runner = %runner.short(),
            amount = receipt.amount,
            rating = rating.stars(),
            on_time,
            duration_ms = start.elapsed().as_millis() as u64,
            "✅ Task completed"
        );
        self.emit(
            task.id,
            TaskStatus::Completed,
            MarketEventKind::TaskCompleted {
                runner,
                amount: receipt.amount,
                rating: rating.stars(),
            },
        );

        Ok(receipt)
    }

    /// Refund escrow to the creator, then mark the task cancelled.
    async fn refund_creator(&self, task: &mut Task) -> Result<SettlementReceipt> {
        let start = Instant::now();
        if !task.status.can_transition_to(&TaskStatus::Cancelled) {
            return Err(MarketError::invalid_state(
                task.id,
                "Open|InProgress|Disputed",
                task.status.to_string(),
            ));
        }

        let receipt = self
            .escrow
            .refund(task.id)
            .await
            .map_err(|e| MarketError::escrow_failure(task.id, e))?;

        advance(task, TaskStatus::Cancelled)?;
        task.completed_at = Some(self.clock.now());
        self.store(task.clone()).await;
        self.bids.seal(task.id).await;

        info!(
            task_id = task.id,
            creator = %task.creator.short(),
            refunded = receipt.amount,
            duration_ms = start.elapsed().as_millis() as u64,
            "↩️ Task cancelled, escrow refunded"
        );
        self.emit(
            task.id,
            TaskStatus::Cancelled,
            MarketEventKind::TaskCancelled {
                refunded: receipt.amount,
            },
        );

        Ok(receipt)
    }

    fn check_deadline(&self, task: &Task) -> Result<()> {
        if self.config.reject_after_deadline && task.is_expired(self.clock.now()) {
            return Err(MarketError::invalid_state(
                task.id,
                "before deadline",
                format!("expired at {}", task.deadline),
            ));
        }
        Ok(())
    }

    async fn task_lock(&self, task_id: TaskId) -> Result<Arc<Mutex<()>>> {
        self.ensure_task(task_id).await?;
        if let Some(lock) = self.task_locks.read().await.get(&task_id) {
            return Ok(lock.clone());
        }
        self.insert_task_lock(task_id).await
    }

    /// Re-checks the task under the lock table's write guard so a concurrent
    /// purge cannot leave an orphaned entry behind.
    async fn insert_task_lock(&self, task_id: TaskId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.task_locks.write().await;
        if !self.tasks.read().await.contains_key(&task_id) {
            return Err(not_found(task_id));
        }
        Ok(locks.entry(task_id).or_default().clone())
    }

    async fn ensure_task(&self, task_id: TaskId) -> Result<()> {
        if self.tasks.read().await.contains_key(&task_id) {
            Ok(())
        } else {
            Err(not_found(task_id))
        }
    }

    async fn load(&self, task_id: TaskId) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or_else(|| not_found(task_id))
    }

    async fn store(&self, task: Task) {
        self.tasks.write().await.insert(task.id, task);
    }

    async fn collect_sorted(&self, pred: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| pred(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    async fn add_note(&self, task_id: TaskId, author: Option<AgentId>, note: String) {
        debug!(task_id, note = %note, "Audit note recorded");
        self.notes
            .write()
            .await
            .entry(task_id)
            .or_default()
            .push(AuditNote {
                task_id,
                author,
                note,
                recorded_at: self.clock.now(),
            });
    }

    fn emit(&self, task_id: TaskId, status: TaskStatus, kind: MarketEventKind) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        let name = kind.name();
        let event = MarketEvent {
            task_id,
            status,
            kind,
            timestamp: self.clock.now(),
        };
        if let Err(e) = tx.send(event) {
            warn!(task_id, event = name, error = %e, "Failed to emit market event");
        }
    }
}

fn not_found(task_id: TaskId) -> MarketError {
    MarketError::NotFound(format!("task {task_id}"))
}

fn required_text(field: &str, value: &str, max_len: usize) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(MarketError::InvalidInput(format!("{field} must not be empty")));
    }
    if value.len() > max_len {
        return Err(MarketError::InvalidInput(format!(
            "{field} exceeds {max_len} bytes"
        )));
    }
    Ok(value.to_string())
}

fn require_status(task: &Task, allowed: &[TaskStatus]) -> Result<()> {
    if allowed.contains(&task.status) {
        return Ok(());
    }
    let expected = allowed
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("|");
    Err(MarketError::invalid_state(
        task.id,
        expected,
        task.status.to_string(),
    ))
}

fn require_creator(task: &Task, caller: &AgentId) -> Result<()> {
    if task.creator == *caller {
        Ok(())
    } else {
        Err(MarketError::invalid_state(
            task.id,
            "caller is creator",
            format!("caller {}", caller.short()),
        ))
    }
}

fn advance(task: &mut Task, next: TaskStatus) -> Result<()> {
    if !task.status.can_transition_to(&next) {
        return Err(MarketError::invalid_state(
            task.id,
            next.to_string(),
            task.status.to_string(),
        ));
    }
    task.status = next;
    Ok(())
}
