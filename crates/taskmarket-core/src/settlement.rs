//! Settlement transport seam.
//!
//! The escrow ledger decides *that* funds move and how much; a
//! [`SettlementTransport`] performs the transfer on the settlement ledger
//! and reports back. Transports must be idempotent per
//! `(task_id, direction)` so a retried instruction never pays twice.

use crate::types::{AgentId, TaskId, TokenAmount};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementDirection {
    /// Creator funds the escrow
    Deposit,
    /// Escrow pays the runner
    Release,
    /// Escrow returns funds to the creator
    Refund,
}

/// Instruction handed to the transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub task_id: TaskId,
    pub direction: SettlementDirection,
    pub amount: TokenAmount,
    /// Payer for deposits, recipient for releases and refunds
    pub counterparty: AgentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub task_id: TaskId,
    pub direction: SettlementDirection,
    pub amount: TokenAmount,
    pub reference: String,
    pub settled_at: DateTime<Utc>,
}

/// Opaque references passed through to the settlement ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementTarget {
    pub endpoint: String,
    pub token_contract: String,
    pub escrow_contract: String,
    pub network: String,
}

#[async_trait]
pub trait SettlementTransport: Send + Sync {
    /// Execute an instruction. Must be idempotent per `(task_id, direction)`.
    async fn execute(&self, instruction: &SettlementInstruction) -> anyhow::Result<SettlementReceipt>;
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<AgentId, TokenAmount>,
    escrow_pool: TokenAmount,
    applied: HashMap<(TaskId, SettlementDirection), SettlementReceipt>,
    sequence: u64,
}

/// In-process balance ledger implementing [`SettlementTransport`].
pub struct InMemoryTransport {
    target: SettlementTarget,
    state: RwLock<LedgerState>,
    fail_next: AtomicU32,
}

impl InMemoryTransport {
    pub fn new(target: SettlementTarget) -> Self {
        Self {
            target,
            state: RwLock::new(LedgerState::default()),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn target(&self) -> &SettlementTarget {
        &self.target
    }

    /// Credit an account (faucet / test funding)
    pub async fn credit(&self, account: AgentId, amount: TokenAmount) {
        let mut state = self.state.write().await;
        let balance = state.balances.entry(account).or_default();
        *balance = balance.saturating_add(amount);
        debug!(account = %account, amount, balance = *balance, "Account credited");
    }

    pub async fn balance_of(&self, account: &AgentId) -> TokenAmount {
        self.state
            .read()
            .await
            .balances
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    /// Funds currently held by the escrow side of the ledger
    pub async fn escrow_balance(&self) -> TokenAmount {
        self.state.read().await.escrow_pool
    }

    /// Number of distinct instructions applied (retries excluded)
    pub async fn applied_count(&self) -> usize {
        self.state.read().await.applied.len()
    }

    /// Make the next `count` instructions fail before touching balances.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SettlementTransport for InMemoryTransport {
    async fn execute(&self, instruction: &SettlementInstruction) -> anyhow::Result<SettlementReceipt> {
        if self.take_injected_failure() {
            warn!(
                task_id = instruction.task_id,
                direction = ?instruction.direction,
                endpoint = %self.target.endpoint,
                "Injected settlement failure"
            );
            bail!("settlement endpoint unavailable");
        }

        let mut state = self.state.write().await;
        let key = (instruction.task_id, instruction.direction);
        if let Some(receipt) = state.applied.get(&key) {
            debug!(
                task_id = instruction.task_id,
                direction = ?instruction.direction,
                reference = %receipt.reference,
                "Instruction already applied, returning prior receipt"
            );
            return Ok(receipt.clone());
        }

        match instruction.direction {
            SettlementDirection::Deposit => {
                let available = state
                    .balances
                    .get(&instruction.counterparty)
                    .copied()
                    .unwrap_or(0);
                if available < instruction.amount {
                    bail!(
                        "insufficient balance for {}: needed {}, available {}",
                        instruction.counterparty,
                        instruction.amount,
                        available
                    );
                }
                state
                    .balances
                    .insert(instruction.counterparty, available - instruction.amount);
                state.escrow_pool = state
                    .escrow_pool
                    .checked_add(instruction.amount)
                    .ok_or_else(|| anyhow!("escrow pool overflow"))?;
            }
            SettlementDirection::Release | SettlementDirection::Refund => {
                state.escrow_pool = state
                    .escrow_pool
                    .checked_sub(instruction.amount)
                    .ok_or_else(|| anyhow!("escrow pool underflow"))?;
                let balance = state.balances.entry(instruction.counterparty).or_default();
                *balance = balance.saturating_add(instruction.amount);
            }
        }

        state.sequence += 1;
        let receipt = SettlementReceipt {
            task_id: instruction.task_id,
            direction: instruction.direction,
            amount: instruction.amount,
            reference: format!("mem-{}-{:?}-{}", instruction.task_id, instruction.direction, state.sequence)
                .to_lowercase(),
            settled_at: Utc::now(),
        };
        state.applied.insert(key, receipt.clone());

        info!(
            task_id = instruction.task_id,
            direction = ?instruction.direction,
            amount = instruction.amount,
            counterparty = %instruction.counterparty,
            token = %self.target.token_contract,
            reference = %receipt.reference,
            "💸 Settlement applied"
        );

        Ok(receipt)
    }
}
