use crate::settlement::{
    SettlementDirection, SettlementInstruction, SettlementReceipt, SettlementTransport,
};
use crate::types::{AgentId, Disposition, LifecycleState, TaskId, TokenAmount};
use crate::{MarketError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Per-task escrow account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub task_id: TaskId,
    pub depositor: AgentId,
    pub amount: TokenAmount,
    pub disposition: Disposition,
    pub locked_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Set while a release/refund is with the transport
    #[serde(skip)]
    settling: bool,
}

impl EscrowAccount {
    pub fn is_settling(&self) -> bool {
        self.settling
    }
}

/// Escrow ledger: one account per task, one-shot disposition.
///
/// State changes are applied optimistically before the transport call and
/// reverted to `Locked` if the transport reports failure.
pub struct EscrowLedger {
    transport: Arc<dyn SettlementTransport>,
    accounts: Arc<RwLock<HashMap<TaskId, EscrowAccount>>>,
}

impl EscrowLedger {
    pub fn new(transport: Arc<dyn SettlementTransport>) -> Self {
        Self {
            transport,
            accounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Lock `amount` from `depositor` for `task_id`, stamped with `now`.
    ///
    /// The account is reserved before the deposit is sent so a concurrent
    /// lock for the same task sees `DuplicateEscrow`; it is removed again if
    /// the deposit fails.
    pub async fn lock(
        &self,
        task_id: TaskId,
        depositor: AgentId,
        amount: TokenAmount,
        now: DateTime<Utc>,
    ) -> Result<SettlementReceipt> {
        let start = std::time::Instant::now();
        if amount == 0 {
            return Err(MarketError::InvalidInput(
                "escrow amount must be positive".to_string(),
            ));
        }

        {
            let mut accounts = self.accounts.write().await;
            if accounts.contains_key(&task_id) {
                return Err(MarketError::DuplicateEscrow(task_id));
            }
            accounts.insert(
                task_id,
                EscrowAccount {
                    task_id,
                    depositor,
                    amount,
                    disposition: Disposition::Locked,
                    locked_at: now,
                    settled_at: None,
                    settling: true,
                },
            );
        }

        let instruction = SettlementInstruction {
            task_id,
            direction: SettlementDirection::Deposit,
            amount,
            counterparty: depositor,
        };

        match self.transport.execute(&instruction).await {
            Ok(receipt) => {
                if let Some(account) = self.accounts.write().await.get_mut(&task_id) {
                    account.settling = false;
                }
                info!(
                    task_id,
                    depositor = %depositor.short(),
                    amount,
                    reference = %receipt.reference,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "💰 Escrow locked"
                );
                Ok(receipt)
            }
            Err(e) => {
                self.accounts.write().await.remove(&task_id);
                warn!(task_id, amount, error = %e, "Escrow deposit failed, account discarded");
                Err(MarketError::SettlementFailed {
                    task_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Pay the full locked amount to `recipient`.
    pub async fn release(&self, task_id: TaskId, recipient: AgentId) -> Result<SettlementReceipt> {
        self.settle(task_id, Disposition::Released, Some(recipient))
            .await
    }

    /// Return the full locked amount to the depositor.
    pub async fn refund(&self, task_id: TaskId) -> Result<SettlementReceipt> {
        self.settle(task_id, Disposition::Refunded, None).await
    }

    async fn settle(
        &self,
        task_id: TaskId,
        target: Disposition,
        recipient: Option<AgentId>,
    ) -> Result<SettlementReceipt> {
        let start = std::time::Instant::now();

        let instruction = {
            let mut accounts = self.accounts.write().await;
            let account = accounts
                .get_mut(&task_id)
                .ok_or_else(|| MarketError::NotFound(format!("escrow for task {task_id}")))?;

            if account.settling {
                return Err(MarketError::SettlementInFlight(task_id));
            }
            if !account.disposition.can_transition_to(&target) {
                return Err(MarketError::AlreadySettled {
                    task_id,
                    disposition: account.disposition,
                });
            }

            // Optimistic update, reverted below on transport failure
            account.disposition = target;
            account.settling = true;

            let (direction, counterparty) = match target {
                Disposition::Released => (
                    SettlementDirection::Release,
                    recipient.unwrap_or(account.depositor),
                ),
                _ => (SettlementDirection::Refund, account.depositor),
            };

            SettlementInstruction {
                task_id,
                direction,
                amount: account.amount,
                counterparty,
            }
        };

        debug!(
            task_id,
            direction = ?instruction.direction,
            amount = instruction.amount,
            "Settlement instruction issued"
        );

        let outcome = self.transport.execute(&instruction).await;

        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(&task_id)
            .ok_or_else(|| MarketError::NotFound(format!("escrow for task {task_id}")))?;
        account.settling = false;

        match outcome {
            Ok(receipt) => {
                account.settled_at = Some(receipt.settled_at);
                info!(
                    task_id,
                    disposition = ?target,
                    to = %instruction.counterparty.short(),
                    amount = instruction.amount,
                    reference = %receipt.reference,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "🔓 Escrow settled"
                );
                Ok(receipt)
            }
            Err(e) => {
                account.disposition = Disposition::Locked;
                warn!(
                    task_id,
                    attempted = ?target,
                    error = %e,
                    "🔄 Settlement failed, escrow reverted to Locked"
                );
                Err(MarketError::SettlementFailed {
                    task_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Get account snapshot
    pub async fn get_account(&self, task_id: TaskId) -> Option<EscrowAccount> {
        self.accounts.read().await.get(&task_id).cloned()
    }

    /// Sum of all amounts still locked (including in-flight settlements).
    pub async fn total_locked(&self) -> TokenAmount {
        self.sum_where(|a| a.disposition == Disposition::Locked || a.settling)
            .await
    }

    pub async fn total_released(&self) -> TokenAmount {
        self.sum_where(|a| a.disposition == Disposition::Released && !a.settling)
            .await
    }

    pub async fn total_refunded(&self) -> TokenAmount {
        self.sum_where(|a| a.disposition == Disposition::Refunded && !a.settling)
            .await
    }

    async fn sum_where(&self, pred: impl Fn(&EscrowAccount) -> bool) -> TokenAmount {
        self.accounts
            .read()
            .await
            .values()
            .filter(|a| pred(a))
            .map(|a| a.amount)
            .sum()
    }

    /// Drop a settled account from tracking.
    pub async fn remove_settled(&self, task_id: TaskId) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        match accounts.get(&task_id) {
            None => Err(MarketError::NotFound(format!("escrow for task {task_id}"))),
            Some(a) if !a.disposition.is_terminal() || a.settling => {
                Err(MarketError::invalid_state(
                    task_id,
                    "settled escrow",
                    format!("{:?}", a.disposition),
                ))
            }
            Some(_) => {
                accounts.remove(&task_id);
                debug!(task_id, "Escrow account removed from tracking");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::{InMemoryTransport, SettlementTarget};
    use async_trait::async_trait;
    use std::time::Duration;

    fn agent(b: u8) -> AgentId {
        AgentId::from_bytes([b; 20])
    }

    async fn funded_ledger(owner: AgentId, amount: TokenAmount) -> (Arc<InMemoryTransport>, EscrowLedger) {
        let transport = Arc::new(InMemoryTransport::new(SettlementTarget::default()));
        transport.credit(owner, amount).await;
        let ledger = EscrowLedger::new(transport.clone());
        (transport, ledger)
    }

    #[tokio::test]
    async fn test_escrow_lifecycle() {
        let owner = agent(1);
        let recipient = agent(2);
        let (transport, ledger) = funded_ledger(owner, 100).await;

        ledger.lock(1, owner, 60, Utc::now()).await.unwrap();
        assert_eq!(ledger.total_locked().await, 60);
        assert_eq!(transport.balance_of(&owner).await, 40);

        ledger.release(1, recipient).await.unwrap();
        assert_eq!(transport.balance_of(&recipient).await, 60);
        assert_eq!(ledger.total_locked().await, 0);
        assert_eq!(ledger.total_released().await, 60);

        let account = ledger.get_account(1).await.unwrap();
        assert_eq!(account.disposition, Disposition::Released);
        assert!(account.settled_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_lock_rejected() {
        let owner = agent(3);
        let (_, ledger) = funded_ledger(owner, 100).await;

        ledger.lock(1, owner, 10, Utc::now()).await.unwrap();
        let err = ledger.lock(1, owner, 10, Utc::now()).await.unwrap_err();
        assert!(matches!(err, MarketError::DuplicateEscrow(1)));
    }

    #[tokio::test]
    async fn test_double_settlement_rejected() {
        let owner = agent(4);
        let (transport, ledger) = funded_ledger(owner, 100).await;

        ledger.lock(9, owner, 50, Utc::now()).await.unwrap();
        ledger.refund(9).await.unwrap();
        assert_eq!(transport.balance_of(&owner).await, 100);

        let err = ledger.refund(9).await.unwrap_err();
        assert!(matches!(
            err,
            MarketError::AlreadySettled {
                disposition: Disposition::Refunded,
                ..
            }
        ));
        let err = ledger.release(9, agent(5)).await.unwrap_err();
        assert!(matches!(err, MarketError::AlreadySettled { .. }));
        assert_eq!(transport.balance_of(&agent(5)).await, 0);
    }

    #[tokio::test]
    async fn test_failed_settlement_reverts_to_locked() {
        let owner = agent(6);
        let runner = agent(7);
        let (transport, ledger) = funded_ledger(owner, 100).await;

        ledger.lock(2, owner, 80, Utc::now()).await.unwrap();
        transport.fail_next(1);

        let err = ledger.release(2, runner).await.unwrap_err();
        assert!(matches!(err, MarketError::SettlementFailed { task_id: 2, .. }));

        let account = ledger.get_account(2).await.unwrap();
        assert_eq!(account.disposition, Disposition::Locked);
        assert!(!account.is_settling());
        assert_eq!(ledger.total_locked().await, 80);

        // Retry succeeds and pays exactly once
        ledger.release(2, runner).await.unwrap();
        assert_eq!(transport.balance_of(&runner).await, 80);
    }

    #[tokio::test]
    async fn test_failed_deposit_leaves_no_account() {
        let owner = agent(8);
        let (transport, ledger) = funded_ledger(owner, 10).await;

        let err = ledger.lock(3, owner, 50, Utc::now()).await.unwrap_err();
        assert!(matches!(err, MarketError::SettlementFailed { .. }));
        assert!(ledger.get_account(3).await.is_none());
        assert_eq!(transport.balance_of(&owner).await, 10);

        // The id is free to lock again once funded
        transport.credit(owner, 40).await;
        ledger.lock(3, owner, 50, Utc::now()).await.unwrap();
    }

    /// Delays releases so a second settlement can overlap the first
    struct SlowReleaseTransport {
        inner: InMemoryTransport,
        delay: Duration,
    }

    #[async_trait]
    impl SettlementTransport for SlowReleaseTransport {
        async fn execute(&self, instruction: &SettlementInstruction) -> anyhow::Result<SettlementReceipt> {
            if instruction.direction == SettlementDirection::Release {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.execute(instruction).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_settlement_rejected_while_in_flight() {
        let owner = agent(11);
        let runner = agent(12);
        let transport = Arc::new(SlowReleaseTransport {
            inner: InMemoryTransport::new(SettlementTarget::default()),
            delay: Duration::from_millis(100),
        });
        transport.inner.credit(owner, 100).await;
        let ledger = Arc::new(EscrowLedger::new(transport.clone()));
        ledger.lock(1, owner, 100, Utc::now()).await.unwrap();

        let releasing = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.release(1, runner).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(ledger.get_account(1).await.unwrap().is_settling());
        let err = ledger.refund(1).await.unwrap_err();
        assert!(matches!(err, MarketError::SettlementInFlight(1)));
        // Still counted as locked while the release is outstanding
        assert_eq!(ledger.total_locked().await, 100);

        releasing.await.unwrap().unwrap();
        let account = ledger.get_account(1).await.unwrap();
        assert_eq!(account.disposition, Disposition::Released);
        assert!(!account.is_settling());
        assert_eq!(transport.inner.balance_of(&runner).await, 100);
        assert_eq!(transport.inner.balance_of(&owner).await, 0);
    }

    #[tokio::test]
    async fn test_lock_uses_supplied_timestamp() {
        let owner = agent(13);
        let (_, ledger) = funded_ledger(owner, 10).await;
        let at = Utc::now() - chrono::Duration::days(30);
        ledger.lock(5, owner, 10, at).await.unwrap();
        assert_eq!(ledger.get_account(5).await.unwrap().locked_at, at);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (_, ledger) = funded_ledger(agent(9), 0).await;
        assert!(matches!(
            ledger.refund(42).await.unwrap_err(),
            MarketError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_settled_only() {
        let owner = agent(10);
        let (_, ledger) = funded_ledger(owner, 100).await;
        ledger.lock(4, owner, 10, Utc::now()).await.unwrap();

        assert!(ledger.remove_settled(4).await.is_err());
        ledger.refund(4).await.unwrap();
        ledger.remove_settled(4).await.unwrap();
        assert!(ledger.get_account(4).await.is_none());
    }
}
