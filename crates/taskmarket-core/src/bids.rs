use crate::types::{AgentId, Bid, BidIndex, TaskId};
use crate::{MarketError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct TaskBids {
    bids: Vec<Bid>,
    sealed: bool,
}

/// Snapshot of a task's bids in submission order.
///
/// Cheap to clone; every call to [`BidList::iter`] restarts from the first bid.
#[derive(Debug, Clone, Default)]
pub struct BidList {
    bids: Arc<[Bid]>,
}

impl BidList {
    pub fn iter(&self) -> std::slice::Iter<'_, Bid> {
        self.bids.iter()
    }

    pub fn len(&self) -> usize {
        self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    pub fn get(&self, index: BidIndex) -> Option<&Bid> {
        self.bids.get(index as usize)
    }
}

impl<'a> IntoIterator for &'a BidList {
    type Item = &'a Bid;
    type IntoIter = std::slice::Iter<'a, Bid>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Per-task ordered bid collections, keyed by task id.
pub struct BidBook {
    books: Arc<RwLock<HashMap<TaskId, TaskBids>>>,
}

impl Default for BidBook {
    fn default() -> Self {
        Self::new()
    }
}

impl BidBook {
    pub fn new() -> Self {
        Self {
            books: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add or replace `bidder`'s bid. A resubmission keeps its original index.
    pub async fn add(
        &self,
        task_id: TaskId,
        bidder: AgentId,
        proposal: String,
        now: DateTime<Utc>,
    ) -> Result<BidIndex> {
        let mut books = self.books.write().await;
        let book = books.entry(task_id).or_default();

        if book.sealed {
            return Err(MarketError::invalid_state(
                task_id,
                "bid book open",
                "bid book sealed",
            ));
        }

        if let Some(existing) = book.bids.iter_mut().find(|b| b.bidder == bidder) {
            existing.proposal = proposal;
            existing.submitted_at = now;
            debug!(task_id, index = existing.index, bidder = %bidder.short(), "Bid proposal replaced");
            return Ok(existing.index);
        }

        let index = BidIndex::try_from(book.bids.len())
            .map_err(|_| MarketError::InvalidInput(format!("too many bids on task {task_id}")))?;
        book.bids.push(Bid {
            task_id,
            index,
            bidder,
            proposal,
            submitted_at: now,
        });
        debug!(task_id, index, bidder = %bidder.short(), "Bid recorded");

        Ok(index)
    }

    pub async fn get(&self, task_id: TaskId, index: BidIndex) -> Result<Bid> {
        self.books
            .read()
            .await
            .get(&task_id)
            .and_then(|book| book.bids.get(index as usize))
            .cloned()
            .ok_or_else(|| MarketError::NotFound(format!("bid {index} on task {task_id}")))
    }

    pub async fn list(&self, task_id: TaskId) -> BidList {
        let books = self.books.read().await;
        let bids: Arc<[Bid]> = books
            .get(&task_id)
            .map(|book| book.bids.clone().into())
            .unwrap_or_else(|| Arc::from(Vec::new()));
        BidList { bids }
    }

    pub async fn count(&self, task_id: TaskId) -> usize {
        self.books
            .read()
            .await
            .get(&task_id)
            .map(|book| book.bids.len())
            .unwrap_or(0)
    }

    /// Stop accepting bids; history stays readable.
    pub async fn seal(&self, task_id: TaskId) {
        self.books.write().await.entry(task_id).or_default().sealed = true;
    }

    /// Drop the task's collection entirely.
    pub async fn purge(&self, task_id: TaskId) {
        self.books.write().await.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(b: u8) -> AgentId {
        AgentId::from_bytes([b; 20])
    }

    #[tokio::test]
    async fn test_indices_are_monotonic_per_task() {
        let book = BidBook::new();
        let now = Utc::now();

        assert_eq!(book.add(1, agent(1), "a".into(), now).await.unwrap(), 0);
        assert_eq!(book.add(1, agent(2), "b".into(), now).await.unwrap(), 1);
        assert_eq!(book.add(2, agent(1), "c".into(), now).await.unwrap(), 0);
        assert_eq!(book.count(1).await, 2);
    }

    #[tokio::test]
    async fn test_resubmission_keeps_index() {
        let book = BidBook::new();
        let now = Utc::now();

        book.add(1, agent(1), "first".into(), now).await.unwrap();
        book.add(1, agent(2), "other".into(), now).await.unwrap();
        let index = book.add(1, agent(1), "revised".into(), now).await.unwrap();

        assert_eq!(index, 0);
        assert_eq!(book.count(1).await, 2);
        assert_eq!(book.get(1, 0).await.unwrap().proposal, "revised");
    }

    #[tokio::test]
    async fn test_get_out_of_range() {
        let book = BidBook::new();
        assert!(matches!(book.get(1, 0).await, Err(MarketError::NotFound(_))));

        book.add(1, agent(1), "a".into(), Utc::now()).await.unwrap();
        assert!(matches!(book.get(1, 1).await, Err(MarketError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_is_restartable_snapshot() {
        let book = BidBook::new();
        let now = Utc::now();
        for i in 0..3 {
            book.add(7, agent(i), format!("p{i}"), now).await.unwrap();
        }

        let list = book.list(7).await;
        let first: Vec<_> = list.iter().map(|b| b.index).collect();
        let second: Vec<_> = list.iter().map(|b| b.index).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(first, second);

        // Later bids do not leak into an existing snapshot
        book.add(7, agent(9), "late".into(), now).await.unwrap();
        assert_eq!(list.len(), 3);
        assert!(book.list(99).await.is_empty());
    }

    #[tokio::test]
    async fn test_sealed_book_rejects_new_bids_but_keeps_history() {
        let book = BidBook::new();
        book.add(3, agent(1), "a".into(), Utc::now()).await.unwrap();
        book.seal(3).await;

        assert!(matches!(
            book.add(3, agent(2), "b".into(), Utc::now()).await,
            Err(MarketError::InvalidState { .. })
        ));
        assert_eq!(book.list(3).await.len(), 1);

        book.purge(3).await;
        assert!(book.list(3).await.is_empty());
    }
}
