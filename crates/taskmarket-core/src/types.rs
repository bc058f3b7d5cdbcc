use crate::{MarketError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub type TaskId = u64;
pub type BidIndex = u32;
pub type DisputeId = u64;

/// Token quantity in the smallest unit of the settlement token.
pub type TokenAmount = u64;

/// Address-like agent identifier (20 bytes, rendered as `0x` + hex).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId([u8; 20]);

impl AgentId {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// First four bytes, for log fields.
    pub fn short(&self) -> String {
        format!("0x{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self)
    }
}

impl FromStr for AgentId {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let raw = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        let bytes = hex::decode(raw)
            .map_err(|e| MarketError::InvalidInput(format!("agent address {s:?}: {e}")))?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|v: Vec<u8>| {
            MarketError::InvalidInput(format!(
                "agent address {s:?}: expected 20 bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Trait for lifecycle states
pub trait LifecycleState: Send + Sync + Clone + fmt::Debug {
    /// Check if this is a terminal state
    fn is_terminal(&self) -> bool;

    /// Check if transition to another state is valid
    fn can_transition_to(&self, next: &Self) -> bool;
}

/// Task status. Ordinals are stable for any persisted encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskStatus {
    Open = 0,
    InProgress = 1,
    Submitted = 2,
    Completed = 3,
    Cancelled = 4,
    Disputed = 5,
}

impl TaskStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Escrow is still held for tasks in these states.
    pub fn holds_escrow(self) -> bool {
        !self.is_terminal()
    }
}

impl TryFrom<u8> for TaskStatus {
    type Error = MarketError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Open),
            1 => Ok(Self::InProgress),
            2 => Ok(Self::Submitted),
            3 => Ok(Self::Completed),
            4 => Ok(Self::Cancelled),
            5 => Ok(Self::Disputed),
            other => Err(MarketError::InvalidInput(format!(
                "unknown task status ordinal {other}"
            ))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl LifecycleState for TaskStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Open, InProgress) | (Open, Cancelled) => true,
            (InProgress, Submitted) | (InProgress, Cancelled) => true,
            (Submitted, Completed) | (Submitted, Disputed) => true,
            // Arbitration outcomes
            (Disputed, Completed) | (Disputed, Cancelled) => true,
            (Completed, _) | (Cancelled, _) => false,
            _ => false,
        }
    }
}

/// Escrow account disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Locked,
    Released,
    Refunded,
}

impl LifecycleState for Disposition {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Locked)
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Locked, Self::Released) | (Self::Locked, Self::Refunded)
        )
    }
}

/// Council verdict on a disputed completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    FavorCreator,
    FavorRunner,
}

/// Star rating given by the creator on completion (1..=5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;
    pub const NEUTRAL: Rating = Rating(3);

    pub fn new(stars: u8) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&stars) {
            return Err(MarketError::InvalidInput(format!(
                "rating must be between {} and {}, got {stars}",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(stars))
    }

    pub fn stars(self) -> u8 {
        self.0
    }
}

/// Task aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub creator: AgentId,
    pub runner: Option<AgentId>,
    pub title: String,
    pub description: String,
    pub reward: TokenAmount,
    pub deadline: DateTime<Utc>,
    pub status: TaskStatus,
    pub deliverables: String,
    pub accepted_bid: Option<BidIndex>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether `now` is past the task deadline. Never changes state by itself.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Whether the work was submitted before half of the deadline window elapsed.
    pub fn finished_early(&self) -> bool {
        let Some(submitted_at) = self.submitted_at else {
            return false;
        };
        let window = self.deadline - self.created_at;
        submitted_at - self.created_at < window / 2
    }

    pub fn is_participant(&self, agent: &AgentId) -> bool {
        self.creator == *agent || self.runner.as_ref() == Some(agent)
    }
}

/// Free-standing predicate over a task and a collaborator-supplied clock reading.
pub fn is_expired(task: &Task, now: DateTime<Utc>) -> bool {
    task.is_expired(now)
}

/// A runner's bid on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub task_id: TaskId,
    pub index: BidIndex,
    pub bidder: AgentId,
    pub proposal: String,
    pub submitted_at: DateTime<Utc>,
}

/// Append-only note attached to a task for audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditNote {
    pub task_id: TaskId,
    pub author: Option<AgentId>,
    pub note: String,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate marketplace statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStats {
    pub total_tasks: u64,
    pub open_tasks: u64,
    pub in_progress_tasks: u64,
    pub submitted_tasks: u64,
    pub disputed_tasks: u64,
    pub completed_tasks: u64,
    pub cancelled_tasks: u64,
    pub total_locked: TokenAmount,
    pub total_paid_out: TokenAmount,
    pub total_refunded: TokenAmount,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task_with_window(days: i64) -> Task {
        let created_at = Utc::now();
        Task {
            id: 0,
            creator: AgentId::from_bytes([1; 20]),
            runner: None,
            title: "t".to_string(),
            description: String::new(),
            reward: 10,
            deadline: created_at + Duration::days(days),
            status: TaskStatus::Open,
            deliverables: String::new(),
            accepted_bid: None,
            created_at,
            submitted_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_status_ordinals_are_stable() {
        assert_eq!(TaskStatus::Open.as_u8(), 0);
        assert_eq!(TaskStatus::InProgress.as_u8(), 1);
        assert_eq!(TaskStatus::Submitted.as_u8(), 2);
        assert_eq!(TaskStatus::Completed.as_u8(), 3);
        assert_eq!(TaskStatus::Cancelled.as_u8(), 4);
        assert_eq!(TaskStatus::Disputed.as_u8(), 5);

        for ordinal in 0..=5u8 {
            assert_eq!(TaskStatus::try_from(ordinal).unwrap().as_u8(), ordinal);
        }
        assert!(TaskStatus::try_from(6).is_err());
    }

    #[test]
    fn test_task_happy_path() {
        assert!(TaskStatus::Open.can_transition_to(&TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(&TaskStatus::Submitted));
        assert!(TaskStatus::Submitted.can_transition_to(&TaskStatus::Completed));
        assert!(TaskStatus::Completed.is_terminal());
    }

    #[test]
    fn test_task_side_branches() {
        assert!(TaskStatus::Open.can_transition_to(&TaskStatus::Cancelled));
        assert!(TaskStatus::InProgress.can_transition_to(&TaskStatus::Cancelled));
        assert!(TaskStatus::Submitted.can_transition_to(&TaskStatus::Disputed));
        assert!(TaskStatus::Disputed.can_transition_to(&TaskStatus::Completed));
        assert!(TaskStatus::Disputed.can_transition_to(&TaskStatus::Cancelled));
    }

    #[test]
    fn test_task_invalid_transitions() {
        // Cannot skip states
        assert!(!TaskStatus::Open.can_transition_to(&TaskStatus::Submitted));
        assert!(!TaskStatus::InProgress.can_transition_to(&TaskStatus::Completed));
        // Submitted work can no longer be cancelled unilaterally
        assert!(!TaskStatus::Submitted.can_transition_to(&TaskStatus::Cancelled));
        // Terminal
        assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Disputed));
        assert!(!TaskStatus::Cancelled.can_transition_to(&TaskStatus::Open));
        // Backwards
        assert!(!TaskStatus::Disputed.can_transition_to(&TaskStatus::Submitted));
    }

    #[test]
    fn test_disposition_is_one_shot() {
        assert!(Disposition::Locked.can_transition_to(&Disposition::Released));
        assert!(Disposition::Locked.can_transition_to(&Disposition::Refunded));
        assert!(!Disposition::Released.can_transition_to(&Disposition::Refunded));
        assert!(!Disposition::Refunded.can_transition_to(&Disposition::Locked));
        assert!(Disposition::Released.is_terminal());
    }

    #[test]
    fn test_agent_id_parse_and_display() {
        let id: AgentId = "0x00112233445566778899aabbccddeeff00112233".parse().unwrap();
        assert_eq!(id.to_string(), "0x00112233445566778899aabbccddeeff00112233");
        assert_eq!(id.short(), "0x00112233");

        assert!("0x1234".parse::<AgentId>().is_err());
        assert!("not-hex".parse::<AgentId>().is_err());

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0x00112233445566778899aabbccddeeff00112233\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_rating_bounds() {
        assert!(Rating::new(0).is_err());
        assert!(Rating::new(6).is_err());
        assert_eq!(Rating::new(5).unwrap().stars(), 5);
        assert_eq!(Rating::NEUTRAL.stars(), 3);
    }

    #[test]
    fn test_expiry_and_early_finish() {
        let mut task = task_with_window(10);
        assert!(!is_expired(&task, task.created_at + Duration::days(10)));
        assert!(is_expired(&task, task.created_at + Duration::days(11)));

        assert!(!task.finished_early());
        task.submitted_at = Some(task.created_at + Duration::days(4));
        assert!(task.finished_early());
        task.submitted_at = Some(task.created_at + Duration::days(6));
        assert!(!task.finished_early());
        // Exactly half the window is no longer early
        task.submitted_at = Some(task.created_at + Duration::days(5));
        assert!(!task.finished_early());
        task.submitted_at = Some(task.created_at + Duration::days(5) - Duration::seconds(1));
        assert!(task.finished_early());
    }
}
