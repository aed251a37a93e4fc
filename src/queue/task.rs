//! Task model for the priority queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority class for queued tasks
///
/// Ordering is significant: `Low < Normal < High < Interrupt`. The queue
/// delivers higher classes first; `Interrupt` is the class the host engine
/// polls for during long-running operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Interrupt,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Task execution state
///
/// Transitions: `Pending → Processing → {Completed, Failed, Cancelled}`,
/// plus `Pending ⇄ Paused` for deferred work. The queue itself only drives
/// `Pending → Processing` (on dequeue), `Pending → Cancelled` (on cancel)
/// and the pause/resume pair; terminal outcomes are reported by the host
/// engine that executes the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Paused,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paused => write!(f, "paused"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of queued work
///
/// Tasks are created by producers (the host engine), ordered by
/// `(priority, sequence)` within their context, and handed to the consumer
/// on dequeue. The payload is opaque to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id
    pub id: Uuid,

    /// Free-form tag, e.g. "user-input" or "interrupt"
    pub kind: String,

    /// Opaque payload supplied by the producer
    pub payload: serde_json::Value,

    /// Priority class
    pub priority: TaskPriority,

    /// Execution state
    pub state: TaskState,

    /// Owning context (e.g. one workflow run)
    pub context_id: String,

    /// Global monotonically increasing sequence number, assigned at enqueue
    pub sequence: u64,

    /// Number of retries attempted by the host engine
    pub retry_count: u32,

    /// Maximum retries allowed before the host gives up
    pub max_retries: u32,

    /// When the task was created
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task
    ///
    /// The sequence number is assigned by the queue at enqueue time; until
    /// then it is zero.
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        priority: TaskPriority,
        context_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind: kind.into(),
            payload,
            priority,
            state: TaskState::Pending,
            context_id: context_id.into(),
            sequence: 0,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
        }
    }

    /// Set the maximum retry count
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the host may retry this task again
    pub fn has_retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether this task is in the interrupt priority class
    pub fn is_interrupt(&self) -> bool {
        self.priority == TaskPriority::Interrupt
    }
}
