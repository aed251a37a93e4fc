//! Priority task queue
//!
//! This module provides:
//! - [`PriorityTaskQueue`] - per-context priority queue with O(1) interrupt
//!   detection, task pause/resume, and fire-and-forget subscriber
//!   notification
//! - [`Task`] - the unit of queued work, ordered by `(priority, sequence)`
//!
//! The host engine is the sole producer/consumer for a given context id and
//! supplies a stable context id scheme (e.g. one per workflow run).

mod priority_queue;
mod task;

pub use priority_queue::{PriorityTaskQueue, QueueConfig, QueueError, TaskNotice};
pub use task::{Task, TaskPriority, TaskState};
