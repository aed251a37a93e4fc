//! Per-context priority task queue
//!
//! Accepts tasks concurrently from multiple producers and delivers them to a
//! consumer in `(priority desc, sequence asc)` order. Each context owns its
//! own heap, so ordering guarantees stay local to a context and no global
//! lock is required. Sequence numbers are global, which gives a stable,
//! reproducible total order across contexts for testing.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::task::{Task, TaskPriority, TaskState};

/// Queue configuration
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// Maximum live (pending or paused) tasks per context (`None` =
    /// unbounded)
    ///
    /// When the cap is reached, `enqueue` rejects with
    /// [`QueueError::CapacityExceeded`] rather than silently dropping or
    /// evicting.
    pub max_size: Option<usize>,
}

impl QueueConfig {
    /// Create an unbounded queue configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-context pending cap
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Enqueue rejected because the context reached its configured cap
    #[error("queue capacity exceeded for context {context}: max {max}")]
    CapacityExceeded { context: String, max: usize },

    /// Operation referenced a task id with no pending task
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
}

/// Notification sent to subscribers when a task is enqueued
#[derive(Debug, Clone)]
pub struct TaskNotice {
    /// Id of the enqueued task
    pub task_id: Uuid,

    /// Task kind tag
    pub kind: String,

    /// Priority class of the enqueued task
    pub priority: TaskPriority,
}

/// Heap entry: ordering key only, the task itself lives in the id map
#[derive(Debug, Clone)]
struct HeapEntry {
    priority: TaskPriority,
    sequence: u64,
    task_id: Uuid,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Per-context queue state: a heap of ordering keys plus the live tasks
///
/// Cancelled tasks are removed from the map immediately; paused tasks stay
/// in the map but leave the pending set. Either way their heap entries
/// become stale and are discarded lazily when they surface at the root
/// (resume pushes a fresh entry with the original sequence).
#[derive(Default)]
struct ContextQueue {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<Uuid, Task>,
    pending: usize,
}

impl ContextQueue {
    /// Discard stale root entries and return the id of the live head
    fn live_head(&mut self) -> Option<Uuid> {
        while let Some(entry) = self.heap.peek() {
            match self.tasks.get(&entry.task_id) {
                Some(task) if task.state == TaskState::Pending => return Some(entry.task_id),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }
}

/// Priority-ordered task queue, sharded by context
///
/// All operations are synchronous, CPU-bound, and never perform I/O.
/// Subscriber notification on enqueue is a non-blocking channel handoff;
/// a slow or dropped subscriber cannot stall a producer or corrupt queue
/// state.
///
/// # Example
///
/// ```ignore
/// let queue = PriorityTaskQueue::new(QueueConfig::default());
///
/// queue.enqueue("user-input", json!({"text": "hi"}), TaskPriority::Normal, "run-1")?;
/// queue.enqueue("interrupt", json!({}), TaskPriority::Interrupt, "run-1")?;
///
/// // The interrupt dequeues first despite arriving later.
/// let task = queue.dequeue("run-1").unwrap();
/// assert!(task.is_interrupt());
/// ```
pub struct PriorityTaskQueue {
    config: QueueConfig,
    contexts: DashMap<String, ContextQueue>,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<TaskNotice>>>,
    sequence: AtomicU64,
}

impl PriorityTaskQueue {
    /// Create a new queue
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            contexts: DashMap::new(),
            subscribers: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Enqueue a new task, returning its id
    ///
    /// Assigns the next global sequence number, inserts into the context's
    /// heap in O(log n), and notifies subscribers for the context. Never
    /// performs I/O.
    pub fn enqueue(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
        priority: TaskPriority,
        context_id: impl Into<String>,
    ) -> Result<Uuid, QueueError> {
        let context_id = context_id.into();
        self.enqueue_task(Task::new(kind, payload, priority, context_id))
    }

    /// Enqueue a fully constructed task
    ///
    /// The task's sequence number and state are overwritten: sequence is
    /// assigned here and the state is forced to `Pending`.
    pub fn enqueue_task(&self, mut task: Task) -> Result<Uuid, QueueError> {
        task.sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        task.state = TaskState::Pending;

        let task_id = task.id;
        let notice = TaskNotice {
            task_id,
            kind: task.kind.clone(),
            priority: task.priority,
        };
        let context_id = task.context_id.clone();

        {
            let mut queue = self.contexts.entry(context_id.clone()).or_default();

            if let Some(max) = self.config.max_size {
                if queue.tasks.len() >= max {
                    return Err(QueueError::CapacityExceeded {
                        context: context_id,
                        max,
                    });
                }
            }

            queue.heap.push(HeapEntry {
                priority: task.priority,
                sequence: task.sequence,
                task_id,
            });
            queue.tasks.insert(task_id, task);
            queue.pending += 1;
        }

        trace!(%task_id, context_id = %context_id, priority = %notice.priority, "Task enqueued");
        self.notify(&context_id, notice);
        Ok(task_id)
    }

    /// Remove and return the highest-priority pending task
    ///
    /// The returned task has transitioned `Pending → Processing` and is no
    /// longer in the queue; it cannot be re-peeked.
    pub fn dequeue(&self, context_id: &str) -> Option<Task> {
        let mut queue = self.contexts.get_mut(context_id)?;

        let head = queue.live_head()?;
        queue.heap.pop();
        let mut task = queue.tasks.remove(&head)?;
        queue.pending -= 1;
        task.state = TaskState::Processing;

        trace!(task_id = %task.id, context_id, "Task dequeued");
        Some(task)
    }

    /// Read the head of the queue without removing it
    pub fn peek(&self, context_id: &str) -> Option<Task> {
        let mut queue = self.contexts.get_mut(context_id)?;
        let head = queue.live_head()?;
        queue.tasks.get(&head).cloned()
    }

    /// O(1) interrupt detection
    ///
    /// Returns the head task only if it is in the `Interrupt` priority class;
    /// otherwise returns `None` even if lower-priority tasks are pending.
    /// This is the primitive the host engine polls during long-running
    /// operations to detect cooperative cancellation requests.
    pub fn check_for_interrupt(&self, context_id: &str) -> Option<Task> {
        self.peek(context_id).filter(Task::is_interrupt)
    }

    /// Whether the context has any pending tasks
    pub fn has_pending(&self, context_id: &str) -> bool {
        self.pending_count(context_id) > 0
    }

    /// Number of pending tasks for a context (paused tasks excluded)
    pub fn pending_count(&self, context_id: &str) -> usize {
        self.contexts
            .get(context_id)
            .map(|q| q.pending)
            .unwrap_or(0)
    }

    /// Cancel a pending task
    ///
    /// Only effective while the task is `Pending`. A task already handed to
    /// the consumer has left the queue; interrupting it is the host engine's
    /// responsibility (see [`check_for_interrupt`](Self::check_for_interrupt)).
    pub fn cancel_task(&self, context_id: &str, task_id: Uuid) -> Result<(), QueueError> {
        let mut queue = self
            .contexts
            .get_mut(context_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;

        match queue.tasks.remove(&task_id) {
            Some(task) => {
                if task.state == TaskState::Pending {
                    queue.pending -= 1;
                }
                debug!(%task_id, context_id, kind = %task.kind, "Task cancelled");
                Ok(())
            }
            None => Err(QueueError::TaskNotFound(task_id)),
        }
    }

    /// Pause a pending task for later resumption
    ///
    /// The task keeps its slot (and sequence number) but leaves the pending
    /// set: it is skipped by dequeue, peek and interrupt detection until
    /// resumed. Pausing an already paused task is a no-op.
    pub fn pause_task(&self, context_id: &str, task_id: Uuid) -> Result<(), QueueError> {
        let mut guard = self
            .contexts
            .get_mut(context_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        let queue = &mut *guard;

        let task = queue
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        if task.state == TaskState::Pending {
            task.state = TaskState::Paused;
            queue.pending -= 1;
            debug!(%task_id, context_id, kind = %task.kind, "Task paused");
        }
        Ok(())
    }

    /// Resume a paused task
    ///
    /// The task re-enters the pending set with its original sequence number,
    /// so it regains the position it held before the pause. Resuming a task
    /// that is not paused is a no-op.
    pub fn resume_task(&self, context_id: &str, task_id: Uuid) -> Result<(), QueueError> {
        let mut guard = self
            .contexts
            .get_mut(context_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        let queue = &mut *guard;

        let task = queue
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;
        if task.state == TaskState::Paused {
            task.state = TaskState::Pending;
            queue.heap.push(HeapEntry {
                priority: task.priority,
                sequence: task.sequence,
                task_id,
            });
            queue.pending += 1;
            debug!(%task_id, context_id, kind = %task.kind, "Task resumed");
        }
        Ok(())
    }

    /// Drop all state for a context
    pub fn clear(&self, context_id: &str) {
        self.contexts.remove(context_id);
    }

    /// Subscribe to enqueue notifications for a context
    ///
    /// Each enqueue delivers a [`TaskNotice`] to every live subscriber.
    /// Dropping the receiver unsubscribes; the producer never notices.
    pub fn subscribe(&self, context_id: impl Into<String>) -> mpsc::UnboundedReceiver<TaskNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(context_id.into()).or_default().push(tx);
        rx
    }

    /// Fire-and-forget delivery to subscribers; closed channels are pruned
    fn notify(&self, context_id: &str, notice: TaskNotice) {
        if let Some(mut subs) = self.subscribers.get_mut(context_id) {
            subs.retain(|tx| match tx.send(notice.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!(context_id, "Pruning closed subscriber");
                    false
                }
            });
        }
    }
}
