//! # Runcore
//!
//! In-process coordination core for a workflow/agent execution engine.
//!
//! ## Features
//!
//! - **Priority task queue**: per-context binary heaps with a stable global
//!   ordering and O(1) interrupt detection for cooperative cancellation
//! - **Zero-latency checkpointing**: bounded in-memory cache, write-ahead log
//!   as the durability floor, and asynchronous persistence to a pluggable
//!   storage backend
//! - **Crash recovery**: WAL replay reconstructs checkpoints that had not yet
//!   reached durable storage
//! - **Transactions with compensation**: rollback walks the operation log in
//!   reverse and invokes named undo handlers (best-effort)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Host Engine                           │
//! │  (enqueues events, polls for interrupts, wraps effects in   │
//! │   transaction scopes)                                       │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                      │
//!          ▼                   ▼                      ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌────────────────────┐
//! │ PriorityTask-   │ │ Transaction-     │ │ Compensation-      │
//! │ Queue           │ │ Coordinator      │ │ Registry           │
//! │ (per-context    │ │ (begin/commit/   │ │ (name → undo       │
//! │  heaps)         │ │  rollback)       │ │  handler)          │
//! └─────────────────┘ └────────┬─────────┘ └────────────────────┘
//!                              ▼
//!                     ┌──────────────────┐
//!                     │ CheckpointStore  │
//!                     │ (cache + WAL +   │
//!                     │  async drain)    │
//!                     └────────┬─────────┘
//!                              ▼
//!                     ┌──────────────────┐
//!                     │ CheckpointStorage│
//!                     │ (host-pluggable) │
//!                     └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use runcore::prelude::*;
//!
//! let queue = PriorityTaskQueue::new(QueueConfig::default());
//! let id = queue.enqueue("user-input", json!({"text": "book a slot"}),
//!     TaskPriority::Normal, "run-1")?;
//!
//! // During a long-running operation, poll for interrupts:
//! if let Some(interrupt) = queue.check_for_interrupt("run-1") {
//!     // cooperatively cancel the current work
//! }
//! ```

pub mod checkpoint;
pub mod queue;
pub mod reliability;
pub mod transaction;

/// Prelude for common imports
pub mod prelude {
    pub use crate::checkpoint::{
        Checkpoint, CheckpointError, CheckpointStorage, CheckpointStore, CheckpointStoreConfig,
        FsStorage, InMemoryStorage, PersistencePolicy,
    };
    pub use crate::queue::{
        PriorityTaskQueue, QueueConfig, QueueError, Task, TaskNotice, TaskPriority, TaskState,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::transaction::{
        CompensationRegistry, Operation, TransactionCoordinator, TransactionError,
        TransactionHandle, TransactionState,
    };
}

// Re-export key types at crate root
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStorage, CheckpointStore, CheckpointStoreConfig,
    FsStorage, InMemoryStorage, PersistencePolicy, StorageError,
};
pub use queue::{
    PriorityTaskQueue, QueueConfig, QueueError, Task, TaskNotice, TaskPriority, TaskState,
};
pub use reliability::RetryPolicy;
pub use transaction::{
    CompensationRegistry, Operation, TransactionCoordinator, TransactionError, TransactionHandle,
    TransactionState,
};
