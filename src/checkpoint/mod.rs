//! Checkpoint persistence: cache, write-ahead log, storage backends
//!
//! ```text
//! create_checkpoint ──► cache insert ──► WAL append ──► return
//!                                            │
//!                            drain worker ◄──┘ (lazy / batched)
//!                                 │
//!                                 ▼
//!                        CheckpointStorage (fs, in-memory, custom)
//! ```
//!
//! The cache insert and WAL append happen before `create_checkpoint`
//! returns; durable persistence is decoupled and policy-driven. See
//! [`CheckpointStore`] for the full contract.

mod storage;
mod store;
mod wal;

pub use storage::{CheckpointStorage, FsStorage, InMemoryStorage, StorageError};
pub use store::{
    Checkpoint, CheckpointError, CheckpointStore, CheckpointStoreConfig, PersistencePolicy,
};
pub use wal::WriteAheadLog;
