//! Transaction coordinator: operation log, commit, compensating rollback
//!
//! Transactions bracket multi-step side effects against external systems.
//! Each completed step is recorded as an [`Operation`]; on rollback the
//! operation log is walked in reverse and the named compensation handler is
//! invoked for each entry. Compensation is best-effort: a missing handler or
//! a handler failure is logged and skipped, never halting the walk, and the
//! transaction always ends `RolledBack`.
//!
//! Idempotency keys make `begin` safe to retry: a key that maps to a
//! committed (or still active) transaction returns that transaction's handle
//! instead of opening a duplicate.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::compensation::CompensationRegistry;
use crate::checkpoint::{CheckpointError, CheckpointStore};

/// Transaction lifecycle state
///
/// Exactly one terminal transition: `Active -> Committed` or
/// `Active -> RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A completed step recorded inside a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Operation id
    pub id: Uuid,

    /// What the step did (e.g. `book_slot`)
    pub op_type: String,

    /// Arguments the step ran with, passed back to its compensation
    pub args: Value,

    /// What the step produced, passed back to its compensation
    pub result: Value,

    /// Name of the compensation handler that undoes this step
    pub compensation: String,

    /// When the operation was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Error type for transaction operations
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The transaction has already reached a terminal state
    #[error("transaction {id} is not active (state: {state})")]
    NotActive { id: Uuid, state: TransactionState },

    /// No transaction with the given id
    #[error("transaction not found: {0}")]
    NotFound(Uuid),

    /// Checkpoint write failed on the commit/begin path
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

struct TransactionRecord {
    context_id: String,
    state: TransactionState,
    operations: Vec<Operation>,
    idempotency_key: Option<String>,
    started_at: DateTime<Utc>,
}

struct CoordinatorInner {
    checkpoints: Arc<CheckpointStore>,
    registry: Arc<CompensationRegistry>,
    auto_checkpoint: bool,
    transactions: RwLock<HashMap<Uuid, TransactionRecord>>,
    idempotency: RwLock<HashMap<String, Uuid>>,
}

/// Coordinates transactions over the checkpoint store and compensation
/// registry
///
/// Cloning is cheap; all clones share the same transaction table.
///
/// # Example
///
/// ```ignore
/// let coordinator = TransactionCoordinator::new(checkpoints, registry);
///
/// let txn = coordinator.begin("run-1", None, Some("req-42")).await?;
/// let slot = calendar.book(&when).await?;
/// txn.record_operation("book_slot", json!({"when": when}), json!(slot), None)?;
/// txn.commit().await?;
/// ```
#[derive(Clone)]
pub struct TransactionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TransactionCoordinator {
    /// Create a coordinator
    pub fn new(checkpoints: Arc<CheckpointStore>, registry: Arc<CompensationRegistry>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                checkpoints,
                registry,
                auto_checkpoint: false,
                transactions: RwLock::new(HashMap::new()),
                idempotency: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Enable or disable automatic pre/post checkpoints
    ///
    /// When enabled, `begin` records a `phase=pre` checkpoint of the
    /// context's latest known state and `commit` records a `phase=post`
    /// checkpoint capturing the operation log.
    ///
    /// Builder-style; call before the coordinator is shared.
    pub fn with_auto_checkpoint(self, enabled: bool) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                checkpoints: Arc::clone(&self.inner.checkpoints),
                registry: Arc::clone(&self.inner.registry),
                auto_checkpoint: enabled,
                transactions: RwLock::new(HashMap::new()),
                idempotency: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Begin a transaction
    ///
    /// `transaction_id` defaults to a fresh UUIDv7. An `idempotency_key`
    /// already mapped to an active or committed transaction short-circuits to
    /// that transaction's handle; a mapping to a rolled-back transaction is
    /// replaced, since retrying after a rollback is legitimate.
    pub async fn begin(
        &self,
        context_id: &str,
        transaction_id: Option<Uuid>,
        idempotency_key: Option<&str>,
    ) -> Result<TransactionHandle, TransactionError> {
        if let Some(key) = idempotency_key {
            let existing = self.inner.idempotency.read().get(key).copied();
            if let Some(id) = existing {
                let stored = self
                    .inner
                    .transactions
                    .read()
                    .get(&id)
                    .map(|record| (record.state, record.context_id.clone()));
                match stored {
                    // The handle carries the stored transaction's context,
                    // not the retrying caller's
                    Some((TransactionState::Active | TransactionState::Committed, stored_ctx)) => {
                        debug!(
                            transaction_id = %id,
                            idempotency_key = key,
                            "Idempotent begin returned existing transaction"
                        );
                        return Ok(self.handle(id, &stored_ctx));
                    }
                    // Rolled back (or vanished): the key is free again
                    _ => {
                        self.inner.idempotency.write().remove(key);
                    }
                }
            }
        }

        let id = transaction_id.unwrap_or_else(Uuid::now_v7);
        self.inner.transactions.write().insert(
            id,
            TransactionRecord {
                context_id: context_id.to_string(),
                state: TransactionState::Active,
                operations: vec![],
                idempotency_key: idempotency_key.map(str::to_string),
                started_at: Utc::now(),
            },
        );
        if let Some(key) = idempotency_key {
            self.inner.idempotency.write().insert(key.to_string(), id);
        }

        if self.inner.auto_checkpoint {
            let latest_state = self
                .inner
                .checkpoints
                .get_latest_checkpoint(context_id)
                .await?
                .map(|cp| cp.state)
                .unwrap_or(Value::Null);

            self.write_phase_checkpoint(context_id, id, "pre", latest_state)
                .await?;
        }

        debug!(transaction_id = %id, context_id, "Transaction started");
        Ok(self.handle(id, context_id))
    }

    /// Run `body` inside a transaction scope
    ///
    /// Commits when the body returns `Ok`, rolls back when it returns `Err`.
    /// No transaction is ever left active when the scope exits.
    pub async fn with_transaction<T, E, F, Fut>(&self, context_id: &str, body: F) -> Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let txn = self.begin(context_id, None, None).await?;

        match body(txn.clone()).await {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(
                        transaction_id = %txn.id(),
                        error = %rollback_err,
                        "Rollback inside transaction scope failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// State of a transaction
    pub fn transaction_state(&self, id: Uuid) -> Result<TransactionState, TransactionError> {
        self.inner
            .transactions
            .read()
            .get(&id)
            .map(|record| record.state)
            .ok_or(TransactionError::NotFound(id))
    }

    /// Recorded operations of a transaction, in record order
    pub fn operations(&self, id: Uuid) -> Result<Vec<Operation>, TransactionError> {
        self.inner
            .transactions
            .read()
            .get(&id)
            .map(|record| record.operations.clone())
            .ok_or(TransactionError::NotFound(id))
    }

    fn handle(&self, id: Uuid, context_id: &str) -> TransactionHandle {
        TransactionHandle {
            id,
            context_id: context_id.to_string(),
            inner: Arc::clone(&self.inner),
        }
    }

    async fn write_phase_checkpoint(
        &self,
        context_id: &str,
        transaction_id: Uuid,
        phase: &str,
        state: Value,
    ) -> Result<(), TransactionError> {
        let result = self
            .inner
            .checkpoints
            .create_checkpoint(
                context_id,
                format!("txn-{transaction_id}-{phase}"),
                state,
                json!({"transaction_id": transaction_id, "phase": phase}),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // A re-begun transaction id re-writes the same phase checkpoint
            Err(CheckpointError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle to a single transaction
///
/// Cheap to clone; all clones refer to the same transaction.
#[derive(Clone)]
pub struct TransactionHandle {
    id: Uuid,
    context_id: String,
    inner: Arc<CoordinatorInner>,
}

impl TransactionHandle {
    /// Transaction id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owning context
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Current state
    pub fn state(&self) -> Result<TransactionState, TransactionError> {
        self.inner
            .transactions
            .read()
            .get(&self.id)
            .map(|record| record.state)
            .ok_or(TransactionError::NotFound(self.id))
    }

    /// Record a completed step
    ///
    /// `compensation` defaults to `compensate_<op_type>`. Fails with
    /// [`TransactionError::NotActive`] once the transaction has committed or
    /// rolled back.
    pub fn record_operation(
        &self,
        op_type: impl Into<String>,
        args: Value,
        result: Value,
        compensation: Option<String>,
    ) -> Result<Uuid, TransactionError> {
        let op_type = op_type.into();
        let mut transactions = self.inner.transactions.write();
        let record = transactions
            .get_mut(&self.id)
            .ok_or(TransactionError::NotFound(self.id))?;

        if record.state != TransactionState::Active {
            return Err(TransactionError::NotActive {
                id: self.id,
                state: record.state,
            });
        }

        let operation = Operation {
            id: Uuid::now_v7(),
            compensation: compensation.unwrap_or_else(|| format!("compensate_{op_type}")),
            op_type,
            args,
            result,
            recorded_at: Utc::now(),
        };
        let op_id = operation.id;
        record.operations.push(operation);
        Ok(op_id)
    }

    /// Commit the transaction
    ///
    /// With auto-checkpointing enabled this writes a `phase=post` checkpoint
    /// capturing the operation log before the state flips to `Committed`.
    pub async fn commit(&self) -> Result<(), TransactionError> {
        let (operations, started_at) = {
            let transactions = self.inner.transactions.read();
            let record = transactions
                .get(&self.id)
                .ok_or(TransactionError::NotFound(self.id))?;
            if record.state != TransactionState::Active {
                return Err(TransactionError::NotActive {
                    id: self.id,
                    state: record.state,
                });
            }
            (record.operations.clone(), record.started_at)
        };

        if self.inner.auto_checkpoint {
            let state = json!({
                "transaction_id": self.id,
                "operations": operations,
            });
            let result = self
                .inner
                .checkpoints
                .create_checkpoint(
                    &self.context_id,
                    format!("txn-{}-post", self.id),
                    state,
                    json!({"transaction_id": self.id, "phase": "post"}),
                )
                .await;
            match result {
                Ok(_) | Err(CheckpointError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.transition(TransactionState::Committed)?;
        info!(
            transaction_id = %self.id,
            context_id = %self.context_id,
            operations = operations.len(),
            elapsed_ms = (Utc::now() - started_at).num_milliseconds(),
            "Transaction committed"
        );
        Ok(())
    }

    /// Roll back the transaction
    ///
    /// Walks the operation log in reverse, invoking each operation's
    /// compensation handler. Missing handlers and handler failures are
    /// logged and skipped. The transaction always ends `RolledBack`.
    #[instrument(skip(self), fields(transaction_id = %self.id, context_id = %self.context_id))]
    pub async fn rollback(&self) -> Result<(), TransactionError> {
        // Flip the state first so no further operations can be recorded
        // while compensations run
        let (operations, idempotency_key) = {
            let mut transactions = self.inner.transactions.write();
            let record = transactions
                .get_mut(&self.id)
                .ok_or(TransactionError::NotFound(self.id))?;
            if record.state != TransactionState::Active {
                return Err(TransactionError::NotActive {
                    id: self.id,
                    state: record.state,
                });
            }
            record.state = TransactionState::RolledBack;
            (record.operations.clone(), record.idempotency_key.take())
        };

        // A rolled-back transaction no longer claims its idempotency key
        if let Some(key) = idempotency_key {
            self.inner.idempotency.write().remove(&key);
        }

        for operation in operations.iter().rev() {
            let Some(handler) = self.inner.registry.get(&operation.compensation) else {
                warn!(
                    op_type = %operation.op_type,
                    compensation = %operation.compensation,
                    "No compensation handler registered; skipping"
                );
                continue;
            };

            if let Err(e) = handler(operation.args.clone(), operation.result.clone()).await {
                warn!(
                    op_type = %operation.op_type,
                    compensation = %operation.compensation,
                    error = %e,
                    "Compensation handler failed; continuing rollback"
                );
            }
        }

        info!(operations = operations.len(), "Transaction rolled back");
        Ok(())
    }

    fn transition(&self, to: TransactionState) -> Result<(), TransactionError> {
        let mut transactions = self.inner.transactions.write();
        let record = transactions
            .get_mut(&self.id)
            .ok_or(TransactionError::NotFound(self.id))?;
        if record.state != TransactionState::Active {
            return Err(TransactionError::NotActive {
                id: self.id,
                state: record.state,
            });
        }
        record.state = to;
        Ok(())
    }
}
