//! Transactions with compensating rollback
//!
//! Side effects against external systems cannot be undone by restoring a
//! snapshot; they need semantic undo. The coordinator records every
//! completed step, and on rollback invokes each step's registered
//! compensation handler in reverse order.

mod compensation;
mod coordinator;

pub use compensation::{CompensationHandler, CompensationRegistry};
pub use coordinator::{
    Operation, TransactionCoordinator, TransactionError, TransactionHandle, TransactionState,
};
