//! Compensation handler registry
//!
//! A compensation handler is the semantic undo of an operation: cancel the
//! booking, refund the charge. Handlers are registered by name and looked up
//! during rollback. The registry is a pure lookup table; it never invokes
//! anything itself.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

/// Boxed async compensation handler
///
/// Receives the original operation's `args` and `result` and performs the
/// undo. A returned error is logged by the rollback path and does not stop
/// the remaining compensations.
pub type CompensationHandler = Arc<
    dyn Fn(Value, Value) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync,
>;

/// Named registry of compensation handlers
///
/// Shared as `Arc` between the host (which registers handlers at startup)
/// and the transaction coordinator (which resolves them during rollback).
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(CompensationRegistry::new());
/// registry.register("compensate_book_slot", |args, _result| async move {
///     calendar.cancel(&args["slot_id"]).await.map_err(|e| e.to_string())
/// });
/// ```
#[derive(Default)]
pub struct CompensationRegistry {
    handlers: RwLock<HashMap<String, CompensationHandler>>,
}

impl CompensationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name, replacing any previous registration
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let name = name.into();
        debug!(handler = %name, "Registered compensation handler");
        let boxed: CompensationHandler =
            Arc::new(move |args, result| Box::pin(handler(args, result)));
        self.handlers.write().insert(name, boxed);
    }

    /// Look up a handler by name
    pub fn get(&self, name: &str) -> Option<CompensationHandler> {
        self.handlers.read().get(name).cloned()
    }

    /// Whether a handler is registered under the given name
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = CompensationRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        registry.register("compensate_book_slot", move |args, _result| {
            let counter = counter.clone();
            async move {
                assert_eq!(args, json!({"slot": 3}));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(registry.contains("compensate_book_slot"));
        assert!(!registry.contains("compensate_charge_card"));

        let handler = registry.get("compensate_book_slot").unwrap();
        handler(json!({"slot": 3}), json!(null)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reregistration_replaces() {
        let registry = CompensationRegistry::new();

        registry.register("undo", |_, _| async { Err("old".to_string()) });
        registry.register("undo", |_, _| async { Ok(()) });

        assert_eq!(registry.len(), 1);
        let handler = registry.get("undo").unwrap();
        assert!(handler(json!({}), json!({})).await.is_ok());
    }
}
