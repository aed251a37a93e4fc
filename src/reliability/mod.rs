//! Reliability primitives
//!
//! Currently just [`RetryPolicy`], the backoff schedule used by the
//! checkpoint store's background persistence worker.

mod retry;

pub use retry::RetryPolicy;
