//! Retry policies for transient store failures
//!
//! Rate-limit responses from the store are retried with exponential backoff
//! and jitter; every other failure is handed back to the caller immediately.

pub mod retry;

pub use retry::{BatchPolicy, RetryPolicy};
