//! Reliability patterns for pipeline batches
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`retry_transient`] - Re-run an operation on transient failures

mod retry;

pub use retry::{retry_transient, RetryPolicy, Transient};
