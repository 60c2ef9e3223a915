//! Reliability patterns for durable execution.
//!
//! - [`RetryPolicy`] — configurable retry with exponential/linear backoff.
//! - [`timeout`] — pure deadline checks consumed by the Dispatcher.

mod retry;
pub mod timeout;

pub use retry::{next_delay, BackoffStrategy, RetryPolicy};
pub use timeout::{heartbeat_is_stale, is_expired, TimeoutCause, TimeoutConfig};
