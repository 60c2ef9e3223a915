//! Dispatcher (C7): the long-running worker loop that enforces timeouts,
//! claims runnable work, and drives it through isolated follower
//! subprocesses (SPEC_FULL §4.7).
//!
//! - [`Dispatcher`] / [`DispatcherConfig`] — the tick loop itself:
//!   deadline enforcement, claim-and-dispatch, follower reaping.
//! - [`run_follower_stdio`] / [`run_follower`] — the follower side of the
//!   wire protocol; an embedding binary's `main` calls this when invoked
//!   with [`FOLLOWER_FLAG`], reading requests from stdin and acking on
//!   stdout until `exit` or EOF.
//! - [`FollowerRequest`] / [`FollowerResponse`] — the line-delimited JSON
//!   exchanged between the two (SPEC_FULL §6.4).
//!
//! # Example
//!
//! ```ignore
//! use durable_engine::worker::{Dispatcher, DispatcherConfig};
//!
//! let dispatcher = Dispatcher::new(store, registry, DispatcherConfig::default());
//! let shutdown = dispatcher.shutdown_handle();
//! dispatcher.run().await?;
//! ```

mod dispatcher;
mod follower;
mod protocol;

pub use dispatcher::{Dispatcher, DispatcherError, DispatcherConfig, FOLLOWER_FLAG};
pub use follower::{run_follower, run_follower_stdio};
pub use protocol::{FollowerRequest, FollowerResponse};
