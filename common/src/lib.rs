//! Common utilities and abstractions for the Barks shuffle.
//!
//! This crate holds what the tracker, the split servers and the reducers
//! share: the configuration, the error type, worker pools and time helpers.

pub mod config;
pub mod error;
pub mod pool;
pub mod time;

pub use config::ShuffleConfig;
pub use error::{ErrorSeverity, Result, ShuffleError};
pub use pool::{ThreadPoolFactory, WorkerPool};
pub use time::{blocks_per_second, current_timestamp_millis};
