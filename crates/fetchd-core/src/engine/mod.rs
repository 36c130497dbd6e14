//! Download engine internals
//!
//! - Lifecycle state machine
//! - Worker pool with epoch-tagged transfers
//! - Pluggable transfer executors (HTTP by default)
//! - SQLite persistence

pub mod executor;
pub mod http;
pub mod machine;
mod persistence;
pub(crate) mod pool;
pub mod throughput;
pub(crate) mod transfer_task;

pub use executor::*;
pub use http::HttpExecutor;
pub use persistence::SqliteStore;
pub use throughput::ThroughputMeter;
