//! Connection acceptor and worker pool.

pub mod listener;
pub mod pool;

pub use listener::{Job, Server, run};
pub use pool::{PoolStats, SubmitError, WorkerPool};
