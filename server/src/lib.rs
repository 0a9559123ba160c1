//! A persistent background job server speaking the faktory line protocol.

pub mod clock;
pub mod constants;
pub mod error;
pub mod job;
pub mod manager;
pub mod server;
pub mod storage;
pub mod tasks;
pub mod telemetry;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, StorageError, WorkerError};
pub use job::{Failure, Job};
pub use manager::{Manager, Middleware, MiddlewareContext, MiddlewareError, Next};
pub use server::{Server, ServerStats, ShutdownHandle};
pub use storage::{SetKind, Store};
pub use tasks::{Task, TaskRunner, TaskStats};
pub use workers::{ClientData, WorkerRecord, Workers};

/// Reported as `faktory_version` in `INFO`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
