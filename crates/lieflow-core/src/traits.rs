use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{TaskRequest, TaskResult};

/// Task runner: performs the actual work behind a task node.
///
/// Runners may be local functions, subprocesses or remote procedure calls.
/// Returning `Err` is treated the same as a `failed` result.
pub trait TaskRunner: Send + Sync + 'static {
    /// Runner name (used by `custom_func` lookups).
    fn name(&self) -> &str;

    /// Execute one task attempt.
    fn run(&self, request: TaskRequest) -> BoxFuture<'_, Result<TaskResult>>;

    /// Timeout in seconds for one attempt (0 = use the engine default).
    fn timeout_secs(&self) -> u64 {
        0
    }
}
