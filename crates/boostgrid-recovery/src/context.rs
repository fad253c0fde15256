//! Per-call recovery context.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use boostgrid_core::{BoxFuture, ExecutionError, ExecutionOutput, InstanceId, Priority, Task, TaskId};

/// Re-attempts the original failed operation.
pub type RetryFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ExecutionOutput, ExecutionError>> + Send + Sync>;

/// What the handler knows about a failure site.
#[derive(Clone, Default)]
pub struct RecoveryContext {
    /// Scopes pattern detection and instance-facing actions.
    pub instance_id: Option<InstanceId>,
    pub task_id: Option<TaskId>,
    pub task: Option<Task>,
    pub retry: Option<RetryFn>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_instance(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>, task: Task) -> Self {
        self.task_id = Some(task_id.into());
        self.task = Some(task);
        self
    }

    pub fn with_retry<F, Fut>(mut self, retry: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send + 'static,
    {
        let retry: RetryFn = Arc::new(
            move || -> BoxFuture<'static, Result<ExecutionOutput, ExecutionError>> {
                Box::pin(retry())
            },
        );
        self.retry = Some(retry);
        self
    }

    /// Task priority, or the default when no task is attached.
    pub fn priority(&self) -> Priority {
        self.task.as_ref().map(|t| t.priority).unwrap_or_default()
    }
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("instance_id", &self.instance_id)
            .field("task_id", &self.task_id)
            .field("task", &self.task)
            .field("retry", &self.retry.is_some())
            .finish()
    }
}
