//! Collaborators implemented outside the core.
//!
//! Routing, task execution, and instance lifecycle are all behind object-safe
//! traits returning boxed futures so they can be swapped for test doubles.

use std::future::Future;
use std::pin::Pin;

use crate::types::{ExecutionError, ExecutionOutput, InstanceHandle, InstanceProfile, Target, Task};

/// Boxed, sendable future used by every collaborator trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Decides where a task should run.
pub trait TaskRouter: Send + Sync {
    /// Returns the chosen target, or a routing error message.
    fn route<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<Target, String>>;
}

/// Runs tasks inside pooled booster instances.
pub trait BoosterProvider: Send + Sync {
    fn run_in_instance<'a>(
        &'a self,
        instance: &'a InstanceHandle,
        task: &'a Task,
    ) -> BoxFuture<'a, Result<ExecutionOutput, ExecutionError>>;
}

/// Runs tasks on general-purpose workers.
pub trait GeneralProvider: Send + Sync {
    fn run<'a>(
        &'a self,
        task: &'a Task,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<ExecutionOutput, ExecutionError>>;
}

/// Brings booster instances up and down and answers health probes.
pub trait InstanceDriver: Send + Sync {
    /// Start a new instance. Resolves once it can accept work.
    fn launch<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<InstanceProfile, String>>;

    /// Returns `true` if the instance answers its health probe.
    fn probe<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, bool>;

    /// Tear an instance down. Best-effort.
    fn terminate<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, ()>;
}
