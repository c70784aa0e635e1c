//! Named tasks, the dependency graph between them, and the scheduler.

mod graph;
mod runner;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, anyhow};

use crate::compiler::CompilerManager;
use crate::config::Configuration;
use crate::core::{CancellationToken, Dynamic};
use crate::error::{TaskError, VerificationError};
use crate::harness::TestHarness;
use crate::network::{NetworkClient, NetworkDefinition};
use crate::verify::Verifier;

pub use graph::{TaskDef, TaskGraph, TaskGraphBuilder};
pub use runner::{RunReport, TaskReport};

pub(crate) use runner::run;

/// Arguments of a task invocation, by name.
pub type TaskArgs = BTreeMap<String, String>;

pub(crate) type TaskAction = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<Dynamic> + Send + Sync>;

/// One definition of a task. Overriding a task creates a new definition
/// holding the one it replaced.
pub struct TaskDefinition {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) action: TaskAction,
    pub(crate) prior: Option<Arc<TaskDefinition>>,
}

impl TaskDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// How many definitions this one overrides.
    pub fn depth(&self) -> usize {
        std::iter::successors(self.prior.as_deref(), |d| d.prior.as_deref()).count()
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A task this one depends on, directly or not, failed. Holds the name
    /// of the failed task.
    BlockedBy(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed(TaskError),
    Skipped(SkipReason),
}

impl TaskStatus {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskStatus::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskStatus::Skipped(_))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => f.write_str("pending"),
            TaskStatus::Running => f.write_str("running"),
            TaskStatus::Succeeded => f.write_str("succeeded"),
            TaskStatus::Failed(err) => write!(f, "failed: {:#}", err.cause),
            TaskStatus::Skipped(SkipReason::BlockedBy(task)) => write!(f, "skipped: blocked by {task}"),
            TaskStatus::Skipped(SkipReason::Cancelled) => f.write_str("skipped: cancelled"),
        }
    }
}

/// The collaborators of one run, shared by every task in it.
pub struct Environment {
    pub(crate) config: Configuration,
    pub(crate) network: NetworkDefinition,
    pub(crate) compilers: Arc<CompilerManager>,
    pub(crate) rpc: NetworkClient,
    pub(crate) verifier: Option<Arc<dyn Verifier>>,
    pub(crate) harness: Option<Arc<dyn TestHarness>>,
}

/// What a task action sees while it runs.
pub struct TaskContext<'a> {
    pub(crate) definition: &'a TaskDefinition,
    pub(crate) args: &'a TaskArgs,
    pub(crate) env: &'a Environment,
    pub(crate) outputs: &'a HashMap<String, Dynamic>,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) span: tracing::Span,
}

impl<'a> TaskContext<'a> {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn args(&self) -> &TaskArgs {
        self.args
    }

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }

    /// Like [`arg`](Self::arg), but missing arguments are an error.
    pub fn require_arg(&self, name: &str) -> anyhow::Result<&str> {
        self.arg(name)
            .ok_or_else(|| anyhow!("task '{}' requires argument '{name}'", self.name()))
    }

    pub fn config(&self) -> &Configuration {
        &self.env.config
    }

    /// The active network of this run.
    pub fn network(&self) -> &NetworkDefinition {
        &self.env.network
    }

    pub fn compilers(&self) -> &CompilerManager {
        &self.env.compilers
    }

    pub fn rpc(&self) -> &NetworkClient {
        &self.env.rpc
    }

    pub fn verifier(&self) -> Result<&dyn Verifier, VerificationError> {
        self.env.verifier.as_deref().ok_or(VerificationError::NoVerifier)
    }

    pub fn harness(&self) -> Option<&dyn TestHarness> {
        self.env.harness.as_deref()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The output of a task this one depends on.
    pub fn dependency<T: Send + Sync + 'static>(&self, task: &str) -> anyhow::Result<&T> {
        let output = self
            .outputs
            .get(task)
            .ok_or_else(|| anyhow!("'{task}' is not a dependency of '{}'", self.name()))?;

        output.downcast_ref::<T>().ok_or_else(|| {
            anyhow!(
                "output of '{task}' is not a {}",
                std::any::type_name::<T>()
            )
        })
    }

    /// Runs the definition this one overrides, with the same arguments.
    pub fn run_super<T: Send + Sync + 'static>(&self) -> anyhow::Result<Arc<T>> {
        let prior = self
            .definition
            .prior
            .as_deref()
            .ok_or_else(|| anyhow!("task '{}' does not override anything", self.name()))?;

        let context = TaskContext {
            definition: prior,
            args: self.args,
            env: self.env,
            outputs: self.outputs,
            cancel: self.cancel,
            span: self.span.clone(),
        };

        let output = (prior.action)(&context)
            .with_context(|| format!("overridden definition of '{}' failed", self.name()))?;

        output.downcast::<T>().map_err(|_| {
            anyhow!(
                "overridden '{}' did not return a {}",
                self.name(),
                std::any::type_name::<T>()
            )
        })
    }
}
