//! Idempotent host tasks
//!
//! Each task implements the [`Task`] trait: it can tell whether the host
//! already matches the desired state and, if not, bring it there through an
//! [`Executor`]. Step actions are built from these.

mod command;
mod directory;
mod file;
mod firewall;
mod package;
mod service;

pub use command::RunCommand;
pub use directory::EnsureDirectory;
pub use file::WriteFile;
pub use firewall::{AllowPort, EnsureFirewall, Protocol};
pub use package::{InstallPackage, PackageSource};
pub use service::EnsureService;

use crate::error::Result;
use crate::exec::Executor;

/// Result of ensuring a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// Host was changed
    Applied,
    /// Host already matched, nothing done
    Satisfied,
}

/// A single idempotent change to the host
///
/// All tasks must be:
/// - **Idempotent**: Safe to run multiple times
/// - **Describable**: Have a human-readable description
/// - **Checkable**: Report whether they are already satisfied
pub trait Task {
    /// Human-readable description of what this task does
    fn description(&self) -> &str;

    /// Whether the host already matches the desired state
    fn is_satisfied(&self, exec: &dyn Executor) -> Result<bool>;

    /// Make the change
    fn apply(&self, exec: &dyn Executor) -> Result<()>;
}

/// Check, then apply only when needed
pub fn ensure(exec: &dyn Executor, task: &dyn Task) -> Result<TaskResult> {
    if task.is_satisfied(exec)? {
        tracing::debug!(task = task.description(), "already satisfied");
        return Ok(TaskResult::Satisfied);
    }
    tracing::info!(task = task.description(), "applying");
    task.apply(exec)?;
    Ok(TaskResult::Applied)
}

/// Ensure every task in order, stopping at the first error
pub fn ensure_all(exec: &dyn Executor, tasks: &[&dyn Task]) -> Result<usize> {
    let mut applied = 0;
    for task in tasks {
        if ensure(exec, *task)? == TaskResult::Applied {
            applied += 1;
        }
    }
    Ok(applied)
}
