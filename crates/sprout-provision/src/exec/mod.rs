//! Execution abstraction
//!
//! Every command and filesystem mutation the provisioner performs goes through
//! an [`Executor`]. One implementation exists per [`ExecMode`] and is chosen
//! once at startup:
//!
//! - [`LiveExecutor`]: performs the operation for real
//! - [`DryRunExecutor`]: logs mutations and returns synthetic success, reads stay live
//! - [`MockExecutor`]: answers from a [`MockFixture`] keyed by operation id
//!
//! Operation ids follow `<Area>.<Operation>[.<subject>]`, for example
//! `PrepareDisks.Format./dev/sdb`. They name the call in the run log and are
//! the lookup key in mock mode.

mod dry_run;
mod live;
mod mock;

pub use dry_run::DryRunExecutor;
pub use live::LiveExecutor;
pub use mock::{Invocation, MockExecutor, MockFixture, MockOutcome};

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ProvisionError, Result};

/// How operations are carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Live,
    DryRun,
    Mock,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::DryRun => "dry-run",
            Self::Mock => "mock",
        })
    }
}

/// What a path points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    #[serde(alias = "dir")]
    Directory,
}

/// Capability wrapper around host mutations
///
/// `run` and the write-style methods mutate the host. `probe`, `stat` and
/// `read_file` only observe it and always see real state outside of mock
/// mode, so branching logic behaves the same in a dry run.
pub trait Executor: Send + Sync {
    /// Mode this executor implements
    fn mode(&self) -> ExecMode;

    /// Run a command that changes the host, returning its stdout
    fn run(&self, op: &str, program: &str, args: &[&str]) -> Result<String>;

    /// Run a read-only command, returning its stdout
    fn probe(&self, op: &str, program: &str, args: &[&str]) -> Result<String>;

    /// Inspect a path; `None` when it does not exist
    fn stat(&self, op: &str, path: &Path) -> Result<Option<FileKind>>;

    /// Read a whole file as UTF-8
    fn read_file(&self, op: &str, path: &Path) -> Result<String>;

    /// Replace a file's contents
    fn write_file(&self, op: &str, path: &Path, contents: &str) -> Result<()>;

    /// Append to a file, creating it when missing
    fn append_file(&self, op: &str, path: &Path, contents: &str) -> Result<()>;

    /// Copy a file
    fn copy_file(&self, op: &str, from: &Path, to: &Path) -> Result<()>;

    /// Rename a file or directory
    fn rename(&self, op: &str, from: &Path, to: &Path) -> Result<()>;

    /// Create a directory and its parents
    fn mkdir_all(&self, op: &str, path: &Path) -> Result<()>;
}

/// Interpret a probe used as an exit-status check.
///
/// A failed command means "no"; anything else (a missing mock, an I/O
/// failure) is still an error.
pub fn succeeded(result: Result<String>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(ProvisionError::Command { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Render a program and its arguments for logs and error messages.
pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Record a mutating call on the run log.
pub(crate) fn audit_mutation(mode: ExecMode, op: &str, action: &str) {
    match mode {
        ExecMode::DryRun => tracing::info!(%mode, op, "[DRY-RUN] {action}"),
        _ => tracing::info!(%mode, op, "{action}"),
    }
}

/// Record a read-only call on the run log.
pub(crate) fn audit_read(mode: ExecMode, op: &str, action: &str) {
    tracing::debug!(%mode, op, "{action}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeded_maps_command_failure_to_false() {
        let failed = Err(ProvisionError::Command {
            op: "Check".into(),
            command: "false".into(),
            message: "exit 1".into(),
        });
        assert!(!succeeded(failed).unwrap());
        assert!(succeeded(Ok(String::new())).unwrap());
    }

    #[test]
    fn test_succeeded_keeps_missing_mock_as_error() {
        let missing = Err(ProvisionError::MockNotRegistered("Check".into()));
        assert!(matches!(
            succeeded(missing),
            Err(ProvisionError::MockNotRegistered(_))
        ));
    }

    #[test]
    fn test_exec_mode_display() {
        assert_eq!(ExecMode::DryRun.to_string(), "dry-run");
        assert_eq!(ExecMode::Live.to_string(), "live");
        assert_eq!(ExecMode::Mock.to_string(), "mock");
    }
}
