//! Generic command execution tasks

use super::Task;
use crate::error::Result;
use crate::exec::{Executor, succeeded};

/// Run a shell command with optional idempotency guard
#[derive(Debug, Clone)]
pub struct RunCommand {
    /// Short name, the subject of the operation ids
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Command to execute (`sh -c`)
    pub command: String,
    /// If this command succeeds (exit 0), skip running `command`
    pub unless: Option<String>,
}

impl RunCommand {
    /// Create a new command task
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            command: command.into(),
            unless: None,
        }
    }

    /// Add an idempotency guard
    pub fn unless(mut self, check: impl Into<String>) -> Self {
        self.unless = Some(check.into());
        self
    }

    /// Run the command, returning its output
    pub fn output(&self, exec: &dyn Executor) -> Result<String> {
        exec.run(&format!("Command.Run.{}", self.name), "sh", &["-c", &self.command])
    }
}

impl Task for RunCommand {
    fn description(&self) -> &str {
        &self.description
    }

    fn is_satisfied(&self, exec: &dyn Executor) -> Result<bool> {
        match &self.unless {
            Some(check) => succeeded(exec.probe(
                &format!("Command.Check.{}", self.name),
                "sh",
                &["-c", check],
            )),
            None => Ok(false),
        }
    }

    fn apply(&self, exec: &dyn Executor) -> Result<()> {
        self.output(exec).map(|_| ())
    }
}
