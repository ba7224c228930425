//! Directory management tasks

use std::path::PathBuf;

use super::Task;
use crate::error::Result;
use crate::exec::{Executor, FileKind};

/// Ensure a directory exists
#[derive(Debug, Clone)]
pub struct EnsureDirectory {
    /// Directory path
    pub path: PathBuf,
    /// Directory mode (e.g., "0755")
    pub mode: Option<String>,
    /// Description
    description: String,
}

impl EnsureDirectory {
    /// Create a new directory task
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let description = format!("Create directory {}", path.display());
        Self {
            path,
            mode: None,
            description,
        }
    }

    /// Set directory mode
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    fn op(&self, action: &str) -> String {
        format!("Directory.{action}.{}", self.path.display())
    }
}

impl Task for EnsureDirectory {
    fn description(&self) -> &str {
        &self.description
    }

    fn is_satisfied(&self, exec: &dyn Executor) -> Result<bool> {
        Ok(exec.stat(&self.op("Stat"), &self.path)? == Some(FileKind::Directory))
    }

    fn apply(&self, exec: &dyn Executor) -> Result<()> {
        exec.mkdir_all(&self.op("Create"), &self.path)?;
        if let Some(mode) = &self.mode {
            let path = self.path.display().to_string();
            exec.run(&self.op("Chmod"), "chmod", &[mode, &path])?;
        }
        Ok(())
    }
}
