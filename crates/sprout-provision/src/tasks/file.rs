//! File management tasks

use std::path::{Path, PathBuf};

use super::Task;
use crate::error::Result;
use crate::exec::Executor;

/// Write a file with specified content
#[derive(Debug, Clone)]
pub struct WriteFile {
    /// File path
    pub path: PathBuf,
    /// File content
    pub content: String,
    /// File permissions (e.g., "0644")
    pub permissions: Option<String>,
    /// Description
    description: String,
}

impl WriteFile {
    /// Create a new file write task
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        let description = format!("Write {}", path.display());
        Self {
            path,
            content: content.into(),
            permissions: None,
            description,
        }
    }

    /// Set file permissions
    pub fn with_permissions(mut self, perms: impl Into<String>) -> Self {
        self.permissions = Some(perms.into());
        self
    }

    fn op(&self, action: &str) -> String {
        format!("File.{action}.{}", self.path.display())
    }
}

impl Task for WriteFile {
    fn description(&self) -> &str {
        &self.description
    }

    fn is_satisfied(&self, exec: &dyn Executor) -> Result<bool> {
        if exec.stat(&self.op("Stat"), &self.path)?.is_none() {
            return Ok(false);
        }
        let current = exec.read_file(&self.op("Read"), &self.path)?;
        if current != self.content {
            return Ok(false);
        }
        let Some(perms) = &self.permissions else {
            return Ok(true);
        };
        let path = self.path.display().to_string();
        let mode = exec.probe(&self.op("Mode"), "stat", &["-c", "%a", &path])?;
        Ok(same_mode(mode.trim(), perms))
    }

    fn apply(&self, exec: &dyn Executor) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| *p != Path::new("")) {
            exec.mkdir_all(&self.op("CreateParent"), parent)?;
        }
        exec.write_file(&self.op("Write"), &self.path, &self.content)?;

        if let Some(perms) = &self.permissions {
            let path = self.path.display().to_string();
            exec.run(&self.op("Chmod"), "chmod", &[perms, &path])?;
        }
        Ok(())
    }
}

/// Octal modes compare equal regardless of leading zeros (`0600` and `600`)
fn same_mode(actual: &str, wanted: &str) -> bool {
    actual.trim_start_matches('0') == wanted.trim_start_matches('0')
}
