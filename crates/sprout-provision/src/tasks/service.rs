//! Systemd service management tasks

use super::Task;
use crate::error::Result;
use crate::exec::{Executor, succeeded};

/// Ensure a systemd service is enabled and/or started
#[derive(Debug, Clone)]
pub struct EnsureService {
    /// Service name
    pub name: String,
    /// Whether to enable the service
    pub enabled: bool,
    /// Whether to start the service
    pub started: bool,
    /// Description
    description: String,
}

impl EnsureService {
    /// Create a new service task (enabled and started by default)
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let description = format!("Ensure service {name}");
        Self {
            name,
            enabled: true,
            started: true,
            description,
        }
    }

    /// Set whether the service should be enabled
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set whether the service should be started
    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    fn op(&self, action: &str) -> String {
        format!("Service.{action}.{}", self.name)
    }

    fn is_enabled(&self, exec: &dyn Executor) -> Result<bool> {
        succeeded(exec.probe(
            &self.op("IsEnabled"),
            "systemctl",
            &["is-enabled", "--quiet", &self.name],
        ))
    }

    fn is_active(&self, exec: &dyn Executor) -> Result<bool> {
        succeeded(exec.probe(
            &self.op("IsActive"),
            "systemctl",
            &["is-active", "--quiet", &self.name],
        ))
    }
}

impl Task for EnsureService {
    fn description(&self) -> &str {
        &self.description
    }

    fn is_satisfied(&self, exec: &dyn Executor) -> Result<bool> {
        if self.enabled && !self.is_enabled(exec)? {
            return Ok(false);
        }
        if self.started && !self.is_active(exec)? {
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(&self, exec: &dyn Executor) -> Result<()> {
        if self.enabled && !self.is_enabled(exec)? {
            exec.run(&self.op("Enable"), "systemctl", &["enable", &self.name])?;
        }
        if self.started && !self.is_active(exec)? {
            exec.run(&self.op("Start"), "systemctl", &["start", &self.name])?;
        }
        Ok(())
    }
}
