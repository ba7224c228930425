//! Package installation tasks

use super::Task;
use crate::error::Result;
use crate::exec::{Executor, succeeded};

/// Where a package comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageSource {
    /// Distribution package via apt
    Apt,
    /// Snap package, optionally with classic confinement
    Snap { classic: bool },
}

/// Install a package if it is missing
#[derive(Debug, Clone)]
pub struct InstallPackage {
    /// Package name
    pub name: String,
    /// Package manager
    pub source: PackageSource,
    /// Description override
    description: String,
}

impl InstallPackage {
    /// Install an apt package
    pub fn apt(name: impl Into<String>) -> Self {
        Self::new(name, PackageSource::Apt)
    }

    /// Install a snap
    pub fn snap(name: impl Into<String>, classic: bool) -> Self {
        Self::new(name, PackageSource::Snap { classic })
    }

    fn new(name: impl Into<String>, source: PackageSource) -> Self {
        let name = name.into();
        let description = format!("Install {name}");
        Self {
            name,
            source,
            description,
        }
    }

    fn op(&self, action: &str) -> String {
        format!("Package.{action}.{}", self.name)
    }
}

impl Task for InstallPackage {
    fn description(&self) -> &str {
        &self.description
    }

    fn is_satisfied(&self, exec: &dyn Executor) -> Result<bool> {
        let probe = match self.source {
            PackageSource::Apt => exec.probe(&self.op("Check"), "dpkg", &["-s", &self.name]),
            PackageSource::Snap { .. } => {
                exec.probe(&self.op("Check"), "snap", &["list", &self.name])
            }
        };
        succeeded(probe)
    }

    fn apply(&self, exec: &dyn Executor) -> Result<()> {
        match self.source {
            PackageSource::Apt => {
                exec.run(
                    &self.op("Install"),
                    "apt-get",
                    &["install", "-y", &self.name],
                )?;
            }
            PackageSource::Snap { classic } => {
                let mut args = vec!["install", self.name.as_str()];
                if classic {
                    args.push("--classic");
                }
                exec.run(&self.op("Install"), "snap", &args)?;
            }
        }
        Ok(())
    }
}
