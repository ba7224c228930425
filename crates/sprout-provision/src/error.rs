//! Error types for node provisioning.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while planning or running a provisioning pass.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// One or more configuration problems, reported together before any step runs.
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    /// The step catalogue itself is malformed.
    #[error("invalid step catalogue: {0}")]
    Catalogue(String),

    /// An external command exited unsuccessfully or could not be spawned.
    #[error("{op}: `{command}` failed: {message}")]
    Command {
        op: String,
        command: String,
        message: String,
    },

    /// A filesystem operation failed.
    #[error("{op}: {path}: {source}")]
    Io {
        op: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Mock mode was asked for an operation the fixture does not register.
    #[error("no mock registered for operation '{0}'")]
    MockNotRegistered(String),

    /// The mock fixture could not be parsed.
    #[error("invalid mock fixture: {0}")]
    Fixture(#[from] serde_yaml::Error),

    /// A configuration template failed to render.
    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    /// A step action failed for a domain reason.
    #[error("{0}")]
    Step(String),
}

impl ProvisionError {
    /// Build an [`ProvisionError::Io`] for `op` on `path`.
    pub fn io(op: &str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op: op.to_string(),
            path: path.into(),
            source,
        }
    }

    /// Build a [`ProvisionError::Step`] from anything displayable.
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
