//! Canned results for tests and rehearsals

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;

use super::{ExecMode, Executor, FileKind, audit_mutation, audit_read, command_line};
use crate::error::{ProvisionError, Result};

/// Registered result for one operation id
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MockOutcome {
    /// Stdout for commands, contents for `read_file`
    #[serde(default)]
    pub output: Option<String>,
    /// When set, the operation fails with this message
    #[serde(default)]
    pub error: Option<String>,
    /// Answer for `stat`; unset means the path is absent
    #[serde(default)]
    pub kind: Option<FileKind>,
}

/// Table of operation id to outcome
///
/// Loaded from YAML of the shape:
///
/// ```yaml
/// mocks:
///   PrepareDisks.CheckFilesystem./dev/sdb:
///     output: ""
///   PrepareDisks.CheckReplicas./mnt/storage1:
///     kind: directory
///   PrepareDisks.Mount./dev/sdb:
///     error: "mount: wrong fs type"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockFixture {
    #[serde(default)]
    mocks: BTreeMap<String, MockOutcome>,
}

impl MockFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a fixture from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a fixture file
    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::io("Mock.LoadFixture", path, e))?;
        Self::from_yaml(&yaml)
    }

    /// Register an outcome, replacing any earlier one for `op`
    pub fn register(mut self, op: impl Into<String>, outcome: MockOutcome) -> Self {
        self.mocks.insert(op.into(), outcome);
        self
    }

    /// Succeed with `output`
    pub fn output(self, op: impl Into<String>, output: impl Into<String>) -> Self {
        self.register(
            op,
            MockOutcome {
                output: Some(output.into()),
                ..MockOutcome::default()
            },
        )
    }

    /// Succeed with no output
    pub fn ok(self, op: impl Into<String>) -> Self {
        self.output(op, "")
    }

    /// Fail with `message`
    pub fn failure(self, op: impl Into<String>, message: impl Into<String>) -> Self {
        self.register(
            op,
            MockOutcome {
                error: Some(message.into()),
                ..MockOutcome::default()
            },
        )
    }

    /// Answer a `stat` with an existing path of `kind`
    pub fn path(self, op: impl Into<String>, kind: FileKind) -> Self {
        self.register(
            op,
            MockOutcome {
                kind: Some(kind),
                ..MockOutcome::default()
            },
        )
    }

    /// Answer a `stat` with a missing path
    pub fn absent(self, op: impl Into<String>) -> Self {
        self.register(op, MockOutcome::default())
    }

    pub fn get(&self, op: &str) -> Option<&MockOutcome> {
        self.mocks.get(op)
    }

    pub fn len(&self) -> usize {
        self.mocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mocks.is_empty()
    }
}

/// One call seen by the [`MockExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub op: String,
    pub action: String,
}

/// Answers every call from a [`MockFixture`] and journals it
#[derive(Debug, Default)]
pub struct MockExecutor {
    fixture: MockFixture,
    journal: Mutex<Vec<Invocation>>,
}

impl MockExecutor {
    pub fn new(fixture: MockFixture) -> Self {
        Self {
            fixture,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Every call so far, in order
    pub fn invocations(&self) -> Vec<Invocation> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times `op` was called
    pub fn count(&self, op: &str) -> usize {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|i| i.op == op)
            .count()
    }

    pub fn was_called(&self, op: &str) -> bool {
        self.count(op) > 0
    }

    /// Calls whose id starts with `prefix`
    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<Invocation> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|i| i.op.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn lookup(&self, op: &str, action: String, mutating: bool) -> Result<&MockOutcome> {
        if mutating {
            audit_mutation(ExecMode::Mock, op, &action);
        } else {
            audit_read(ExecMode::Mock, op, &action);
        }
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Invocation {
                op: op.to_string(),
                action,
            });
        self.fixture
            .get(op)
            .ok_or_else(|| ProvisionError::MockNotRegistered(op.to_string()))
    }

    fn command(&self, op: &str, program: &str, args: &[&str], mutating: bool) -> Result<String> {
        let command = command_line(program, args);
        let outcome = self.lookup(op, command.clone(), mutating)?;
        match &outcome.error {
            Some(message) => Err(ProvisionError::Command {
                op: op.to_string(),
                command,
                message: message.clone(),
            }),
            None => Ok(outcome.output.clone().unwrap_or_default()),
        }
    }

    fn fs_op(&self, op: &str, path: &Path, action: String, mutating: bool) -> Result<&MockOutcome> {
        let outcome = self.lookup(op, action, mutating)?;
        match &outcome.error {
            Some(message) => Err(ProvisionError::io(op, path, io::Error::other(message.clone()))),
            None => Ok(outcome),
        }
    }
}

impl Executor for MockExecutor {
    fn mode(&self) -> ExecMode {
        ExecMode::Mock
    }

    fn run(&self, op: &str, program: &str, args: &[&str]) -> Result<String> {
        self.command(op, program, args, true)
    }

    fn probe(&self, op: &str, program: &str, args: &[&str]) -> Result<String> {
        self.command(op, program, args, false)
    }

    fn stat(&self, op: &str, path: &Path) -> Result<Option<FileKind>> {
        let outcome = self.fs_op(op, path, format!("stat {}", path.display()), false)?;
        Ok(outcome.kind)
    }

    fn read_file(&self, op: &str, path: &Path) -> Result<String> {
        let outcome = self.fs_op(op, path, format!("read {}", path.display()), false)?;
        Ok(outcome.output.clone().unwrap_or_default())
    }

    fn write_file(&self, op: &str, path: &Path, contents: &str) -> Result<()> {
        self.fs_op(
            op,
            path,
            format!("write {}: {}", path.display(), contents),
            true,
        )
        .map(|_| ())
    }

    fn append_file(&self, op: &str, path: &Path, contents: &str) -> Result<()> {
        self.fs_op(
            op,
            path,
            format!("append to {}: {}", path.display(), contents),
            true,
        )
        .map(|_| ())
    }

    fn copy_file(&self, op: &str, from: &Path, to: &Path) -> Result<()> {
        self.fs_op(
            op,
            from,
            format!("copy {} -> {}", from.display(), to.display()),
            true,
        )
        .map(|_| ())
    }

    fn rename(&self, op: &str, from: &Path, to: &Path) -> Result<()> {
        self.fs_op(
            op,
            from,
            format!("rename {} -> {}", from.display(), to.display()),
            true,
        )
        .map(|_| ())
    }

    fn mkdir_all(&self, op: &str, path: &Path) -> Result<()> {
        self.fs_op(op, path, format!("mkdir -p {}", path.display()), true)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_registration_fails_immediately() {
        let exec = MockExecutor::new(MockFixture::new());
        let err = exec
            .run("PrepareDisks.Format./dev/sdb", "mkfs.ext4", &["-F", "/dev/sdb"])
            .unwrap_err();
        assert!(
            matches!(err, ProvisionError::MockNotRegistered(ref op) if op == "PrepareDisks.Format./dev/sdb")
        );
    }

    #[test]
    fn test_fixture_from_yaml() {
        let fixture = MockFixture::from_yaml(
            r#"
mocks:
  PrepareDisks.GetUuid./dev/sdb:
    output: "1234-abcd\n"
  PrepareDisks.CheckReplicas./mnt/storage1:
    kind: directory
  PrepareDisks.CheckStorageConfig./mnt/storage1:
    kind: file
  PrepareDisks.Mount./dev/sdb:
    error: "mount: wrong fs type"
"#,
        )
        .unwrap();
        assert_eq!(fixture.len(), 4);

        let exec = MockExecutor::new(fixture);
        assert_eq!(
            exec.probe("PrepareDisks.GetUuid./dev/sdb", "blkid", &[])
                .unwrap(),
            "1234-abcd\n"
        );
        assert_eq!(
            exec.stat(
                "PrepareDisks.CheckReplicas./mnt/storage1",
                Path::new("/mnt/storage1/replicas")
            )
            .unwrap(),
            Some(FileKind::Directory)
        );
        assert_eq!(
            exec.stat(
                "PrepareDisks.CheckStorageConfig./mnt/storage1",
                Path::new("/mnt/storage1/longhorn-disk.cfg")
            )
            .unwrap(),
            Some(FileKind::File)
        );
        assert!(matches!(
            exec.run("PrepareDisks.Mount./dev/sdb", "mount", &[]),
            Err(ProvisionError::Command { .. })
        ));
    }

    #[test]
    fn test_journal_records_every_call() {
        let exec = MockExecutor::new(
            MockFixture::new()
                .ok("Test.First")
                .absent("Test.Second"),
        );
        exec.run("Test.First", "true", &[]).unwrap();
        exec.stat("Test.Second", Path::new("/nope")).unwrap();
        let _ = exec.run("Test.Third", "true", &[]);

        let ops: Vec<String> = exec.invocations().into_iter().map(|i| i.op).collect();
        assert_eq!(ops, ["Test.First", "Test.Second", "Test.Third"]);
        assert_eq!(exec.count("Test.First"), 1);
    }
}
