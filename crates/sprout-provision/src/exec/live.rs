//! Executes operations against the real host

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::process::Command;

use super::{ExecMode, Executor, FileKind, audit_mutation, audit_read, command_line};
use crate::error::{ProvisionError, Result};

/// Performs every operation for real
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveExecutor;

impl LiveExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Spawn `program` and collect stdout, failing on a non-zero exit.
    pub(crate) fn execute(op: &str, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ProvisionError::Command {
                op: op.to_string(),
                command: command_line(program, args),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::Command {
                op: op.to_string(),
                command: command_line(program, args),
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub(crate) fn inspect(op: &str, path: &Path) -> Result<Option<FileKind>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(Some(FileKind::Directory)),
            Ok(_) => Ok(Some(FileKind::File)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProvisionError::io(op, path, e)),
        }
    }

    pub(crate) fn load(op: &str, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| ProvisionError::io(op, path, e))
    }
}

impl Executor for LiveExecutor {
    fn mode(&self) -> ExecMode {
        ExecMode::Live
    }

    fn run(&self, op: &str, program: &str, args: &[&str]) -> Result<String> {
        audit_mutation(self.mode(), op, &command_line(program, args));
        Self::execute(op, program, args)
    }

    fn probe(&self, op: &str, program: &str, args: &[&str]) -> Result<String> {
        audit_read(self.mode(), op, &command_line(program, args));
        Self::execute(op, program, args)
    }

    fn stat(&self, op: &str, path: &Path) -> Result<Option<FileKind>> {
        audit_read(self.mode(), op, &format!("stat {}", path.display()));
        Self::inspect(op, path)
    }

    fn read_file(&self, op: &str, path: &Path) -> Result<String> {
        audit_read(self.mode(), op, &format!("read {}", path.display()));
        Self::load(op, path)
    }

    fn write_file(&self, op: &str, path: &Path, contents: &str) -> Result<()> {
        audit_mutation(self.mode(), op, &format!("write {}", path.display()));

        // Write beside the target and rename so readers never see a partial file
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| ProvisionError::io(op, dir, e))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| ProvisionError::io(op, tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| ProvisionError::io(op, path, e.error))?;
        Ok(())
    }

    fn append_file(&self, op: &str, path: &Path, contents: &str) -> Result<()> {
        audit_mutation(self.mode(), op, &format!("append to {}", path.display()));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProvisionError::io(op, path, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| ProvisionError::io(op, path, e))
    }

    fn copy_file(&self, op: &str, from: &Path, to: &Path) -> Result<()> {
        audit_mutation(
            self.mode(),
            op,
            &format!("copy {} -> {}", from.display(), to.display()),
        );
        fs::copy(from, to)
            .map(|_| ())
            .map_err(|e| ProvisionError::io(op, from, e))
    }

    fn rename(&self, op: &str, from: &Path, to: &Path) -> Result<()> {
        audit_mutation(
            self.mode(),
            op,
            &format!("rename {} -> {}", from.display(), to.display()),
        );
        fs::rename(from, to).map_err(|e| ProvisionError::io(op, from, e))
    }

    fn mkdir_all(&self, op: &str, path: &Path) -> Result<()> {
        audit_mutation(self.mode(), op, &format!("mkdir -p {}", path.display()));
        fs::create_dir_all(path).map_err(|e| ProvisionError::io(op, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_write_then_read_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        let exec = LiveExecutor::new();

        exec.write_file("Test.Write", &path, "line one\n").unwrap();
        exec.append_file("Test.Append", &path, "line two\n").unwrap();

        assert_eq!(
            exec.read_file("Test.Read", &path).unwrap(),
            "line one\nline two\n"
        );
        assert_eq!(
            exec.stat("Test.Stat", &path).unwrap(),
            Some(FileKind::File)
        );
        assert_eq!(
            exec.stat("Test.Stat", dir.path()).unwrap(),
            Some(FileKind::Directory)
        );
        assert_eq!(
            exec.stat("Test.Stat", &dir.path().join("missing")).unwrap(),
            None
        );
    }

    #[test]
    fn test_live_rename_and_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/replicas");
        let exec = LiveExecutor::new();

        exec.mkdir_all("Test.Mkdir", &nested).unwrap();
        let moved = dir.path().join("a/b/replicas.backup");
        exec.rename("Test.Rename", &nested, &moved).unwrap();

        assert!(moved.is_dir());
        assert!(!nested.exists());
    }

    #[test]
    fn test_live_missing_program_is_command_error() {
        let exec = LiveExecutor::new();
        let err = exec
            .probe("Test.Missing", "sprout-no-such-program", &[])
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Command { .. }));
    }
}
