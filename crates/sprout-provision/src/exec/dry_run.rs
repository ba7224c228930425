//! Logs mutations instead of performing them

use std::path::Path;

use super::{ExecMode, Executor, FileKind, LiveExecutor, audit_mutation, audit_read, command_line};
use crate::error::Result;

/// Records what a live run would change
///
/// Mutations are logged with their full parameters and report success with
/// empty output. Reads go to the real host so callers branch on real state;
/// nothing here invents filesystem state.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for DryRunExecutor {
    fn mode(&self) -> ExecMode {
        ExecMode::DryRun
    }

    fn run(&self, op: &str, program: &str, args: &[&str]) -> Result<String> {
        audit_mutation(self.mode(), op, &command_line(program, args));
        Ok(String::new())
    }

    fn probe(&self, op: &str, program: &str, args: &[&str]) -> Result<String> {
        audit_read(self.mode(), op, &command_line(program, args));
        LiveExecutor::execute(op, program, args)
    }

    fn stat(&self, op: &str, path: &Path) -> Result<Option<FileKind>> {
        audit_read(self.mode(), op, &format!("stat {}", path.display()));
        LiveExecutor::inspect(op, path)
    }

    fn read_file(&self, op: &str, path: &Path) -> Result<String> {
        audit_read(self.mode(), op, &format!("read {}", path.display()));
        LiveExecutor::load(op, path)
    }

    fn write_file(&self, op: &str, path: &Path, contents: &str) -> Result<()> {
        audit_mutation(
            self.mode(),
            op,
            &format!("write {} ({} bytes)", path.display(), contents.len()),
        );
        Ok(())
    }

    fn append_file(&self, op: &str, path: &Path, contents: &str) -> Result<()> {
        audit_mutation(
            self.mode(),
            op,
            &format!("append to {}: {}", path.display(), contents.trim_end()),
        );
        Ok(())
    }

    fn copy_file(&self, op: &str, from: &Path, to: &Path) -> Result<()> {
        audit_mutation(
            self.mode(),
            op,
            &format!("copy {} -> {}", from.display(), to.display()),
        );
        Ok(())
    }

    fn rename(&self, op: &str, from: &Path, to: &Path) -> Result<()> {
        audit_mutation(
            self.mode(),
            op,
            &format!("rename {} -> {}", from.display(), to.display()),
        );
        Ok(())
    }

    fn mkdir_all(&self, op: &str, path: &Path) -> Result<()> {
        audit_mutation(self.mode(), op, &format!("mkdir -p {}", path.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_leaves_host_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let exec = DryRunExecutor::new();

        exec.write_file("Test.Write", &path, "cni: cilium\n").unwrap();
        exec.mkdir_all("Test.Mkdir", &dir.path().join("mnt/disk0"))
            .unwrap();
        assert_eq!(exec.run("Test.Format", "mkfs.ext4", &["-F", "/dev/sdz"]).unwrap(), "");

        assert!(!path.exists());
        assert!(!dir.path().join("mnt").exists());
    }

    #[test]
    fn test_dry_run_reads_real_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        std::fs::write(&path, "# static\n").unwrap();
        let exec = DryRunExecutor::new();

        assert_eq!(exec.stat("Test.Stat", &path).unwrap(), Some(FileKind::File));
        assert_eq!(exec.read_file("Test.Read", &path).unwrap(), "# static\n");
    }
}
