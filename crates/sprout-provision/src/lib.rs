//! Sprout Provision - Node Installation Library
//!
//! This crate turns a bare Ubuntu host into an RKE2 Kubernetes node with
//! Longhorn storage. Installation is an ordered list of idempotent steps run
//! against an [`Executor`], so the same steps drive a real host, a dry run
//! or a scripted mock.
//!
//! # Architecture
//!
//! - [`exec`] module: live, dry-run and mock executors behind one trait
//! - [`tasks`] module: check-then-apply primitives (packages, files, services, firewall)
//! - [`disks`] module: disk discovery, formatting, mounting and the storage node label
//! - [`Catalogue`]: the ordered, phase-tagged installation steps
//! - [`Orchestrator`]: step filtering and fail-fast execution
//! - [`runlog`] / [`monitor`] modules: step markers in the run log and their readers
//! - [`NodeConfig`]: configuration for one node
//!
//! # Example
//!
//! ```ignore
//! use sprout_provision::{Catalogue, LiveExecutor, NodeConfig, Orchestrator, SelectAll, StepContext};
//!
//! let config = NodeConfig::builder()
//!     .cluster_disks(["/dev/nvme1n1"])
//!     .domain("cluster.example.com")
//!     .build();
//!
//! let orchestrator = Orchestrator::plan(Catalogue::standard()?, &config)?;
//! let exec = LiveExecutor::new();
//! let mut ctx = StepContext::new(&config, &exec, &SelectAll);
//! let report = orchestrator.run(&mut ctx, &mut Vec::new());
//! ```

pub mod catalogue;
pub mod config;
pub mod disks;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod orchestrator;
pub mod runlog;
pub mod tasks;

pub use catalogue::{Catalogue, Phase, RunState, Step, StepContext, StepOutcome};
pub use config::{NodeConfig, NodeConfigBuilder};
pub use disks::{DiskCandidate, DiskSelector, SelectAll};
pub use error::{ProvisionError, Result};
pub use exec::{DryRunExecutor, ExecMode, Executor, LiveExecutor, MockExecutor, MockFixture};
pub use monitor::{LogWatcher, RunStatus};
pub use orchestrator::{
    Failure, Orchestrator, ProgressSink, RunReport, StepFilter, StepRecord, StepStatus,
};
pub use runlog::{EventKind, StepEvent, parse_marker};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::NODE_LABEL_DROP_IN;
    use crate::exec::FileKind;

    const STAMP: &str = "20260101-120000";
    const ROOT_FSTAB: &str = "UUID=root-uuid / ext4 errors=remount-ro 0 1\n";
    const PROC_MOUNTS: &str = "/dev/nvme0n1p2 / ext4 rw,relatime 0 0\n";

    fn disk_steps(config: NodeConfig) -> NodeConfig {
        let mut config = config;
        config.enabled_steps = vec![
            "select-disks".into(),
            "prepare-disks".into(),
            "generate-node-labels".into(),
        ];
        config
    }

    fn with_label_drop_in(fixture: MockFixture) -> MockFixture {
        fixture
            .absent(format!("File.Stat.{NODE_LABEL_DROP_IN}"))
            .ok(format!("File.CreateParent.{NODE_LABEL_DROP_IN}"))
            .ok(format!("File.Write.{NODE_LABEL_DROP_IN}"))
            .ok(format!("File.Chmod.{NODE_LABEL_DROP_IN}"))
    }

    /// `/dev/<name>` is blank, unmounted and gets `uuid` once formatted
    fn blank_disk(fixture: MockFixture, device: &str, uuid: &str, mount_point: &str) -> MockFixture {
        fixture
            .output(format!("PrepareDisks.CheckFilesystem.{device}"), "\n")
            .output(format!("PrepareDisks.CheckPartitions.{device}"), "\n")
            .ok(format!("PrepareDisks.Format.{device}"))
            .output(format!("PrepareDisks.GetUuid.{device}"), format!("{uuid}\n"))
            .output(format!("PrepareDisks.CurrentMount.{device}"), "")
            .ok(format!("PrepareDisks.CreateMountPoint.{device}"))
            .ok(format!("PrepareDisks.Mount.{device}"))
            .absent(format!("PrepareDisks.CheckStorageConfig.{mount_point}"))
            .absent(format!("PrepareDisks.CheckReplicas.{mount_point}"))
            .output(format!("PersistMounts.GetUuid.{device}"), format!("{uuid}\n"))
            .ok(format!("PersistMounts.AppendFstab.{device}"))
    }

    fn run(config: &NodeConfig, exec: &MockExecutor) -> (RunReport, RunState) {
        let orchestrator = Orchestrator::plan(Catalogue::standard().unwrap(), config).unwrap();
        let mut ctx = StepContext::new(config, exec, &SelectAll).with_stamp(STAMP);
        let report = orchestrator.run(&mut ctx, &mut Vec::new());
        (report, ctx.state)
    }

    #[test]
    fn test_fresh_single_disk() {
        let config = disk_steps(NodeConfig::test_config());
        let fixture = blank_disk(MockFixture::new(), "/dev/sdb", "1111-aaaa", "/mnt/disk0")
            .output("PrepareDisks.ReadFstab", ROOT_FSTAB)
            .output("PrepareDisks.ReadMounts", PROC_MOUNTS)
            .output("PersistMounts.ReadFstab", ROOT_FSTAB)
            .ok("PersistMounts.BackupFstab")
            .ok("PersistMounts.MountAll");
        let exec = MockExecutor::new(with_label_drop_in(fixture));
        let (report, state) = run(&config, &exec);

        assert!(report.succeeded(), "{:?}", report.failure);
        assert_eq!(exec.count("PrepareDisks.Format./dev/sdb"), 1);
        assert_eq!(exec.count("PrepareDisks.GetUuid./dev/sdb"), 1);
        assert_eq!(exec.count("PersistMounts.AppendFstab./dev/sdb"), 1);
        assert_eq!(state.mounted[0].mount_point, "/mnt/disk0");
        assert_eq!(state.storage_label.as_ref().unwrap().encode(), "disk0");

        let append = &exec.calls_with_prefix("PersistMounts.AppendFstab.")[0];
        assert!(append.action.contains(
            "UUID=1111-aaaa /mnt/disk0 ext4 defaults,nofail 0 2 # managed by sprout"
        ));
        let labels = &exec.calls_with_prefix("File.Write.")[0];
        assert!(labels.action.contains("sprout.io/longhorn-disks=disk0"));
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let fstab = format!(
            "{ROOT_FSTAB}UUID=1111-aaaa /mnt/disk0 ext4 defaults,nofail 0 2 # managed by sprout\n"
        );
        let mounts = format!("{PROC_MOUNTS}/dev/sdb /mnt/disk0 ext4 rw 0 0\n");
        let config = disk_steps(NodeConfig::test_config());
        let fixture = MockFixture::new()
            .output("PrepareDisks.ReadFstab", &fstab)
            .output("PrepareDisks.ReadMounts", mounts)
            .output("PrepareDisks.CheckFilesystem./dev/sdb", "ext4\n")
            .output("PrepareDisks.GetUuid./dev/sdb", "1111-aaaa\n")
            .output("PrepareDisks.CurrentMount./dev/sdb", "/mnt/disk0\n")
            .absent("PrepareDisks.CheckStorageConfig./mnt/disk0")
            .absent("PrepareDisks.CheckReplicas./mnt/disk0")
            .output("PersistMounts.ReadFstab", &fstab)
            .ok("PersistMounts.MountAll");
        let exec = MockExecutor::new(with_label_drop_in(fixture));
        let (report, state) = run(&config, &exec);

        assert!(report.succeeded(), "{:?}", report.failure);
        for op in [
            "PrepareDisks.Format./dev/sdb",
            "PrepareDisks.Mount./dev/sdb",
            "PersistMounts.BackupFstab",
            "PersistMounts.AppendFstab./dev/sdb",
        ] {
            assert!(!exec.was_called(op), "{op} should not run again");
        }
        assert_eq!(state.storage_label.unwrap().encode(), "disk0");
    }

    #[test]
    fn test_new_disks_continue_past_existing_mounts() {
        let fstab = format!(
            "{ROOT_FSTAB}\
             UUID=old-0 /mnt/disk0 ext4 defaults,nofail 0 2 # managed by sprout\n\
             UUID=old-1 /mnt/disk1 ext4 defaults,nofail 0 2 # managed by sprout\n"
        );
        let mut config = disk_steps(NodeConfig::test_config());
        config.cluster_disks = vec!["/dev/sdb".into(), "/dev/sdc".into()];
        let fixture = blank_disk(MockFixture::new(), "/dev/sdb", "2222-bbbb", "/mnt/disk2");
        let fixture = blank_disk(fixture, "/dev/sdc", "3333-cccc", "/mnt/disk3")
            .output("PrepareDisks.ReadFstab", &fstab)
            .output("PrepareDisks.ReadMounts", PROC_MOUNTS)
            .output("PersistMounts.ReadFstab", &fstab)
            .ok("PersistMounts.BackupFstab")
            .ok("PersistMounts.MountAll");
        let exec = MockExecutor::new(with_label_drop_in(fixture));
        let (report, state) = run(&config, &exec);

        assert!(report.succeeded(), "{:?}", report.failure);
        let points: Vec<_> = state.mounted.iter().map(|d| d.mount_point.as_str()).collect();
        assert_eq!(points, ["/mnt/disk2", "/mnt/disk3"]);
        assert_eq!(state.storage_label.unwrap().encode(), "disk2xxxdisk3");
        assert_eq!(exec.count("PersistMounts.BackupFstab"), 1);
    }

    #[test]
    fn test_existing_replicas_are_moved_aside() {
        let mut config = NodeConfig::test_config();
        config.cluster_disks.clear();
        config.cluster_premounted_disks = vec!["/mnt/storage1".into()];
        config.enabled_steps = vec!["prepare-disks".into()];
        let exec = MockExecutor::new(
            MockFixture::new()
                .absent("PrepareDisks.CheckStorageConfig./mnt/storage1")
                .path("PrepareDisks.CheckReplicas./mnt/storage1", FileKind::Directory)
                .ok("PrepareDisks.BackupReplicas./mnt/storage1"),
        );
        let (report, state) = run(&config, &exec);

        assert_eq!(report.status("prepare-disks"), Some(StepStatus::Completed));
        let rename = &exec.calls_with_prefix("PrepareDisks.BackupReplicas.")[0];
        assert_eq!(
            rename.action,
            format!("rename /mnt/storage1/replicas -> /mnt/storage1/replicas.backup-{STAMP}")
        );
        assert_eq!(state.storage_label.unwrap().encode(), "storage1");
        assert!(!exec.was_called("PrepareDisks.ReadFstab"));
    }

    #[test]
    fn test_conflicting_filters_run_nothing() {
        let mut config = NodeConfig::test_config();
        config.enabled_steps = vec!["check-os".into(), "open-ports".into()];
        config.disabled_steps = vec!["open-ports".into(), "setup-rke2".into()];

        let err = Orchestrator::plan(Catalogue::standard().unwrap(), &config).unwrap_err();
        let ProvisionError::Config(errors) = &err else {
            panic!("expected configuration error, got {err}");
        };
        assert_eq!(errors, &["step 'open-ports' is both enabled and disabled"]);
        assert!(StepFilter::from_config(&config, &Catalogue::standard().unwrap()).is_err());
    }

    #[test]
    fn test_failed_step_leaves_rest_not_run() {
        let mut config = disk_steps(NodeConfig::test_config());
        config.enabled_steps.push("open-ports".into());
        let exec = MockExecutor::new(
            MockFixture::new()
                .output("PrepareDisks.ReadFstab", ROOT_FSTAB)
                .output("PrepareDisks.ReadMounts", PROC_MOUNTS)
                .output("PrepareDisks.CheckFilesystem./dev/sdb", "\n")
                .output("PrepareDisks.CheckPartitions./dev/sdb", "\n")
                .failure("PrepareDisks.Format./dev/sdb", "mkfs.ext4: device is busy"),
        );
        let (report, _) = run(&config, &exec);

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.id, "prepare-disks");
        assert_eq!(failure.phase, Phase::PreCluster);
        assert!(failure.error.contains("device is busy"));
        assert_eq!(report.status("select-disks"), Some(StepStatus::Completed));
        assert_eq!(report.status("generate-node-labels"), Some(StepStatus::NotRun));
        assert_eq!(report.status("open-ports"), Some(StepStatus::NotRun));
        assert_eq!(report.status("setup-rke2"), Some(StepStatus::NotRun));
        assert!(exec.calls_with_prefix("Firewall.").is_empty());
    }

    #[test]
    fn test_missing_mock_fails_the_step() {
        let mut config = NodeConfig::test_config();
        config.enabled_steps = vec!["check-os".into()];
        let exec = MockExecutor::new(MockFixture::new());
        let (report, _) = run(&config, &exec);

        let failure = report.failure.unwrap();
        assert_eq!(failure.id, "check-os");
        assert!(failure.error.contains("no mock registered for operation 'CheckOs.ReadOsRelease'"));
    }

    #[test]
    fn test_yaml_fixture_drives_a_step() {
        let fixture = MockFixture::from_yaml(
            "mocks:\n  CheckOs.ReadOsRelease:\n    output: \"ID=ubuntu\\nVERSION_ID=\\\"24.04\\\"\\n\"\n",
        )
        .unwrap();
        let mut config = NodeConfig::test_config();
        config.enabled_steps = vec!["check-os".into()];
        let exec = MockExecutor::new(fixture);
        let (report, _) = run(&config, &exec);
        assert!(report.succeeded(), "{:?}", report.failure);
    }

    #[test]
    fn test_bundled_fixture_rehearses_disk_steps() {
        let fixture =
            MockFixture::from_yaml(include_str!("../fixtures/fresh-disk.yaml")).unwrap();
        let mut config = NodeConfig::test_config();
        config.enabled_steps = vec!["select-disks".into(), "prepare-disks".into()];
        let exec = MockExecutor::new(fixture);
        let (report, state) = run(&config, &exec);

        assert!(report.succeeded(), "{:?}", report.failure);
        assert_eq!(state.mounted[0].mount_point, "/mnt/disk0");
        assert_eq!(report.count(StepStatus::Completed), 2);
    }

    #[test]
    fn test_dry_run_reports_steps_that_depend_on_rke2() {
        let mut config = NodeConfig::test_config();
        config.enabled_steps = vec![
            "create-chrony-config".into(),
            "setup-kubeconfig".into(),
            "final-output".into(),
        ];
        let orchestrator = Orchestrator::plan(Catalogue::standard().unwrap(), &config).unwrap();
        let exec = DryRunExecutor::new();
        let mut ctx = StepContext::new(&config, &exec, &SelectAll).with_stamp(STAMP);
        let report = orchestrator.run(&mut ctx, &mut Vec::new());

        assert!(report.succeeded(), "{:?}", report.failure);
        assert_eq!(report.count(StepStatus::Completed), 3);
    }
}
