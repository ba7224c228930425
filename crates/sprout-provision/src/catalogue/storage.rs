//! Storage steps backed by the disk provisioning engine

use std::path::Path;

use super::{Phase, Step, StepContext, StepOutcome, StepResult};
use crate::config::NodeConfig;
use crate::disks::{DiskKind, DiskProvisioner, discover, discover_eligible, node_label_config};
use crate::error::{ProvisionError, Result};
use crate::tasks::{TaskResult, WriteFile, ensure};

/// RKE2 drop-in carrying the node labels
pub const NODE_LABEL_DROP_IN: &str = "/etc/rancher/rke2/config.yaml.d/50-sprout-node-labels.yaml";

const PROC_MOUNTS: &str = "/proc/mounts";
const LONGHORN_DEVICE_DIR: &str = "/dev/longhorn";
const LONGHORN_CSI_PLUGIN_DIR: &str = "/var/lib/kubelet/plugins/kubernetes.io/csi/driver.longhorn.io";

fn skip_without_disks(config: &NodeConfig) -> Option<&'static str> {
    config
        .no_disks_for_cluster
        .then_some("NO_DISKS_FOR_CLUSTER is set")
}

fn skip_unless_managing_disks(config: &NodeConfig) -> Option<&'static str> {
    if config.manages_disks() {
        None
    } else if config.no_disks_for_cluster {
        Some("NO_DISKS_FOR_CLUSTER is set")
    } else {
        Some("CLUSTER_PREMOUNTED_DISKS is set")
    }
}

fn skip_nvme_check(config: &NodeConfig) -> Option<&'static str> {
    if !config.gpu_node {
        Some("not required on CPU nodes")
    } else if !config.cluster_disks.is_empty() {
        Some("CLUSTER_DISKS is set")
    } else {
        skip_unless_managing_disks(config)
    }
}

fn skip_unless_cleaning(config: &NodeConfig) -> Option<&'static str> {
    (!config.clean_disks).then_some("CLEAN_DISKS is not set")
}

fn provisioner<'a>(ctx: &StepContext<'a>) -> DiskProvisioner<'a> {
    DiskProvisioner::new(ctx.exec)
        .with_stamp(ctx.state.stamp.clone())
        .with_fstab_backed_up(ctx.state.fstab_backed_up)
}

pub(super) fn check_nvme_drives() -> Step {
    Step {
        id: "check-nvme-drives",
        name: "Check NVMe Drives",
        description: "Check NVMe drives are available for storage",
        phase: Phase::PreCluster,
        skip: Some(skip_nvme_check),
        action: run_check_nvme_drives,
    }
}

/// At least one NVMe disk must be unmounted or already one of ours.
fn run_check_nvme_drives(ctx: &mut StepContext<'_>) -> StepResult {
    let nvme: Vec<_> = discover(ctx.exec)?
        .into_iter()
        .filter(|c| c.kind == DiskKind::Nvme)
        .collect();
    if nvme.is_empty() {
        return Err(ProvisionError::step("no NVMe devices found"));
    }

    let mut usable = 0;
    for disk in &nvme {
        if !disk.is_mounted {
            usable += 1;
            continue;
        }
        let mounts = ctx.exec.probe(
            &format!("CheckNvmeDrives.MountPoint.{}", disk.device),
            "lsblk",
            &["-no", "MOUNTPOINT", &disk.device],
        )?;
        if mounts.lines().any(|m| m.trim().starts_with("/mnt/disk")) {
            usable += 1;
        } else {
            tracing::warn!(device = %disk.device, mounts = %mounts.trim(), "NVMe device mounted outside /mnt/disk*");
        }
    }

    if usable == 0 {
        return Err(ProvisionError::step(
            "no NVMe drives available (either unmounted or mounted at /mnt/disk*)",
        ));
    }
    Ok(StepOutcome::message(format!(
        "{usable} of {} NVMe drives available",
        nvme.len()
    )))
}

/// Mount points held by Longhorn volumes, deepest first
pub fn longhorn_mount_points(mounts: &str) -> Vec<String> {
    let mut points: Vec<String> = mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let held = source.starts_with("/dev/longhorn/")
                || target.contains("driver.longhorn.io")
                || (target.contains("kubernetes.io/csi") && target.contains("/pvc-"));
            held.then(|| target.to_string())
        })
        .collect();
    points.sort_by(|a, b| {
        b.matches('/')
            .count()
            .cmp(&a.matches('/').count())
            .then_with(|| a.cmp(b))
    });
    points.dedup();
    points
}

/// Log a failed cleanup command and carry on
fn tolerate(result: Result<String>, what: &str) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e @ ProvisionError::MockNotRegistered(_)) => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "{what} failed, continuing");
            Ok(false)
        }
    }
}

pub(super) fn clean_longhorn_mounts() -> Step {
    Step {
        id: "clean-longhorn-mounts",
        name: "Clean Longhorn Mounts",
        description: "Release Longhorn volumes left by a previous install",
        phase: Phase::PreCluster,
        skip: None,
        action: run_clean_longhorn_mounts,
    }
}

/// Every command here is best effort; stale mounts must not block a reinstall.
fn run_clean_longhorn_mounts(ctx: &mut StepContext<'_>) -> StepResult {
    let exec = ctx.exec;
    let mounts = exec.read_file("CleanLonghornMounts.ReadMounts", Path::new(PROC_MOUNTS))?;
    let points = longhorn_mount_points(&mounts);
    let devices = exec
        .stat("CleanLonghornMounts.StatDevices", Path::new(LONGHORN_DEVICE_DIR))?
        .is_some();
    if points.is_empty() && !devices {
        return Ok(StepOutcome::message("no Longhorn mounts found"));
    }

    tolerate(
        exec.run("CleanLonghornMounts.StopServices", "systemctl", &["stop", "longhorn-*"]),
        "stopping Longhorn services",
    )?;
    let mut unmounted = 0;
    for point in &points {
        let op = format!("CleanLonghornMounts.Unmount.{point}");
        if tolerate(exec.run(&op, "umount", &["-lf", point]), &format!("unmounting {point}"))? {
            unmounted += 1;
        }
    }
    if devices {
        tolerate(
            exec.run("CleanLonghornMounts.ReleaseDevices", "fuser", &["-km", LONGHORN_DEVICE_DIR]),
            "releasing Longhorn devices",
        )?;
        tolerate(
            exec.run(
                "CleanLonghornMounts.RemoveDevices",
                "sh",
                &["-c", "rm -f /dev/longhorn/pvc-*"],
            ),
            "removing Longhorn device nodes",
        )?;
    }
    tolerate(
        exec.run(
            "CleanLonghornMounts.RemovePluginDir",
            "rm",
            &["-rf", LONGHORN_CSI_PLUGIN_DIR],
        ),
        "removing the Longhorn CSI plugin directory",
    )?;
    Ok(StepOutcome::message(format!(
        "unmounted {unmounted} of {} Longhorn mounts",
        points.len()
    )))
}

pub(super) fn clean_disks() -> Step {
    Step {
        id: "clean-disks",
        name: "Clean Disks",
        description: "Unmount managed storage and drop its mount table entries",
        phase: Phase::PreCluster,
        skip: Some(skip_unless_cleaning),
        action: |ctx| {
            let mut provisioner = provisioner(ctx);
            let removed = provisioner.clean_managed_mounts()?;
            ctx.state.fstab_backed_up = provisioner.fstab_backed_up();
            Ok(StepOutcome::message(format!("removed {removed} managed mounts")))
        },
    }
}

pub(super) fn select_disks() -> Step {
    Step {
        id: "select-disks",
        name: "Select Disks",
        description: "Choose the block devices to use for cluster storage",
        phase: Phase::PreCluster,
        skip: Some(skip_unless_managing_disks),
        action: run_select_disks,
    }
}

fn run_select_disks(ctx: &mut StepContext<'_>) -> StepResult {
    if !ctx.config.cluster_disks.is_empty() {
        ctx.state.selected_disks.clone_from(&ctx.config.cluster_disks);
        return Ok(StepOutcome::message(format!(
            "using CLUSTER_DISKS: {}",
            ctx.config.cluster_disks.join(", ")
        )));
    }

    let candidates = discover_eligible(ctx.exec)?;
    if candidates.is_empty() {
        tracing::info!("no unmounted physical disks found");
        return Ok(StepOutcome::message("no eligible disks found"));
    }

    let selected = ctx.selector.select(&candidates)?;
    tracing::info!(selected = ?selected, "disks selected");
    let message = format!("selected disks: {}", selected.join(", "));
    ctx.state.selected_disks = selected;
    Ok(StepOutcome::message(message))
}

pub(super) fn prepare_disks() -> Step {
    Step {
        id: "prepare-disks",
        name: "Prepare Disks",
        description: "Format, mount and persist the selected disks",
        phase: Phase::PreCluster,
        skip: Some(skip_without_disks),
        action: run_prepare_disks,
    }
}

fn run_prepare_disks(ctx: &mut StepContext<'_>) -> StepResult {
    let mut provisioner = provisioner(ctx);
    let report = provisioner.provision(ctx.config, &ctx.state.selected_disks)?;
    ctx.state.fstab_backed_up = provisioner.fstab_backed_up();

    let message = match &report.label {
        Some(label) => format!(
            "storage label {label}, {} new mount table entries, {} backups",
            report.persisted,
            report.backups.len()
        ),
        None => "no disks prepared".to_string(),
    };
    ctx.state.mounted = report.disks;
    ctx.state.storage_label = report.label;
    Ok(StepOutcome::message(message))
}

pub(super) fn generate_node_labels() -> Step {
    Step {
        id: "generate-node-labels",
        name: "Generate Node Labels",
        description: "Write the RKE2 node labels for GPU and storage placement",
        phase: Phase::PreCluster,
        skip: None,
        action: |ctx| {
            let config =
                node_label_config(ctx.config.gpu_node, ctx.state.storage_label.as_ref())?;
            let drop_in = WriteFile::new(NODE_LABEL_DROP_IN, config).with_permissions("0644");
            match ensure(ctx.exec, &drop_in)? {
                TaskResult::Applied => Ok(StepOutcome::message(format!(
                    "wrote {NODE_LABEL_DROP_IN}"
                ))),
                TaskResult::Satisfied => Ok(StepOutcome::message("node labels unchanged")),
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disks::{DiskCandidate, DiskSelector};
    use crate::error::Result;
    use crate::exec::{FileKind, MockExecutor, MockFixture};

    struct FirstOnly;

    impl DiskSelector for FirstOnly {
        fn select(&self, candidates: &[DiskCandidate]) -> Result<Vec<String>> {
            Ok(candidates.iter().take(1).map(|c| c.device.clone()).collect())
        }
    }

    fn two_nvme_fixture() -> MockFixture {
        MockFixture::new()
            .output("SelectDisks.ListBlockDevices", "nvme0n1 disk\nnvme1n1 disk\n")
            .output("SelectDisks.MountPoints./dev/nvme0n1", "/mnt/disk0\n")
            .ok("SelectDisks.Filesystem./dev/nvme0n1")
            .ok("SelectDisks.MountPoints./dev/nvme1n1")
            .ok("SelectDisks.Filesystem./dev/nvme1n1")
    }

    #[test]
    fn test_explicit_disks_skip_discovery() {
        let config = NodeConfig::test_config();
        let exec = MockExecutor::new(MockFixture::new());
        let mut ctx = StepContext::new(&config, &exec, &FirstOnly);
        run_select_disks(&mut ctx).unwrap();
        assert_eq!(ctx.state.selected_disks, vec!["/dev/sdb"]);
        assert!(exec.invocations().is_empty());
    }

    #[test]
    fn test_selector_sees_only_eligible_disks() {
        let mut config = NodeConfig::test_config();
        config.cluster_disks.clear();
        let exec = MockExecutor::new(two_nvme_fixture());
        let mut ctx = StepContext::new(&config, &exec, &FirstOnly);
        run_select_disks(&mut ctx).unwrap();
        assert_eq!(ctx.state.selected_disks, vec!["/dev/nvme1n1"]);
    }

    #[test]
    fn test_nvme_mounted_elsewhere_is_not_usable() {
        let config = NodeConfig::test_config();
        let exec = MockExecutor::new(
            MockFixture::new()
                .output("SelectDisks.ListBlockDevices", "nvme0n1 disk\n")
                .output("SelectDisks.MountPoints./dev/nvme0n1", "/data\n")
                .output("SelectDisks.Filesystem./dev/nvme0n1", "xfs\n")
                .output("CheckNvmeDrives.MountPoint./dev/nvme0n1", "/data\n"),
        );
        let mut ctx = StepContext::new(&config, &exec, &FirstOnly);
        let err = run_check_nvme_drives(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("no NVMe drives available"));
    }

    #[test]
    fn test_nvme_check_accepts_managed_mounts() {
        let config = NodeConfig::test_config();
        let exec = MockExecutor::new(
            two_nvme_fixture().output("CheckNvmeDrives.MountPoint./dev/nvme0n1", "/mnt/disk0\n"),
        );
        let mut ctx = StepContext::new(&config, &exec, &FirstOnly);
        let outcome = run_check_nvme_drives(&mut ctx).unwrap();
        assert_eq!(outcome.message.as_deref(), Some("2 of 2 NVMe drives available"));
    }

    #[test]
    fn test_node_labels_without_storage() {
        let mut config = NodeConfig::test_config();
        config.no_disks_for_cluster = true;
        config.cluster_disks.clear();
        let exec = MockExecutor::new(
            MockFixture::new()
                .absent(format!("File.Stat.{NODE_LABEL_DROP_IN}"))
                .ok(format!("File.CreateParent.{NODE_LABEL_DROP_IN}"))
                .ok(format!("File.Write.{NODE_LABEL_DROP_IN}"))
                .ok(format!("File.Chmod.{NODE_LABEL_DROP_IN}")),
        );
        let mut ctx = StepContext::new(&config, &exec, &FirstOnly);
        (generate_node_labels().action)(&mut ctx).unwrap();
        let write = &exec.calls_with_prefix("File.Write.")[0];
        assert!(write.action.contains("sprout.io/gpu-node=false"));
        assert!(!write.action.contains("longhorn-disks"));
    }

    const LONGHORN_MOUNTS: &str = "\
/dev/nvme0n1 /mnt/disk0 ext4 rw,relatime 0 0
/dev/longhorn/pvc-1a2b /var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pvc-1a2b/mount ext4 rw 0 0
/dev/longhorn/pvc-1a2b /var/lib/kubelet/plugins/kubernetes.io/csi/driver.longhorn.io/0f3e/globalmount ext4 rw 0 0
tmpfs /run tmpfs rw 0 0
";

    #[test]
    fn test_longhorn_mount_points_deepest_first() {
        let points = longhorn_mount_points(LONGHORN_MOUNTS);
        assert_eq!(
            points,
            vec![
                "/var/lib/kubelet/plugins/kubernetes.io/csi/driver.longhorn.io/0f3e/globalmount",
                "/var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pvc-1a2b/mount",
            ]
        );
        assert!(longhorn_mount_points("/dev/sda1 / ext4 rw 0 0\n").is_empty());
    }

    #[test]
    fn test_clean_host_has_no_longhorn_mounts() {
        let config = NodeConfig::test_config();
        let exec = MockExecutor::new(
            MockFixture::new()
                .output("CleanLonghornMounts.ReadMounts", "/dev/sda1 / ext4 rw 0 0\n")
                .absent("CleanLonghornMounts.StatDevices"),
        );
        let mut ctx = StepContext::new(&config, &exec, &FirstOnly);
        let outcome = run_clean_longhorn_mounts(&mut ctx).unwrap();
        assert_eq!(outcome.message.as_deref(), Some("no Longhorn mounts found"));
        assert!(!exec.was_called("CleanLonghornMounts.StopServices"));
    }

    #[test]
    fn test_longhorn_cleanup_tolerates_failures() {
        let config = NodeConfig::test_config();
        let points = longhorn_mount_points(LONGHORN_MOUNTS);
        let exec = MockExecutor::new(
            MockFixture::new()
                .output("CleanLonghornMounts.ReadMounts", LONGHORN_MOUNTS)
                .path("CleanLonghornMounts.StatDevices", FileKind::Directory)
                .failure("CleanLonghornMounts.StopServices", "no units matched")
                .failure(
                    format!("CleanLonghornMounts.Unmount.{}", points[0]),
                    "target is busy",
                )
                .ok(format!("CleanLonghornMounts.Unmount.{}", points[1]))
                .ok("CleanLonghornMounts.ReleaseDevices")
                .ok("CleanLonghornMounts.RemoveDevices")
                .ok("CleanLonghornMounts.RemovePluginDir"),
        );
        let mut ctx = StepContext::new(&config, &exec, &FirstOnly);
        let outcome = run_clean_longhorn_mounts(&mut ctx).unwrap();
        assert_eq!(outcome.message.as_deref(), Some("unmounted 1 of 2 Longhorn mounts"));
        let unmounts = exec.calls_with_prefix("CleanLonghornMounts.Unmount.");
        assert_eq!(unmounts[0].action, format!("umount -lf {}", points[0]));
        assert!(exec.was_called("CleanLonghornMounts.RemoveDevices"));
    }
}
