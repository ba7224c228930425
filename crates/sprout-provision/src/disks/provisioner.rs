//! Disk provisioning state machine
//!
//! classify → prepare → identify → mount → protect existing data → persist → label

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::allocator::MountAllocator;
use super::fstab::{FstabEntry, MountLine, MountTable};
use super::label::NodeStorageLabel;
use crate::config::NodeConfig;
use crate::error::{ProvisionError, Result};
use crate::exec::{ExecMode, Executor, FileKind};

/// Config marker a previous storage installation leaves on each disk
pub const STORAGE_CONFIG_MARKER: &str = "longhorn-disk.cfg";
/// Replica data directory a previous storage installation leaves on each disk
pub const REPLICA_DIR: &str = "replicas";

/// Host files the engine reads and rewrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPaths {
    pub fstab: PathBuf,
    pub proc_mounts: PathBuf,
}

impl Default for DiskPaths {
    fn default() -> Self {
        Self {
            fstab: "/etc/fstab".into(),
            proc_mounts: "/proc/mounts".into(),
        }
    }
}

/// A disk mounted (or found mounted) for storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedDisk {
    pub device: String,
    pub uuid: String,
    pub mount_point: String,
    /// Mounted by this run
    pub newly_mounted: bool,
    /// Mount table already had a line for this UUID
    pub in_mount_table: bool,
}

/// What a provisioning pass did
#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
    pub disks: Vec<MountedDisk>,
    pub label: Option<NodeStorageLabel>,
    /// Earlier storage data moved aside to these paths
    pub backups: Vec<PathBuf>,
    /// Mount table lines appended
    pub persisted: usize,
}

/// Formats, mounts and persists storage disks through an [`Executor`]
pub struct DiskProvisioner<'a> {
    exec: &'a dyn Executor,
    paths: DiskPaths,
    stamp: String,
    fstab_backed_up: bool,
}

impl<'a> DiskProvisioner<'a> {
    pub fn new(exec: &'a dyn Executor) -> Self {
        Self {
            exec,
            paths: DiskPaths::default(),
            stamp: chrono::Local::now().format("%Y%m%d-%H%M%S").to_string(),
            fstab_backed_up: false,
        }
    }

    pub fn with_paths(mut self, paths: DiskPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Suffix for backup names; one per run
    pub fn with_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = stamp.into();
        self
    }

    /// Mark the mount table as already backed up during this run
    pub fn with_fstab_backed_up(mut self, backed_up: bool) -> Self {
        self.fstab_backed_up = backed_up;
        self
    }

    pub fn fstab_backed_up(&self) -> bool {
        self.fstab_backed_up
    }

    /// Run the whole state machine for `selected` devices.
    pub fn provision(
        &mut self,
        config: &NodeConfig,
        selected: &[String],
    ) -> Result<ProvisionReport> {
        if config.no_disks_for_cluster {
            tracing::info!("NO_DISKS_FOR_CLUSTER is set, skipping disk provisioning");
            return Ok(ProvisionReport::default());
        }

        if !config.cluster_premounted_disks.is_empty() {
            let paths = &config.cluster_premounted_disks;
            tracing::info!(count = paths.len(), "using pre-mounted storage paths");
            let backups = self.protect_existing_data(paths)?;
            return Ok(ProvisionReport {
                disks: vec![],
                label: Some(NodeStorageLabel::from_paths(paths.clone())?),
                backups,
                persisted: 0,
            });
        }

        if selected.is_empty() {
            tracing::warn!("no disks selected for storage");
            return Ok(ProvisionReport::default());
        }

        let disks = self.mount_disks(selected)?;
        let mount_points: Vec<PathBuf> = disks
            .iter()
            .map(|d| PathBuf::from(&d.mount_point))
            .collect();
        let backups = self.protect_existing_data(&mount_points)?;
        let persisted = self.persist(&disks)?;
        let label = NodeStorageLabel::from_paths(mount_points)?;

        tracing::info!(%label, disks = disks.len(), persisted, "disk provisioning complete");
        Ok(ProvisionReport {
            disks,
            label: Some(label),
            backups,
            persisted,
        })
    }

    /// Format where needed, then mount each device.
    ///
    /// A device already mounted keeps its mount point; one whose UUID is in
    /// the mount table reuses the recorded point; anything else gets the
    /// next free `/mnt/disk<N>`.
    pub fn mount_disks(&self, devices: &[String]) -> Result<Vec<MountedDisk>> {
        let table = MountTable::parse(&self.exec.read_file(
            "PrepareDisks.ReadFstab",
            &self.paths.fstab,
        )?);
        let mounts = self
            .exec
            .read_file("PrepareDisks.ReadMounts", &self.paths.proc_mounts)?;
        let mut allocator = MountAllocator::new(
            table
                .lines()
                .iter()
                .map(|l| l.mount_point.as_str())
                .chain(mounts.lines().filter_map(|l| l.split_whitespace().nth(1))),
        );

        let mut disks = Vec::with_capacity(devices.len());
        for device in devices {
            self.prepare_filesystem(device)?;
            let uuid = self.filesystem_uuid(device)?;
            let recorded = table.mount_point_for_uuid(&uuid).map(String::from);

            let (mount_point, needs_mount) = match (self.current_mount(device)?, &recorded) {
                (Some(current), _) => (current, false),
                (None, Some(recorded)) => (recorded.clone(), true),
                (None, None) => (allocator.allocate(), true),
            };

            if needs_mount {
                self.exec.mkdir_all(
                    &format!("PrepareDisks.CreateMountPoint.{device}"),
                    Path::new(&mount_point),
                )?;
                self.exec.run(
                    &format!("PrepareDisks.Mount.{device}"),
                    "mount",
                    &[device.as_str(), mount_point.as_str()],
                )?;
                tracing::info!(%device, %mount_point, %uuid, "mounted disk");
            } else {
                tracing::info!(%device, %mount_point, "disk already mounted");
            }

            disks.push(MountedDisk {
                device: device.clone(),
                uuid,
                mount_point,
                newly_mounted: needs_mount,
                in_mount_table: recorded.is_some(),
            });
        }
        Ok(disks)
    }

    /// Wipe and format a device unless it already carries ext4.
    ///
    /// `lsblk` lists the whole disk first, then its partitions. Ext4 on a
    /// partition is data this engine cannot mount as a whole disk, so the
    /// device is refused rather than wiped. Returns whether it was formatted.
    fn prepare_filesystem(&self, device: &str) -> Result<bool> {
        let fstype = self.exec.probe(
            &format!("PrepareDisks.CheckFilesystem.{device}"),
            "lsblk",
            &["-no", "FSTYPE", device],
        )?;
        let mut rows = fstype.lines().map(str::trim);
        if rows.next() == Some("ext4") {
            tracing::info!(%device, "ext4 filesystem present, not formatting");
            return Ok(false);
        }
        if rows.any(|fs| fs == "ext4") {
            return Err(ProvisionError::step(format!(
                "{device}: partitioned disk carries ext4, refusing to wipe"
            )));
        }

        let partitions = self.exec.probe(
            &format!("PrepareDisks.CheckPartitions.{device}"),
            "lsblk",
            &["-no", "PARTTYPE", device],
        )?;
        if partitions.lines().any(|l| !l.trim().is_empty()) {
            tracing::warn!(%device, "wiping partition signatures");
            self.exec.run(
                &format!("PrepareDisks.WipePartitions.{device}"),
                "wipefs",
                &["-a", device],
            )?;
        }

        tracing::warn!(%device, "formatting as ext4");
        self.exec.run(
            &format!("PrepareDisks.Format.{device}"),
            "mkfs.ext4",
            &["-F", device],
        )?;
        Ok(true)
    }

    fn filesystem_uuid(&self, device: &str) -> Result<String> {
        let dry_run = self.exec.mode() == ExecMode::DryRun;
        let uuid = match self.exec.probe(
            &format!("PrepareDisks.GetUuid.{device}"),
            "blkid",
            &["-s", "UUID", "-o", "value", device],
        ) {
            Ok(out) => out.trim().to_string(),
            // The format above was only logged, so the real disk may have no UUID yet
            Err(ProvisionError::Command { .. }) if dry_run => String::new(),
            Err(e) => return Err(e),
        };

        match (uuid.is_empty(), dry_run) {
            (false, _) => Ok(uuid),
            (true, true) => Ok(format!("dry-run-{}", device.trim_start_matches("/dev/"))),
            (true, false) => Err(ProvisionError::step(format!(
                "{device} has no filesystem UUID after formatting"
            ))),
        }
    }

    fn current_mount(&self, device: &str) -> Result<Option<String>> {
        let out = self.exec.probe(
            &format!("PrepareDisks.CurrentMount.{device}"),
            "lsblk",
            &["-dno", "MOUNTPOINT", device],
        )?;
        Ok(out
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from))
    }

    /// Move data left by an earlier storage installation out of the way.
    ///
    /// A kind mismatch or failed rename is logged and the run carries on.
    pub fn protect_existing_data(&self, mount_points: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut backups = Vec::new();
        for mount_point in mount_points {
            for (name, expected, area) in [
                (STORAGE_CONFIG_MARKER, FileKind::File, "StorageConfig"),
                (REPLICA_DIR, FileKind::Directory, "Replicas"),
            ] {
                let path = mount_point.join(name);
                let subject = mount_point.display();
                match self
                    .exec
                    .stat(&format!("PrepareDisks.Check{area}.{subject}"), &path)?
                {
                    None => continue,
                    Some(kind) if kind != expected => {
                        tracing::warn!(
                            path = %path.display(),
                            ?kind,
                            "unexpected entry where storage data would be, leaving it"
                        );
                        continue;
                    }
                    Some(_) => {}
                }

                let backup = PathBuf::from(format!("{}.backup-{}", path.display(), self.stamp));
                match self.exec.rename(
                    &format!("PrepareDisks.Backup{area}.{subject}"),
                    &path,
                    &backup,
                ) {
                    Ok(()) => {
                        tracing::info!(
                            from = %path.display(),
                            to = %backup.display(),
                            "moved existing storage data aside"
                        );
                        backups.push(backup);
                    }
                    Err(e @ ProvisionError::MockNotRegistered(_)) => return Err(e),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "could not back up existing storage data, continuing without backup"
                    ),
                }
            }
        }
        Ok(backups)
    }

    /// Append a managed mount table line for every disk not yet listed.
    ///
    /// The UUID is resolved again here; a disk whose lookup fails is
    /// skipped with a warning. Returns the number of lines appended.
    pub fn persist(&mut self, disks: &[MountedDisk]) -> Result<usize> {
        if disks.is_empty() {
            return Ok(0);
        }
        let table = MountTable::parse(
            &self
                .exec
                .read_file("PersistMounts.ReadFstab", &self.paths.fstab)?,
        );

        let mut written: HashSet<String> = HashSet::new();
        for disk in disks.iter().filter(|d| !d.in_mount_table) {
            let device = &disk.device;
            let uuid = match self.exec.probe(
                &format!("PersistMounts.GetUuid.{device}"),
                "blkid",
                &["-s", "UUID", "-o", "value", device],
            ) {
                Ok(out) => out.trim().to_string(),
                Err(e @ ProvisionError::MockNotRegistered(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(%device, error = %e, "UUID lookup failed, not persisting mount");
                    continue;
                }
            };
            if uuid.is_empty() {
                tracing::warn!(%device, "no UUID reported, not persisting mount");
                continue;
            }
            if table.contains_uuid(&uuid) || written.contains(&uuid) {
                tracing::debug!(%device, %uuid, "mount table already lists this UUID");
                continue;
            }

            self.backup_fstab("PersistMounts.BackupFstab")?;
            let entry = FstabEntry::new(&uuid, &disk.mount_point);
            self.exec.append_file(
                &format!("PersistMounts.AppendFstab.{device}"),
                &self.paths.fstab,
                &format!("{entry}\n"),
            )?;
            written.insert(uuid);
        }

        self.exec
            .run("PersistMounts.MountAll", "mount", &["-a"])?;
        Ok(written.len())
    }

    /// Drop every managed line from the mount table and unmount those points.
    ///
    /// Unmount failures are warnings. Returns how many entries were removed.
    pub fn clean_managed_mounts(&mut self) -> Result<usize> {
        let table = MountTable::parse(
            &self
                .exec
                .read_file("CleanDisks.ReadFstab", &self.paths.fstab)?,
        );
        let managed: Vec<MountLine> = table.managed().cloned().collect();
        if managed.is_empty() {
            tracing::info!("no managed mounts to clean");
            return Ok(0);
        }

        self.backup_fstab("CleanDisks.BackupFstab")?;
        for line in &managed {
            let mount_point = &line.mount_point;
            match self.exec.run(
                &format!("CleanDisks.Unmount.{mount_point}"),
                "umount",
                &["-l", mount_point],
            ) {
                Ok(_) => tracing::info!(%mount_point, "unmounted"),
                Err(e @ ProvisionError::MockNotRegistered(_)) => return Err(e),
                Err(e) => tracing::warn!(%mount_point, error = %e, "unmount failed"),
            }
        }
        self.exec.write_file(
            "CleanDisks.RewriteFstab",
            &self.paths.fstab,
            &table.without_managed(),
        )?;
        Ok(managed.len())
    }

    fn backup_fstab(&mut self, op: &str) -> Result<()> {
        if self.fstab_backed_up {
            return Ok(());
        }
        let backup = PathBuf::from(format!(
            "{}.bak-{}",
            self.paths.fstab.display(),
            self.stamp
        ));
        self.exec.copy_file(op, &self.paths.fstab, &backup)?;
        tracing::info!(backup = %backup.display(), "backed up mount table");
        self.fstab_backed_up = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockExecutor, MockFixture};

    const FRESH_FSTAB: &str = "UUID=root-uuid / ext4 errors=remount-ro 0 1\n";
    const PROC_MOUNTS: &str = "/dev/nvme0n1p2 / ext4 rw,relatime 0 0\nproc /proc proc rw 0 0\n";

    fn fresh_sdb() -> MockFixture {
        MockFixture::new()
            .output("PrepareDisks.ReadFstab", FRESH_FSTAB)
            .output("PrepareDisks.ReadMounts", PROC_MOUNTS)
            .output("PrepareDisks.CheckFilesystem./dev/sdb", "\n")
            .output("PrepareDisks.CheckPartitions./dev/sdb", "\n")
            .ok("PrepareDisks.Format./dev/sdb")
            .output("PrepareDisks.GetUuid./dev/sdb", "1111-aaaa\n")
            .output("PrepareDisks.CurrentMount./dev/sdb", "")
            .ok("PrepareDisks.CreateMountPoint./dev/sdb")
            .ok("PrepareDisks.Mount./dev/sdb")
            .absent("PrepareDisks.CheckStorageConfig./mnt/disk0")
            .absent("PrepareDisks.CheckReplicas./mnt/disk0")
            .output("PersistMounts.ReadFstab", FRESH_FSTAB)
            .output("PersistMounts.GetUuid./dev/sdb", "1111-aaaa\n")
            .ok("PersistMounts.BackupFstab")
            .ok("PersistMounts.AppendFstab./dev/sdb")
            .ok("PersistMounts.MountAll")
    }

    fn config() -> NodeConfig {
        NodeConfig::builder().cluster_disks(["/dev/sdb"]).build()
    }

    #[test]
    fn test_partitioned_disk_is_wiped_before_format() {
        let exec = MockExecutor::new(
            fresh_sdb()
                .output("PrepareDisks.CheckPartitions./dev/sdb", "\n0x83\n")
                .ok("PrepareDisks.WipePartitions./dev/sdb"),
        );
        DiskProvisioner::new(&exec)
            .with_stamp("20260101-000000")
            .provision(&config(), &["/dev/sdb".to_string()])
            .unwrap();

        let ops: Vec<String> = exec
            .calls_with_prefix("PrepareDisks.")
            .into_iter()
            .map(|i| i.op)
            .collect();
        let wipe = ops
            .iter()
            .position(|o| o == "PrepareDisks.WipePartitions./dev/sdb")
            .unwrap();
        let format = ops
            .iter()
            .position(|o| o == "PrepareDisks.Format./dev/sdb")
            .unwrap();
        assert!(wipe < format);
    }

    #[test]
    fn test_ext4_on_partition_is_never_wiped() {
        let exec = MockExecutor::new(
            fresh_sdb()
                .output("PrepareDisks.CheckFilesystem./dev/sdb", "\next4\n")
                .output(
                    "PrepareDisks.CheckPartitions./dev/sdb",
                    "\n0fc63daf-8483-4772-8e79-3d69d8477de4\n",
                )
                .ok("PrepareDisks.WipePartitions./dev/sdb"),
        );
        let err = DiskProvisioner::new(&exec)
            .provision(&config(), &["/dev/sdb".to_string()])
            .unwrap_err();

        assert!(err.to_string().contains("refusing to wipe"));
        assert!(!exec.was_called("PrepareDisks.WipePartitions./dev/sdb"));
        assert!(!exec.was_called("PrepareDisks.Format./dev/sdb"));
        let check = &exec.calls_with_prefix("PrepareDisks.CheckFilesystem.")[0];
        assert_eq!(check.action, "lsblk -no FSTYPE /dev/sdb");
    }

    #[test]
    fn test_dry_run_uuid_placeholder_for_unformatted_disk() {
        let exec = crate::exec::DryRunExecutor::new();
        let provisioner = DiskProvisioner::new(&exec);
        assert_eq!(
            provisioner.filesystem_uuid("/dev/sprout-no-such-disk").unwrap(),
            "dry-run-sprout-no-such-disk"
        );
    }

    #[test]
    fn test_custom_paths_are_used() {
        let dir = tempfile::tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        let exec = MockExecutor::new(
            MockFixture::new()
                .output("CleanDisks.ReadFstab", FRESH_FSTAB),
        );
        let mut provisioner = DiskProvisioner::new(&exec).with_paths(DiskPaths {
            fstab: fstab.clone(),
            proc_mounts: dir.path().join("mounts"),
        });
        assert_eq!(provisioner.clean_managed_mounts().unwrap(), 0);

        let read = &exec.calls_with_prefix("CleanDisks.ReadFstab")[0];
        assert_eq!(read.action, format!("read {}", fstab.display()));
    }

    #[test]
    fn test_known_uuid_reuses_recorded_mount_point() {
        let fstab = "UUID=1111-aaaa /mnt/disk4 ext4 defaults,nofail 0 2 # managed by sprout\n";
        let exec = MockExecutor::new(
            fresh_sdb()
                .output("PrepareDisks.ReadFstab", fstab)
                .output("PrepareDisks.CheckFilesystem./dev/sdb", "ext4\n")
                .ok("PrepareDisks.CreateMountPoint./dev/sdb")
                .absent("PrepareDisks.CheckStorageConfig./mnt/disk4")
                .absent("PrepareDisks.CheckReplicas./mnt/disk4")
                .output("PersistMounts.ReadFstab", fstab),
        );
        let report = DiskProvisioner::new(&exec)
            .provision(&config(), &["/dev/sdb".to_string()])
            .unwrap();

        assert_eq!(report.disks[0].mount_point, "/mnt/disk4");
        assert!(report.disks[0].newly_mounted);
        assert_eq!(report.persisted, 0);
        assert!(!exec.was_called("PrepareDisks.Format./dev/sdb"));
        assert!(!exec.was_called("PersistMounts.AppendFstab./dev/sdb"));
        assert!(!exec.was_called("PersistMounts.BackupFstab"));
    }

    #[test]
    fn test_uuid_lookup_failure_while_persisting_is_a_warning() {
        let exec = MockExecutor::new(
            fresh_sdb().failure("PersistMounts.GetUuid./dev/sdb", "blkid: exit status 2"),
        );
        let report = DiskProvisioner::new(&exec)
            .provision(&config(), &["/dev/sdb".to_string()])
            .unwrap();

        assert_eq!(report.persisted, 0);
        assert!(!exec.was_called("PersistMounts.AppendFstab./dev/sdb"));
        assert_eq!(report.label.unwrap().encode(), "disk0");
    }

    #[test]
    fn test_backup_rename_failure_does_not_abort() {
        let exec = MockExecutor::new(
            MockFixture::new()
                .path(
                    "PrepareDisks.CheckStorageConfig./mnt/storage1",
                    FileKind::File,
                )
                .failure(
                    "PrepareDisks.BackupStorageConfig./mnt/storage1",
                    "read-only file system",
                )
                .absent("PrepareDisks.CheckReplicas./mnt/storage1"),
        );
        let backups = DiskProvisioner::new(&exec)
            .protect_existing_data(&[PathBuf::from("/mnt/storage1")])
            .unwrap();
        assert!(backups.is_empty());
    }

    #[test]
    fn test_kind_mismatch_is_left_alone() {
        let exec = MockExecutor::new(
            MockFixture::new()
                .absent("PrepareDisks.CheckStorageConfig./mnt/disk0")
                .path("PrepareDisks.CheckReplicas./mnt/disk0", FileKind::File),
        );
        let backups = DiskProvisioner::new(&exec)
            .protect_existing_data(&[PathBuf::from("/mnt/disk0")])
            .unwrap();
        assert!(backups.is_empty());
        assert!(!exec.was_called("PrepareDisks.BackupReplicas./mnt/disk0"));
    }

    #[test]
    fn test_no_disks_flag_skips_everything() {
        let exec = MockExecutor::new(MockFixture::new());
        let config = NodeConfig::builder().no_disks_for_cluster(true).build();
        let report = DiskProvisioner::new(&exec)
            .provision(&config, &["/dev/sdb".to_string()])
            .unwrap();
        assert!(report.disks.is_empty());
        assert!(report.label.is_none());
        assert!(exec.invocations().is_empty());
    }

    #[test]
    fn test_clean_managed_mounts() {
        let fstab = "\
UUID=root-uuid / ext4 errors=remount-ro 0 1
UUID=aaaa /mnt/disk0 ext4 defaults,nofail 0 2 # managed by sprout
UUID=bbbb /mnt/disk1 ext4 defaults,nofail 0 2 # managed by sprout
";
        let exec = MockExecutor::new(
            MockFixture::new()
                .output("CleanDisks.ReadFstab", fstab)
                .ok("CleanDisks.BackupFstab")
                .ok("CleanDisks.Unmount./mnt/disk0")
                .failure("CleanDisks.Unmount./mnt/disk1", "not mounted")
                .ok("CleanDisks.RewriteFstab"),
        );
        let mut provisioner = DiskProvisioner::new(&exec).with_stamp("20260101-000000");
        assert_eq!(provisioner.clean_managed_mounts().unwrap(), 2);
        assert!(provisioner.fstab_backed_up());

        let rewrite = exec.calls_with_prefix("CleanDisks.RewriteFstab");
        assert!(rewrite[0].action.contains("UUID=root-uuid"));
        assert!(!rewrite[0].action.contains("/mnt/disk0"));
        let backup = exec.calls_with_prefix("CleanDisks.BackupFstab");
        assert!(backup[0].action.contains("/etc/fstab.bak-20260101-000000"));
    }
}
