//! Block device discovery and classification

use std::fmt;

use crate::error::Result;
use crate::exec::Executor;

/// udev properties that identify a hypervisor-provided disk
pub const VIRTUAL_DISK_MARKERS: &[&str] = &[
    "ID_VENDOR=QEMU",
    "ID_VENDOR=Virtio",
    "ID_VENDOR=VMware",
    "ID_VENDOR=Virtual",
    "ID_VENDOR=Microsoft",
    "ID_MODEL=VIRTUAL-DISK",
    "SCSI_MODEL=VIRTUAL-DISK",
];

/// Device family, from the kernel name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    Nvme,
    Sd,
    Other,
}

impl DiskKind {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("nvme") {
            Self::Nvme
        } else if name.starts_with("sd") {
            Self::Sd
        } else {
            Self::Other
        }
    }
}

/// One physical block device seen during a discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskCandidate {
    pub device: String,
    pub kind: DiskKind,
    pub is_virtual: bool,
    pub is_mounted: bool,
    pub has_filesystem: bool,
}

impl DiskCandidate {
    /// Whether discovery offers this device for storage
    pub fn is_eligible(&self) -> bool {
        if self.is_mounted {
            return false;
        }
        match self.kind {
            DiskKind::Nvme => true,
            DiskKind::Sd => !self.is_virtual,
            DiskKind::Other => false,
        }
    }
}

impl fmt::Display for DiskCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device)?;
        if self.has_filesystem {
            write!(f, " (has filesystem)")?;
        }
        Ok(())
    }
}

/// Whether udev properties carry a hypervisor signature.
///
/// Markers are prefixes of the vendor or model value, so `ID_VENDOR=VMware_`
/// matches `ID_VENDOR=VMware`.
pub fn is_virtual(udev_properties: &str) -> bool {
    VIRTUAL_DISK_MARKERS
        .iter()
        .any(|marker| udev_properties.contains(marker))
}

/// Enumerate whole disks and classify each one.
///
/// Every disk is returned; use [`DiskCandidate::is_eligible`] or
/// [`discover_eligible`] to apply the storage policy.
pub fn discover(exec: &dyn Executor) -> Result<Vec<DiskCandidate>> {
    let listing = exec.probe(
        "SelectDisks.ListBlockDevices",
        "lsblk",
        &["-dn", "-o", "NAME,TYPE"],
    )?;

    let mut candidates = Vec::new();
    for line in listing.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(kind)) = (fields.next(), fields.next()) else {
            continue;
        };
        if kind != "disk" {
            continue;
        }

        let device = format!("/dev/{name}");
        let disk_kind = DiskKind::from_name(name);
        let virtual_disk = disk_kind == DiskKind::Sd && {
            let props = exec.probe(
                &format!("SelectDisks.UdevProperties.{device}"),
                "udevadm",
                &["info", "--query=property", &format!("--name={device}")],
            )?;
            is_virtual(&props)
        };
        let mounts = exec.probe(
            &format!("SelectDisks.MountPoints.{device}"),
            "lsblk",
            &["-no", "MOUNTPOINT", &device],
        )?;
        let fstype = exec.probe(
            &format!("SelectDisks.Filesystem.{device}"),
            "lsblk",
            &["-no", "FSTYPE", &device],
        )?;

        candidates.push(DiskCandidate {
            device,
            kind: disk_kind,
            is_virtual: virtual_disk,
            is_mounted: mounts.lines().any(|l| !l.trim().is_empty()),
            has_filesystem: fstype.lines().any(|l| !l.trim().is_empty()),
        });
    }

    tracing::debug!(count = candidates.len(), "discovered block devices");
    Ok(candidates)
}

/// Discover disks and keep the ones eligible for storage
pub fn discover_eligible(exec: &dyn Executor) -> Result<Vec<DiskCandidate>> {
    let candidates = discover(exec)?;
    for c in candidates.iter().filter(|c| !c.is_eligible()) {
        tracing::info!(
            device = %c.device,
            virtual_disk = c.is_virtual,
            mounted = c.is_mounted,
            "excluding disk from storage candidates"
        );
    }
    Ok(candidates.into_iter().filter(DiskCandidate::is_eligible).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockExecutor, MockFixture};

    #[test]
    fn test_virtual_marker_matching() {
        assert!(is_virtual("DEVNAME=/dev/sda\nID_MODEL=VIRTUAL-DISK\n"));
        assert!(is_virtual("ID_VENDOR=QEMU"));
        assert!(!is_virtual("ID_VENDOR=ATA\nID_MODEL=Samsung_SSD_870"));
        assert!(!is_virtual(""));
    }

    #[test]
    fn test_hypervisor_vendor_values_are_virtual() {
        assert!(is_virtual("ID_VENDOR=VMware_\nID_MODEL=Virtual_disk\n"));
        assert!(is_virtual("ID_VENDOR=Microsoft_Corporation\n"));
        assert!(is_virtual("ID_VENDOR=QEMU_HARDDISK\n"));
        assert!(is_virtual("SCSI_VENDOR=Msft\nSCSI_MODEL=VIRTUAL-DISK_2\n"));
        assert!(!is_virtual("ID_VENDOR=ATA\nID_MODEL=VMwareless\n"));
    }

    #[test]
    fn test_discovery_filters_by_kind_and_state() {
        let exec = MockExecutor::new(
            MockFixture::new()
                .output(
                    "SelectDisks.ListBlockDevices",
                    "nvme0n1 disk\nsda disk\nsdb disk\nsr0 rom\nloop0 loop\nvda disk\n",
                )
                .output("SelectDisks.UdevProperties./dev/sda", "ID_VENDOR=ATA\n")
                .output("SelectDisks.UdevProperties./dev/sdb", "ID_VENDOR=ATA\n")
                .output("SelectDisks.MountPoints./dev/nvme0n1", "\n")
                .output("SelectDisks.MountPoints./dev/sda", "\n/\n/boot\n")
                .output("SelectDisks.MountPoints./dev/sdb", "")
                .output("SelectDisks.MountPoints./dev/vda", "")
                .output("SelectDisks.Filesystem./dev/nvme0n1", "")
                .output("SelectDisks.Filesystem./dev/sda", "\next4\n")
                .output("SelectDisks.Filesystem./dev/sdb", "ext4\n")
                .output("SelectDisks.Filesystem./dev/vda", ""),
        );

        let all = discover(&exec).unwrap();
        assert_eq!(all.len(), 4);

        let eligible = discover_eligible(&exec).unwrap();
        let devices: Vec<&str> = eligible.iter().map(|c| c.device.as_str()).collect();
        assert_eq!(devices, ["/dev/nvme0n1", "/dev/sdb"]);
        assert!(eligible[1].has_filesystem);
    }

    #[test]
    fn test_virtual_sd_excluded_regardless_of_mount_state() {
        for mounted in ["", "/data\n"] {
            let exec = MockExecutor::new(
                MockFixture::new()
                    .output("SelectDisks.ListBlockDevices", "sdc disk\n")
                    .output(
                        "SelectDisks.UdevProperties./dev/sdc",
                        "ID_VENDOR=Msft\nID_MODEL=VIRTUAL-DISK\n",
                    )
                    .output("SelectDisks.MountPoints./dev/sdc", mounted)
                    .output("SelectDisks.Filesystem./dev/sdc", ""),
            );
            let candidates = discover(&exec).unwrap();
            assert!(candidates[0].is_virtual);
            assert!(discover_eligible(&exec).unwrap().is_empty());
        }
    }
}
