//! Disk provisioning engine
//!
//! Discovers storage devices, formats and mounts them under `/mnt/disk<N>`,
//! records them in the mount table and encodes the result as a node label.

mod allocator;
mod discovery;
mod fstab;
mod label;
mod provisioner;

pub use allocator::{MountAllocator, disk_index};
pub use discovery::{
    DiskCandidate, DiskKind, VIRTUAL_DISK_MARKERS, discover, discover_eligible, is_virtual,
};
pub use fstab::{FstabEntry, MANAGED_TAG, MountLine, MountTable};
pub use label::{
    DEFAULT_DISK_LABEL, INSTANCE_MANAGER_LABEL, LABEL_DELIMITER, MAX_LABEL_VALUE_LEN,
    NodeStorageLabel, node_label_config, node_labels,
};
pub use provisioner::{
    DiskPaths, DiskProvisioner, MountedDisk, ProvisionReport, REPLICA_DIR, STORAGE_CONFIG_MARKER,
};

use crate::error::Result;

/// Picks storage devices out of the discovered candidates
///
/// Interactive front ends implement this; [`SelectAll`] takes everything.
pub trait DiskSelector {
    fn select(&self, candidates: &[DiskCandidate]) -> Result<Vec<String>>;
}

/// Selects every candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectAll;

impl DiskSelector for SelectAll {
    fn select(&self, candidates: &[DiskCandidate]) -> Result<Vec<String>> {
        Ok(candidates.iter().map(|c| c.device.clone()).collect())
    }
}
