//! `/mnt/disk<N>` mount point allocation

use std::sync::LazyLock;

use regex::Regex;

static DISK_MOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/mnt/disk(\d+)$").expect("mount point pattern is valid")
});

/// Index of a `/mnt/disk<N>` path
pub fn disk_index(path: &str) -> Option<u32> {
    DISK_MOUNT
        .captures(path.trim_end_matches('/'))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Hands out increasing `/mnt/disk<N>` paths.
///
/// Seeded with every index already in use (mounted or in the mount table),
/// it starts one past the highest and never hands out a path twice.
#[derive(Debug, Clone)]
pub struct MountAllocator {
    next: u32,
}

impl MountAllocator {
    pub fn new<'a>(in_use: impl IntoIterator<Item = &'a str>) -> Self {
        let next = in_use
            .into_iter()
            .filter_map(disk_index)
            .max()
            .map_or(0, |m| m + 1);
        Self { next }
    }

    /// Next unused mount point
    pub fn allocate(&mut self) -> String {
        let path = format!("/mnt/disk{}", self.next);
        self.next += 1;
        path
    }
}
