//! Boot-time mount table (`/etc/fstab`) model

use std::fmt;

/// Comment appended to every line this tool owns
pub const MANAGED_TAG: &str = "# managed by sprout";

/// A managed mount entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub uuid: String,
    pub mount_point: String,
}

impl FstabEntry {
    pub fn new(uuid: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            mount_point: mount_point.into(),
        }
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UUID={} {} ext4 defaults,nofail 0 2 {MANAGED_TAG}",
            self.uuid, self.mount_point
        )
    }
}

/// One parsed data line of the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLine {
    pub source: String,
    pub mount_point: String,
    pub managed: bool,
}

impl MountLine {
    /// UUID when the source is `UUID=...`
    pub fn uuid(&self) -> Option<&str> {
        self.source.strip_prefix("UUID=")
    }
}

/// Parsed mount table, keeping the original text for rewrites
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    raw: Vec<String>,
    lines: Vec<MountLine>,
}

impl MountTable {
    pub fn parse(content: &str) -> Self {
        let raw: Vec<String> = content.lines().map(String::from).collect();
        let lines = raw.iter().filter_map(|l| parse_line(l)).collect();
        Self { raw, lines }
    }

    pub fn lines(&self) -> &[MountLine] {
        &self.lines
    }

    /// Lines carrying the management tag
    pub fn managed(&self) -> impl Iterator<Item = &MountLine> {
        self.lines.iter().filter(|l| l.managed)
    }

    /// Whether any line, managed or not, mounts this UUID
    pub fn contains_uuid(&self, uuid: &str) -> bool {
        self.lines.iter().any(|l| l.uuid() == Some(uuid))
    }

    /// Mount point recorded for this UUID
    pub fn mount_point_for_uuid(&self, uuid: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|l| l.uuid() == Some(uuid))
            .map(|l| l.mount_point.as_str())
    }

    /// The table text with every managed line removed
    pub fn without_managed(&self) -> String {
        let mut out: String = self
            .raw
            .iter()
            .filter(|l| !l.contains(MANAGED_TAG))
            .map(|l| format!("{l}\n"))
            .collect();
        if out.is_empty() {
            out.push('\n');
        }
        out
    }
}

fn parse_line(line: &str) -> Option<MountLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (data, comment) = match trimmed.split_once('#') {
        Some((data, comment)) => (data, Some(comment)),
        None => (trimmed, None),
    };
    let mut fields = data.split_whitespace();
    let source = fields.next()?.to_string();
    let mount_point = fields.next()?.to_string();
    let managed = comment.is_some_and(|c| format!("#{c}").trim() == MANAGED_TAG);
    Some(MountLine {
        source,
        mount_point,
        managed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# /etc/fstab: static file system information.
UUID=root-uuid / ext4 errors=remount-ro 0 1
/swap.img none swap sw 0 0
UUID=aaaa-1111 /mnt/disk0 ext4 defaults,nofail 0 2 # managed by sprout
UUID=bbbb-2222 /mnt/disk3 ext4 defaults,nofail 0 2 # managed by sprout
";

    #[test]
    fn test_entry_line_shape() {
        let entry = FstabEntry::new("1234-abcd", "/mnt/disk0");
        assert_eq!(
            entry.to_string(),
            "UUID=1234-abcd /mnt/disk0 ext4 defaults,nofail 0 2 # managed by sprout"
        );
    }

    #[test]
    fn test_parse_and_lookup() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.lines().len(), 4);
        assert_eq!(table.managed().count(), 2);
        assert!(table.contains_uuid("root-uuid"));
        assert_eq!(table.mount_point_for_uuid("bbbb-2222"), Some("/mnt/disk3"));
        assert!(!table.contains_uuid("cccc-3333"));
    }

    #[test]
    fn test_without_managed_keeps_foreign_lines() {
        let cleaned = MountTable::parse(SAMPLE).without_managed();
        assert!(cleaned.contains("UUID=root-uuid /"));
        assert!(cleaned.contains("/swap.img"));
        assert!(!cleaned.contains(MANAGED_TAG));
    }
}
