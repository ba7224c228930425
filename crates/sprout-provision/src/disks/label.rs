//! Node storage label and the node-label drop-in for RKE2

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{ProvisionError, Result};

/// Joins disk identifiers inside the label value
pub const LABEL_DELIMITER: &str = "xxx";
/// Stands in for `/` inside an identifier
const SLASH_ESCAPE: &str = "___";
const STORAGE_ROOT: &str = "/mnt/";

/// Longest value Kubernetes accepts for a label
pub const MAX_LABEL_VALUE_LEN: usize = 63;

static LABEL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-_.A-Za-z0-9]*[A-Za-z0-9])?$").expect("label value pattern is valid")
});

pub const STORAGE_LABEL_KEY: &str = "sprout.io/longhorn-disks";
pub const GPU_LABEL_KEY: &str = "sprout.io/gpu-node";
pub const DEFAULT_DISK_LABEL: &str = "node.longhorn.io/create-default-disk=config";
pub const INSTANCE_MANAGER_LABEL: &str = "node.longhorn.io/instance-manager=true";

/// Ordered storage paths, encoded as a single label value.
///
/// Paths under `/mnt/` lose that prefix (`/mnt/disk0` becomes `disk0`); any
/// other `/` is written as `___`. Identifiers are joined with `xxx`. The
/// result must be a valid Kubernetes label value, which rules out paths
/// outside `/mnt/` and long disk lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStorageLabel {
    paths: Vec<PathBuf>,
}

impl NodeStorageLabel {
    pub fn from_paths(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Result<Self> {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        let mut errors = Vec::new();
        for path in &paths {
            let text = path.to_string_lossy();
            if !path.is_absolute() {
                errors.push(format!("storage path '{text}' is not absolute"));
            }
            if !is_encodable(path) {
                errors.push(format!(
                    "storage path '{text}' cannot be encoded in a node label"
                ));
            }
        }
        if paths.is_empty() {
            errors.push("storage label needs at least one path".to_string());
        }
        if !errors.is_empty() {
            return Err(ProvisionError::Config(errors));
        }

        let label = Self { paths };
        let value = label.encode();
        if value.len() > MAX_LABEL_VALUE_LEN {
            errors.push(format!(
                "storage label '{value}' is {} characters, node labels allow {MAX_LABEL_VALUE_LEN}",
                value.len()
            ));
        } else if !LABEL_VALUE.is_match(&value) {
            errors.push(format!(
                "storage label '{value}' is not a valid node label value, paths outside {STORAGE_ROOT} cannot be labelled"
            ));
        }
        if errors.is_empty() {
            Ok(label)
        } else {
            Err(ProvisionError::Config(errors))
        }
    }

    /// Decode a label value back into its paths
    pub fn parse(value: &str) -> Result<Self> {
        let paths = value
            .split(LABEL_DELIMITER)
            .filter(|id| !id.is_empty())
            .map(path_for_identifier)
            .collect::<Vec<_>>();
        Self::from_paths(paths)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn encode(&self) -> String {
        self.paths
            .iter()
            .map(|p| identifier(p))
            .collect::<Vec<_>>()
            .join(LABEL_DELIMITER)
    }
}

impl fmt::Display for NodeStorageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn identifier(path: &Path) -> String {
    let text = path.to_string_lossy();
    match text.strip_prefix(STORAGE_ROOT) {
        Some(rest) => rest.replace('/', SLASH_ESCAPE),
        None => text.replace('/', SLASH_ESCAPE),
    }
}

/// The encoding only round-trips when escapes and delimiters cannot blur
/// into neighbouring characters.
fn is_encodable(path: &Path) -> bool {
    let text = path.to_string_lossy();
    let id = identifier(path);
    !(text.contains(SLASH_ESCAPE)
        || text.contains("_/")
        || text.contains("/_")
        || id.contains(LABEL_DELIMITER)
        || id.starts_with('x')
        || id.ends_with('x')
        || id.is_empty())
}

fn path_for_identifier(id: &str) -> PathBuf {
    let restored = id.replace(SLASH_ESCAPE, "/");
    if restored.starts_with('/') {
        PathBuf::from(restored)
    } else {
        PathBuf::from(format!("{STORAGE_ROOT}{restored}"))
    }
}

#[derive(Serialize)]
struct NodeLabelDropIn {
    #[serde(rename = "node-label")]
    node_label: Vec<String>,
}

/// Labels this node should register with
pub fn node_labels(gpu_node: bool, storage: Option<&NodeStorageLabel>) -> Vec<String> {
    let mut labels = vec![format!("{GPU_LABEL_KEY}={gpu_node}")];
    if let Some(storage) = storage {
        labels.push(DEFAULT_DISK_LABEL.to_string());
        labels.push(INSTANCE_MANAGER_LABEL.to_string());
        labels.push(format!("{STORAGE_LABEL_KEY}={storage}"));
    }
    labels
}

/// Render the RKE2 `config.yaml.d` drop-in carrying the node labels
pub fn node_label_config(gpu_node: bool, storage: Option<&NodeStorageLabel>) -> Result<String> {
    let doc = NodeLabelDropIn {
        node_label: node_labels(gpu_node, storage),
    };
    Ok(serde_yaml::to_string(&doc)?)
}
