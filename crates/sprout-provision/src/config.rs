//! Configuration for a node provisioning run
//!
//! The configuration arrives as a flat key/value map (TOML file, environment,
//! command line) and is converted once into an immutable [`NodeConfig`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::disks::NodeStorageLabel;
use crate::error::{ProvisionError, Result};

pub const DEFAULT_RKE2_INSTALLATION_URL: &str = "https://get.rke2.io";
pub const DEFAULT_ROCM_BASE_URL: &str = "https://repo.radeon.com/amdgpu-install/6.3.2/ubuntu/";
pub const DEFAULT_ROCM_DEB_PACKAGE: &str = "amdgpu-install_6.3.60302-1_all.deb";
pub const DEFAULT_KUBECONFIG_PATH: &str = "/root/.kube/config";
pub const DEFAULT_JOIN_COMMAND_PATH: &str = "additional_node_command.txt";

/// Keys understood by [`NodeConfig::from_map`]
pub const KEYS: &[&str] = &[
    "FIRST_NODE",
    "CONTROL_PLANE",
    "GPU_NODE",
    "NO_DISKS_FOR_CLUSTER",
    "CLUSTER_DISKS",
    "CLUSTER_PREMOUNTED_DISKS",
    "ENABLED_STEPS",
    "DISABLED_STEPS",
    "CLEAN_DISKS",
    "SKIP_RANCHER_PARTITION_CHECK",
    "SERVER_IP",
    "JOIN_TOKEN",
    "DOMAIN",
    "RKE2_INSTALLATION_URL",
    "RKE2_VERSION",
    "ROCM_BASE_URL",
    "ROCM_DEB_PACKAGE",
    "KUBECONFIG_PATH",
    "JOIN_COMMAND_PATH",
];

/// Configuration for one provisioning run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// First control-plane node of a new cluster
    pub first_node: bool,
    /// Additional node joins as a server rather than an agent
    pub control_plane: bool,
    /// Node carries AMD GPUs
    pub gpu_node: bool,
    /// Skip the disk engine entirely
    pub no_disks_for_cluster: bool,
    /// Explicit device paths; skips discovery when set
    pub cluster_disks: Vec<String>,
    /// Storage paths the operator already mounted
    pub cluster_premounted_disks: Vec<PathBuf>,
    pub enabled_steps: Vec<String>,
    pub disabled_steps: Vec<String>,
    /// Remove previously managed mounts before provisioning
    pub clean_disks: bool,
    pub skip_rancher_partition_check: bool,
    /// Address of the first server (additional nodes)
    pub server_ip: Option<String>,
    /// Cluster join token (additional nodes)
    pub join_token: Option<String>,
    /// Cluster domain, added to the API server certificate
    pub domain: Option<String>,
    pub rke2_installation_url: String,
    pub rke2_version: Option<String>,
    pub rocm_base_url: String,
    pub rocm_deb_package: String,
    pub kubeconfig_path: PathBuf,
    /// Where the first node writes the join command for additional nodes
    pub join_command_path: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            first_node: true,
            control_plane: false,
            gpu_node: true,
            no_disks_for_cluster: false,
            cluster_disks: vec![],
            cluster_premounted_disks: vec![],
            enabled_steps: vec![],
            disabled_steps: vec![],
            clean_disks: false,
            skip_rancher_partition_check: false,
            server_ip: None,
            join_token: None,
            domain: None,
            rke2_installation_url: DEFAULT_RKE2_INSTALLATION_URL.into(),
            rke2_version: None,
            rocm_base_url: DEFAULT_ROCM_BASE_URL.into(),
            rocm_deb_package: DEFAULT_ROCM_DEB_PACKAGE.into(),
            kubeconfig_path: DEFAULT_KUBECONFIG_PATH.into(),
            join_command_path: DEFAULT_JOIN_COMMAND_PATH.into(),
        }
    }
}

impl NodeConfig {
    /// Create a new config builder
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Build from a flat key/value map.
    ///
    /// Values that fail to convert are reported together. Unknown keys are
    /// logged and ignored.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        let mut errors = Vec::new();

        for (key, value) in map {
            let value = value.trim();
            match key.as_str() {
                "FIRST_NODE" => set_bool(&mut config.first_node, key, value, &mut errors),
                "CONTROL_PLANE" => set_bool(&mut config.control_plane, key, value, &mut errors),
                "GPU_NODE" => set_bool(&mut config.gpu_node, key, value, &mut errors),
                "NO_DISKS_FOR_CLUSTER" => {
                    set_bool(&mut config.no_disks_for_cluster, key, value, &mut errors);
                }
                "CLEAN_DISKS" => set_bool(&mut config.clean_disks, key, value, &mut errors),
                "SKIP_RANCHER_PARTITION_CHECK" => set_bool(
                    &mut config.skip_rancher_partition_check,
                    key,
                    value,
                    &mut errors,
                ),
                "CLUSTER_DISKS" => config.cluster_disks = split_list(value),
                "CLUSTER_PREMOUNTED_DISKS" => {
                    config.cluster_premounted_disks =
                        split_list(value).into_iter().map(PathBuf::from).collect();
                }
                "ENABLED_STEPS" => config.enabled_steps = split_list(value),
                "DISABLED_STEPS" => config.disabled_steps = split_list(value),
                "SERVER_IP" => config.server_ip = non_empty(value),
                "JOIN_TOKEN" => config.join_token = non_empty(value),
                "DOMAIN" => config.domain = non_empty(value),
                "RKE2_VERSION" => config.rke2_version = non_empty(value),
                "RKE2_INSTALLATION_URL" => {
                    if let Some(v) = non_empty(value) {
                        config.rke2_installation_url = v;
                    }
                }
                "ROCM_BASE_URL" => {
                    if let Some(v) = non_empty(value) {
                        config.rocm_base_url = v;
                    }
                }
                "ROCM_DEB_PACKAGE" => {
                    if let Some(v) = non_empty(value) {
                        config.rocm_deb_package = v;
                    }
                }
                "KUBECONFIG_PATH" => {
                    if let Some(v) = non_empty(value) {
                        config.kubeconfig_path = v.into();
                    }
                }
                "JOIN_COMMAND_PATH" => {
                    if let Some(v) = non_empty(value) {
                        config.join_command_path = v.into();
                    }
                }
                other => tracing::warn!(key = other, "ignoring unknown configuration key"),
            }
        }

        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ProvisionError::Config(errors))
        }
    }

    /// Cross-field checks; every problem is returned, not just the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.first_node {
            if self.server_ip.is_none() {
                errors.push("SERVER_IP is required when FIRST_NODE is false".to_string());
            }
            if self.join_token.is_none() {
                errors.push("JOIN_TOKEN is required when FIRST_NODE is false".to_string());
            }
        } else if self.control_plane {
            errors.push("CONTROL_PLANE only applies when FIRST_NODE is false".to_string());
        }

        if self.no_disks_for_cluster
            && (!self.cluster_disks.is_empty() || !self.cluster_premounted_disks.is_empty())
        {
            errors.push(
                "NO_DISKS_FOR_CLUSTER cannot be combined with CLUSTER_DISKS or CLUSTER_PREMOUNTED_DISKS"
                    .to_string(),
            );
        }
        if !self.cluster_disks.is_empty() && !self.cluster_premounted_disks.is_empty() {
            errors.push(
                "CLUSTER_DISKS and CLUSTER_PREMOUNTED_DISKS are mutually exclusive".to_string(),
            );
        }
        for disk in &self.cluster_disks {
            if !disk.starts_with("/dev/") {
                errors.push(format!("CLUSTER_DISKS entry '{disk}' is not a /dev path"));
            }
        }
        for path in &self.cluster_premounted_disks {
            if !path.is_absolute() {
                errors.push(format!(
                    "CLUSTER_PREMOUNTED_DISKS entry '{}' is not an absolute path",
                    path.display()
                ));
            }
        }
        // The paths end up in a node label, which RKE2 only checks at startup
        if !self.cluster_premounted_disks.is_empty()
            && self.cluster_premounted_disks.iter().all(|p| p.is_absolute())
            && let Err(ProvisionError::Config(problems)) =
                NodeStorageLabel::from_paths(self.cluster_premounted_disks.iter().cloned())
        {
            errors.extend(
                problems
                    .into_iter()
                    .map(|p| format!("CLUSTER_PREMOUNTED_DISKS: {p}")),
            );
        }

        errors
    }

    /// Disk discovery, formatting and mounting are needed
    pub fn manages_disks(&self) -> bool {
        !self.no_disks_for_cluster && self.cluster_premounted_disks.is_empty()
    }

    /// Create a test configuration for unit tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            gpu_node: false,
            cluster_disks: vec!["/dev/sdb".into()],
            domain: Some("cluster.example.com".into()),
            ..Self::default()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn set_bool(target: &mut bool, key: &str, value: &str, errors: &mut Vec<String>) {
    match parse_bool(value) {
        Some(v) => *target = v,
        None => errors.push(format!("{key} must be a boolean, got '{value}'")),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Builder for `NodeConfig`
#[derive(Debug, Clone, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Mark this as the first node of the cluster
    pub fn first_node(mut self, first: bool) -> Self {
        self.config.first_node = first;
        self
    }

    /// Join as an additional control-plane node
    pub fn control_plane(mut self, control_plane: bool) -> Self {
        self.config.control_plane = control_plane;
        self
    }

    /// Node has GPUs
    pub fn gpu_node(mut self, gpu: bool) -> Self {
        self.config.gpu_node = gpu;
        self
    }

    /// Skip all disk handling
    pub fn no_disks_for_cluster(mut self, no_disks: bool) -> Self {
        self.config.no_disks_for_cluster = no_disks;
        self
    }

    /// Use these devices instead of discovering them
    pub fn cluster_disks(mut self, disks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.cluster_disks = disks.into_iter().map(Into::into).collect();
        self
    }

    /// Use these already-mounted paths for storage
    pub fn premounted_disks(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.config.cluster_premounted_disks = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Only run these step ids
    pub fn enabled_steps(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.enabled_steps = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Never run these step ids
    pub fn disabled_steps(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.disabled_steps = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Remove previously managed mounts first
    pub fn clean_disks(mut self, clean: bool) -> Self {
        self.config.clean_disks = clean;
        self
    }

    /// Set the first server's address and join token
    pub fn join(mut self, server_ip: impl Into<String>, token: impl Into<String>) -> Self {
        self.config.server_ip = Some(server_ip.into());
        self.config.join_token = Some(token.into());
        self
    }

    /// Set the cluster domain
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = Some(domain.into());
        self
    }

    /// Pin an RKE2 release
    pub fn rke2_version(mut self, version: impl Into<String>) -> Self {
        self.config.rke2_version = Some(version.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> NodeConfig {
        self.config
    }
}
