//! Step catalogue
//!
//! The ordered list of installation steps. Each [`Step`] is plain data: a
//! stable id, a phase, an optional pure skip predicate and an action. The
//! orchestrator consumes the catalogue read-only.

mod cluster;
mod host;
mod storage;

pub use cluster::{
    JOIN_PORT, MANIFEST_DIR, NODE_TOKEN_PATH, RKE2_CONFIG_PATH, RKE2_KUBECONFIG_PATH,
    join_command, parse_route_source, render_rke2_config,
};
pub use host::{
    CHRONY_CONF, INOTIFY_TARGET, MIN_CPU_CORES, MIN_MEMORY_GB, MIN_RANCHER_PARTITION_GB,
    MIN_ROOT_FREE_GB, RECOMMENDED_MEMORY_GB, RECOMMENDED_ROOT_SIZE_GB, SUPPORTED_UBUNTU_VERSIONS,
    SystemResources, check_os_release, parse_df_gigabytes, parse_mem_total, render_chrony_config,
    set_sysctl_line,
};
pub use storage::{NODE_LABEL_DROP_IN, longhorn_mount_points};

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::config::NodeConfig;
use crate::disks::{DiskSelector, MountedDisk, NodeStorageLabel};
use crate::error::{ProvisionError, Result};
use crate::exec::{ExecMode, Executor, audit_mutation};

/// Installation phase; declaration order is execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    PreCluster,
    ClusterBootstrap,
    PostCluster,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreCluster => write!(f, "pre-cluster"),
            Self::ClusterBootstrap => write!(f, "cluster-bootstrap"),
            Self::PostCluster => write!(f, "post-cluster"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre-cluster" => Ok(Self::PreCluster),
            "cluster-bootstrap" => Ok(Self::ClusterBootstrap),
            "post-cluster" => Ok(Self::PostCluster),
            other => Err(ProvisionError::Catalogue(format!("unknown phase '{other}'"))),
        }
    }
}

/// Informational result of a successful step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub message: Option<String>,
}

impl StepOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

pub type StepResult = Result<StepOutcome>;

/// Pure predicate returning a reason to skip
pub type SkipFn = fn(&NodeConfig) -> Option<&'static str>;

/// Side-effecting step body
pub type ActionFn = fn(&mut StepContext<'_>) -> StepResult;

/// One installable unit of work
#[derive(Clone)]
pub struct Step {
    /// Stable, machine-referenceable id (kebab-case)
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub phase: Phase,
    pub skip: Option<SkipFn>,
    pub action: ActionFn,
}

impl Step {
    /// Reason this step should be skipped for `config`, if any
    pub fn skip_reason(&self, config: &NodeConfig) -> Option<&'static str> {
        self.skip.and_then(|skip| skip(config))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("skip", &self.skip.is_some())
            .finish_non_exhaustive()
    }
}

/// Data produced by one step and consumed by a later one
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Suffix shared by every backup made during this run
    pub stamp: String,
    pub selected_disks: Vec<String>,
    pub mounted: Vec<MountedDisk>,
    pub storage_label: Option<NodeStorageLabel>,
    /// Primary address of this node, once resolved
    pub node_ip: Option<String>,
    /// Mount table already backed up during this run
    pub fstab_backed_up: bool,
}

impl RunState {
    pub fn new(stamp: impl Into<String>) -> Self {
        Self {
            stamp: stamp.into(),
            ..Self::default()
        }
    }
}

/// Everything a step action may touch
pub struct StepContext<'a> {
    pub config: &'a NodeConfig,
    pub exec: &'a dyn Executor,
    pub selector: &'a dyn DiskSelector,
    pub state: RunState,
}

impl<'a> StepContext<'a> {
    pub fn new(
        config: &'a NodeConfig,
        exec: &'a dyn Executor,
        selector: &'a dyn DiskSelector,
    ) -> Self {
        Self {
            config,
            exec,
            selector,
            state: RunState::new(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()),
        }
    }

    /// Replace the backup stamp (tests pin it)
    pub fn with_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.state.stamp = stamp.into();
        self
    }
}

/// Read a file an earlier step creates.
///
/// During a dry run that step only logged its write, so a missing file
/// gives `None` and the caller reports what it would have done.
fn read_produced(exec: &dyn Executor, op: &str, path: &Path) -> Result<Option<String>> {
    if exec.mode() == ExecMode::DryRun && exec.stat(&format!("{op}.Stat"), path)?.is_none() {
        audit_mutation(
            ExecMode::DryRun,
            op,
            &format!("would read {}", path.display()),
        );
        return Ok(None);
    }
    exec.read_file(op, path).map(Some)
}

/// Validated, phase-ordered list of steps
#[derive(Debug, Clone)]
pub struct Catalogue {
    steps: Vec<Step>,
}

impl Catalogue {
    /// Build a catalogue, checking id uniqueness and phase order
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut last = Phase::PreCluster;
        for step in &steps {
            if !seen.insert(step.id) {
                return Err(ProvisionError::Catalogue(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.phase < last {
                return Err(ProvisionError::Catalogue(format!(
                    "step '{}' ({}) declared after a {} step",
                    step.id, step.phase, last
                )));
            }
            last = step.phase;
        }
        Ok(Self { steps })
    }

    /// The full node installation
    pub fn standard() -> Result<Self> {
        Self::new(vec![
            host::check_os(),
            host::validate_system_requirements(),
            host::check_rancher_partition(),
            storage::check_nvme_drives(),
            host::install_packages(),
            storage::clean_longhorn_mounts(),
            cluster::uninstall_rke2(),
            storage::clean_disks(),
            host::setup_multipath(),
            host::update_modprobe(),
            storage::select_disks(),
            storage::prepare_disks(),
            cluster::prepare_rke2(),
            storage::generate_node_labels(),
            host::install_k8s_tools(),
            host::inotify_instances(),
            host::setup_rocm(),
            host::check_ports(),
            host::open_ports(),
            host::update_udev_rules(),
            cluster::setup_rke2(),
            host::create_chrony_config(),
            cluster::setup_longhorn(),
            cluster::setup_metallb(),
            cluster::create_metallb_config(),
            cluster::setup_kubeconfig(),
            cluster::final_output(),
        ])
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.steps.iter().map(|s| s.id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut StepContext<'_>) -> StepResult {
        Ok(StepOutcome::done())
    }

    fn step(id: &'static str, phase: Phase) -> Step {
        Step {
            id,
            name: id,
            description: "",
            phase,
            skip: None,
            action: noop,
        }
    }

    #[test]
    fn test_standard_order() {
        let catalogue = Catalogue::standard().unwrap();
        let ids: Vec<_> = catalogue.ids().collect();
        assert_eq!(
            ids,
            vec![
                "check-os",
                "validate-system-requirements",
                "check-rancher-partition",
                "check-nvme-drives",
                "install-packages",
                "clean-longhorn-mounts",
                "uninstall-rke2",
                "clean-disks",
                "setup-multipath",
                "update-modprobe",
                "select-disks",
                "prepare-disks",
                "prepare-rke2",
                "generate-node-labels",
                "install-k8s-tools",
                "inotify-instances",
                "setup-rocm",
                "check-ports",
                "open-ports",
                "update-udev-rules",
                "setup-rke2",
                "create-chrony-config",
                "setup-longhorn",
                "setup-metallb",
                "create-metallb-config",
                "setup-kubeconfig",
                "final-output",
            ]
        );
        assert_eq!(
            catalogue.get("setup-rke2").unwrap().phase,
            Phase::ClusterBootstrap
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = Catalogue::new(vec![
            step("a", Phase::PreCluster),
            step("a", Phase::PostCluster),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'a'"));
    }

    #[test]
    fn test_phase_regression_rejected() {
        let err = Catalogue::new(vec![
            step("bootstrap", Phase::ClusterBootstrap),
            step("late-check", Phase::PreCluster),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("late-check"));
    }

    #[test]
    fn test_phase_text_round_trip() {
        for phase in [Phase::PreCluster, Phase::ClusterBootstrap, Phase::PostCluster] {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        assert!(Phase::PreCluster < Phase::PostCluster);
    }

    #[test]
    fn test_gpu_steps_skip_on_cpu_nodes() {
        let catalogue = Catalogue::standard().unwrap();
        let config = NodeConfig::test_config();
        for id in ["update-modprobe", "setup-rocm", "update-udev-rules"] {
            assert!(
                catalogue.get(id).unwrap().skip_reason(&config).is_some(),
                "{id} should skip"
            );
        }
        assert!(
            catalogue
                .get("open-ports")
                .unwrap()
                .skip_reason(&config)
                .is_none()
        );
    }
}
