//! Host preparation steps: OS checks, packages, kernel settings, GPU, firewall

use std::path::Path;

use tera::Tera;

use super::{Phase, Step, StepContext, StepOutcome, StepResult};
use crate::config::NodeConfig;
use crate::error::ProvisionError;
use crate::exec::{ExecMode, Executor, FileKind, succeeded};
use crate::tasks::{EnsureFirewall, InstallPackage, Task, TaskResult, WriteFile, ensure, ensure_all};

pub const SUPPORTED_UBUNTU_VERSIONS: &[&str] = &["20.04", "22.04", "24.04"];

/// Minimum size of the partition holding `/var/lib/rancher`
pub const MIN_RANCHER_PARTITION_GB: u64 = 500;

/// Required `fs.inotify.max_user_instances`
pub const INOTIFY_TARGET: u64 = 512;

pub const MIN_MEMORY_GB: u64 = 4;
pub const RECOMMENDED_MEMORY_GB: u64 = 8;
pub const MIN_CPU_CORES: u64 = 2;
pub const MIN_ROOT_FREE_GB: u64 = 10;
pub const RECOMMENDED_ROOT_SIZE_GB: u64 = 20;

/// chrony configuration path
pub const CHRONY_CONF: &str = "/etc/chrony/chrony.conf";

const OS_RELEASE: &str = "/etc/os-release";
const RANCHER_DIR: &str = "/var/lib/rancher";
const SYSCTL_CONF: &str = "/etc/sysctl.conf";
const INOTIFY_KEY: &str = "fs.inotify.max_user_instances";
const MULTIPATH_CONF: &str = "/etc/multipath.conf";
const MULTIPATH_BLACKLIST_ENTRY: &str = r#"devnode "^sd[a-z0-9]+""#;
const UDEV_RULES_PATH: &str = "/etc/udev/rules.d/70-amdgpu.rules";
const UDEV_RULES: &str = include_str!("../../templates/70-amdgpu.rules");
const CHRONY_TEMPLATE: &str = include_str!("../../templates/chrony.conf.tera");
const MEMINFO: &str = "/proc/meminfo";

fn skip_unless_gpu(config: &NodeConfig) -> Option<&'static str> {
    (!config.gpu_node).then_some("not a GPU node")
}

/// Check `/etc/os-release` contents against the supported Ubuntu releases
pub fn check_os_release(contents: &str) -> Result<String, String> {
    let field = |key: &str| {
        contents.lines().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|value| value.trim().trim_matches('"').to_string())
        })
    };

    if field("ID").as_deref() != Some("ubuntu") {
        return Err("this system is not running Ubuntu".into());
    }
    match field("VERSION_ID") {
        Some(version) if SUPPORTED_UBUNTU_VERSIONS.contains(&version.as_str()) => Ok(version),
        Some(version) => Err(format!(
            "Ubuntu {version} is not supported, use one of: {}",
            SUPPORTED_UBUNTU_VERSIONS.join(", ")
        )),
        None => Err("could not determine the Ubuntu version".into()),
    }
}

/// Set `key=value` in sysctl.conf contents, replacing an existing line
pub fn set_sysctl_line(contents: &str, key: &str, value: u64) -> String {
    let wanted = format!("{key}={value}");
    let mut found = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            let setting = line.split('=').next().unwrap_or_default().trim();
            if !found && setting == key {
                found = true;
                wanted.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(wanted);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Memory, CPU and root filesystem capacity of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemResources {
    pub memory_kb: u64,
    pub cpu_cores: u64,
    pub root_free_gb: u64,
    pub root_size_gb: u64,
}

impl SystemResources {
    /// Problems that block the install, then warnings
    pub fn assess(&self) -> (Vec<String>, Vec<String>) {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();
        let memory_gb = self.memory_kb / (1024 * 1024);

        if memory_gb < MIN_MEMORY_GB {
            problems.push(format!(
                "{memory_gb}GB of memory, at least {MIN_MEMORY_GB}GB is required"
            ));
        } else if memory_gb < RECOMMENDED_MEMORY_GB {
            warnings.push(format!(
                "{memory_gb}GB of memory, {RECOMMENDED_MEMORY_GB}GB is recommended"
            ));
        }
        if self.cpu_cores < MIN_CPU_CORES {
            problems.push(format!(
                "{} CPU cores, at least {MIN_CPU_CORES} are required",
                self.cpu_cores
            ));
        }
        if self.root_free_gb < MIN_ROOT_FREE_GB {
            problems.push(format!(
                "{}GB free on /, at least {MIN_ROOT_FREE_GB}GB is required",
                self.root_free_gb
            ));
        }
        if self.root_size_gb < RECOMMENDED_ROOT_SIZE_GB {
            warnings.push(format!(
                "/ is {}GB, {RECOMMENDED_ROOT_SIZE_GB}GB is recommended",
                self.root_size_gb
            ));
        }
        (problems, warnings)
    }
}

/// `MemTotal` from `/proc/meminfo`, in kB
pub fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        line.strip_prefix("MemTotal:")?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    })
}

/// Sizes from `df -BG --output=avail,size`, as (available, size) in GB
pub fn parse_df_gigabytes(output: &str) -> Option<(u64, u64)> {
    let row = output.lines().nth(1)?;
    let mut fields = row
        .split_whitespace()
        .map(|f| f.trim_end_matches('G').parse::<u64>().ok());
    Some((fields.next()??, fields.next()??))
}

/// Render chrony.conf; additional nodes prefer the first node as a source
pub fn render_chrony_config(config: &NodeConfig) -> crate::error::Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("chrony", CHRONY_TEMPLATE)?;

    let mut context = tera::Context::new();
    if !config.first_node {
        context.insert("server_ip", &config.server_ip);
    }
    Ok(tera.render("chrony", &context)?)
}

fn read_optional(exec: &dyn Executor, op: &str, path: &Path) -> crate::error::Result<String> {
    if exec.stat(&format!("{op}.Stat"), path)?.is_none() {
        return Ok(String::new());
    }
    exec.read_file(&format!("{op}.Read"), path)
}

pub(super) fn check_os() -> Step {
    Step {
        id: "check-os",
        name: "Check Ubuntu Version",
        description: "Verify running on a supported Ubuntu version",
        phase: Phase::PreCluster,
        skip: None,
        action: run_check_os,
    }
}

fn run_check_os(ctx: &mut StepContext<'_>) -> StepResult {
    let contents = ctx
        .exec
        .read_file("CheckOs.ReadOsRelease", Path::new(OS_RELEASE))?;
    let version = check_os_release(&contents).map_err(ProvisionError::step)?;
    Ok(StepOutcome::message(format!("Ubuntu {version}")))
}

pub(super) fn validate_system_requirements() -> Step {
    Step {
        id: "validate-system-requirements",
        name: "Validate System Requirements",
        description: "Check memory, CPU cores and root disk space",
        phase: Phase::PreCluster,
        skip: None,
        action: run_validate_system_requirements,
    }
}

fn run_validate_system_requirements(ctx: &mut StepContext<'_>) -> StepResult {
    let exec = ctx.exec;
    let meminfo = exec.read_file("ValidateSystem.ReadMeminfo", Path::new(MEMINFO))?;
    let memory_kb = parse_mem_total(&meminfo)
        .ok_or_else(|| ProvisionError::step("MemTotal missing from /proc/meminfo"))?;

    let nproc = exec.probe("ValidateSystem.CpuCount", "nproc", &[])?;
    let cpu_cores = nproc
        .trim()
        .parse()
        .map_err(|_| ProvisionError::step(format!("unexpected nproc output: {}", nproc.trim())))?;

    let df = exec.probe(
        "ValidateSystem.RootSpace",
        "df",
        &["-BG", "--output=avail,size", "/"],
    )?;
    let (root_free_gb, root_size_gb) = parse_df_gigabytes(&df)
        .ok_or_else(|| ProvisionError::step(format!("unexpected df output: {df}")))?;

    let resources = SystemResources {
        memory_kb,
        cpu_cores,
        root_free_gb,
        root_size_gb,
    };
    let (problems, warnings) = resources.assess();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !problems.is_empty() {
        return Err(ProvisionError::step(format!(
            "system requirements not met: {}",
            problems.join("; ")
        )));
    }
    Ok(StepOutcome::message(format!(
        "{}GB memory, {cpu_cores} cores, {root_free_gb}GB free on /",
        memory_kb / (1024 * 1024)
    )))
}

pub(super) fn check_rancher_partition() -> Step {
    Step {
        id: "check-rancher-partition",
        name: "Check /var/lib/rancher Partition Size",
        description: "Check the partition holding /var/lib/rancher is large enough",
        phase: Phase::PreCluster,
        skip: Some(skip_rancher_partition_check),
        action: run_check_rancher_partition,
    }
}

fn skip_rancher_partition_check(config: &NodeConfig) -> Option<&'static str> {
    if config.skip_rancher_partition_check {
        Some("SKIP_RANCHER_PARTITION_CHECK is set")
    } else if !config.gpu_node {
        Some("not required on CPU nodes")
    } else {
        None
    }
}

fn run_check_rancher_partition(ctx: &mut StepContext<'_>) -> StepResult {
    // df needs an existing path; before the first install only the parent exists
    let target = match ctx
        .exec
        .stat("CheckRancherPartition.Stat", Path::new(RANCHER_DIR))?
    {
        Some(FileKind::Directory) => RANCHER_DIR,
        _ => "/var/lib",
    };
    let output = ctx.exec.probe(
        "CheckRancherPartition.DiskFree",
        "df",
        &["-BG", "--output=size", target],
    )?;
    let size = output
        .lines()
        .nth(1)
        .map(|l| l.trim().trim_end_matches('G'))
        .and_then(|l| l.parse::<u64>().ok())
        .ok_or_else(|| ProvisionError::step(format!("unexpected df output: {output}")))?;

    if size < MIN_RANCHER_PARTITION_GB {
        return Err(ProvisionError::step(format!(
            "{target} partition is {size}GB, less than the recommended {MIN_RANCHER_PARTITION_GB}GB"
        )));
    }
    Ok(StepOutcome::message(format!("{target} partition is {size}GB")))
}

pub(super) fn install_packages() -> Step {
    Step {
        id: "install-packages",
        name: "Install Dependent Packages",
        description: "Ensure chrony, jq, nfs-common and open-iscsi are installed",
        phase: Phase::PreCluster,
        skip: None,
        action: |ctx| {
            let packages = ["open-iscsi", "jq", "nfs-common", "chrony"].map(InstallPackage::apt);
            let tasks: Vec<&dyn Task> = packages.iter().map(|p| p as &dyn Task).collect();
            let applied = ensure_all(ctx.exec, &tasks)?;
            Ok(StepOutcome::message(format!("{applied} packages installed")))
        },
    }
}

pub(super) fn setup_multipath() -> Step {
    Step {
        id: "setup-multipath",
        name: "Setup Multipath",
        description: "Configure multipath to blacklist standard devices",
        phase: Phase::PreCluster,
        skip: None,
        action: run_setup_multipath,
    }
}

fn run_setup_multipath(ctx: &mut StepContext<'_>) -> StepResult {
    let path = Path::new(MULTIPATH_CONF);
    let block = format!("blacklist {{\n    {MULTIPATH_BLACKLIST_ENTRY}\n}}\n");

    let (contents, message) = if ctx.exec.stat("SetupMultipath.Stat", path)?.is_none() {
        (block, "created multipath.conf")
    } else {
        let current = ctx.exec.read_file("SetupMultipath.Read", path)?;
        if current.contains(MULTIPATH_BLACKLIST_ENTRY) {
            return Ok(StepOutcome::message("blacklist entry already present"));
        }
        let updated = if current.contains("blacklist {") {
            current.replacen(
                "blacklist {",
                &format!("blacklist {{\n    {MULTIPATH_BLACKLIST_ENTRY}"),
                1,
            )
        } else {
            format!("{current}{block}")
        };
        (updated, "added blacklist entry to multipath.conf")
    };

    ctx.exec.write_file("SetupMultipath.Write", path, &contents)?;
    ctx.exec.run(
        "SetupMultipath.Restart",
        "systemctl",
        &["restart", "multipathd.service"],
    )?;
    ctx.exec.probe("SetupMultipath.Verify", "multipath", &["-t"])?;
    Ok(StepOutcome::message(message))
}

pub(super) fn update_modprobe() -> Step {
    Step {
        id: "update-modprobe",
        name: "Update Modprobe",
        description: "Un-blacklist and load the amdgpu module",
        phase: Phase::PreCluster,
        skip: Some(skip_unless_gpu),
        action: |ctx| {
            ctx.exec.run(
                "UpdateModprobe.Unblacklist",
                "sh",
                &["-c", "sed -i '/^blacklist amdgpu/s/^/# /' /etc/modprobe.d/*.conf"],
            )?;
            ctx.exec.run("UpdateModprobe.Load", "modprobe", &["amdgpu"])?;
            Ok(StepOutcome::done())
        },
    }
}

pub(super) fn install_k8s_tools() -> Step {
    Step {
        id: "install-k8s-tools",
        name: "Install Kubernetes tools",
        description: "Install kubectl and k9s",
        phase: Phase::PreCluster,
        skip: None,
        action: |ctx| {
            let kubectl = InstallPackage::snap("kubectl", true);
            let k9s = InstallPackage::snap("k9s", false);
            ensure_all(ctx.exec, &[&kubectl, &k9s])?;
            Ok(StepOutcome::done())
        },
    }
}

pub(super) fn inotify_instances() -> Step {
    Step {
        id: "inotify-instances",
        name: "Verify inotify instances",
        description: "Raise fs.inotify.max_user_instances when too low",
        phase: Phase::PreCluster,
        skip: None,
        action: run_inotify_instances,
    }
}

fn run_inotify_instances(ctx: &mut StepContext<'_>) -> StepResult {
    let output = ctx
        .exec
        .probe("InotifyInstances.Read", "sysctl", &["-n", INOTIFY_KEY])?;
    let current: u64 = output.trim().parse().map_err(|_| {
        ProvisionError::step(format!("unexpected {INOTIFY_KEY} value: {}", output.trim()))
    })?;

    if current >= INOTIFY_TARGET {
        return Ok(StepOutcome::message(format!(
            "{INOTIFY_KEY} is {current}, no update required"
        )));
    }

    tracing::info!(current, target = INOTIFY_TARGET, "raising inotify instances");
    ctx.exec.run(
        "InotifyInstances.Set",
        "sysctl",
        &["-w", &format!("{INOTIFY_KEY}={INOTIFY_TARGET}")],
    )?;
    let conf = read_optional(ctx.exec, "InotifyInstances.Conf", Path::new(SYSCTL_CONF))?;
    ctx.exec.write_file(
        "InotifyInstances.Persist",
        Path::new(SYSCTL_CONF),
        &set_sysctl_line(&conf, INOTIFY_KEY, INOTIFY_TARGET),
    )?;
    Ok(StepOutcome::message(format!(
        "{INOTIFY_KEY} raised from {current} to {INOTIFY_TARGET}"
    )))
}

pub(super) fn setup_rocm() -> Step {
    Step {
        id: "setup-rocm",
        name: "Setup and Check ROCm",
        description: "Install ROCm if missing and list the GPU devices",
        phase: Phase::PreCluster,
        skip: Some(skip_unless_gpu),
        action: run_setup_rocm,
    }
}

fn run_setup_rocm(ctx: &mut StepContext<'_>) -> StepResult {
    let exec = ctx.exec;
    let installed = succeeded(exec.probe(
        "SetupRocm.Check",
        "sh",
        &["-c", "command -v rocm-smi"],
    ))?;

    if installed {
        tracing::info!("rocm-smi found, skipping ROCm install");
    } else {
        install_rocm(ctx.config, exec)?;
        if exec.mode() == ExecMode::DryRun {
            return Ok(StepOutcome::message(
                "would list GPU devices with rocm-smi once ROCm is installed",
            ));
        }
    }

    let devices = exec.probe(
        "SetupRocm.ListDevices",
        "sh",
        &[
            "-c",
            r#"rocm-smi -i --json | jq -r '.[] | .["Device Name"]' | sort | uniq -c"#,
        ],
    )?;
    let counted = devices
        .lines()
        .filter(|l| !l.trim().is_empty())
        .all(|l| {
            l.split_whitespace()
                .next()
                .is_some_and(|n| n.parse::<u32>().is_ok())
        });
    if devices.trim().is_empty() || !counted {
        return Err(ProvisionError::step(format!(
            "rocm-smi did not return any GPUs: {}",
            devices.trim()
        )));
    }
    Ok(StepOutcome::message(format!("ROCm devices:\n{}", devices.trim_end())))
}

fn install_rocm(config: &NodeConfig, exec: &dyn Executor) -> crate::error::Result<()> {
    let os_release = exec.read_file("SetupRocm.ReadOsRelease", Path::new(OS_RELEASE))?;
    let codename = os_release
        .lines()
        .find_map(|l| l.strip_prefix("VERSION_CODENAME="))
        .map(|c| c.trim().trim_matches('"').to_string())
        .ok_or_else(|| ProvisionError::step("could not determine the Ubuntu codename"))?;
    let kernel = exec.probe("SetupRocm.KernelRelease", "uname", &["-r"])?;
    let kernel = kernel.trim();

    let url = format!(
        "{}{codename}/{}",
        config.rocm_base_url, config.rocm_deb_package
    );
    let deb = format!("/tmp/{}", config.rocm_deb_package);

    exec.run("SetupRocm.AptUpdate", "apt-get", &["update"])?;
    exec.run(
        "SetupRocm.KernelPackages",
        "apt-get",
        &[
            "install",
            "-y",
            &format!("linux-headers-{kernel}"),
            &format!("linux-modules-extra-{kernel}"),
        ],
    )?;
    exec.run(
        "SetupRocm.PythonPackages",
        "apt-get",
        &["install", "-y", "python3-setuptools", "python3-wheel"],
    )?;
    exec.run("SetupRocm.Download", "wget", &["-q", "-O", &deb, &url])?;
    exec.run("SetupRocm.InstallInstaller", "apt-get", &["install", "-y", &deb])?;
    exec.run(
        "SetupRocm.Install",
        "amdgpu-install",
        &["--usecase=rocm,dkms", "--yes"],
    )?;
    exec.run("SetupRocm.LoadModule", "modprobe", &["amdgpu"])?;
    tracing::info!(%url, "installed ROCm");
    Ok(())
}

pub(super) fn check_ports() -> Step {
    Step {
        id: "check-ports",
        name: "Check Ports",
        description: "Warn about ports another process already listens on",
        phase: Phase::PreCluster,
        skip: None,
        action: run_check_ports,
    }
}

/// Ports in use only produce warnings; RKE2 may already hold them on a rerun.
fn run_check_ports(ctx: &mut StepContext<'_>) -> StepResult {
    let mut busy = Vec::new();
    for rule in &EnsureFirewall::kubernetes_node().rules {
        if rule.port.contains(':') {
            tracing::debug!(%rule, "not checking port range");
            continue;
        }
        let spec = format!("{}:{}", rule.protocol.to_string().to_uppercase(), rule.port);
        if succeeded(ctx.exec.probe(&format!("CheckPorts.{rule}"), "lsof", &["-i", &spec]))? {
            tracing::warn!(%rule, "port already in use");
            busy.push(rule.to_string());
        }
    }

    if busy.is_empty() {
        Ok(StepOutcome::message("all ports free"))
    } else {
        Ok(StepOutcome::message(format!("ports in use: {}", busy.join(", "))))
    }
}

pub(super) fn open_ports() -> Step {
    Step {
        id: "open-ports",
        name: "Open Ports",
        description: "Ensure needed ports are open in iptables",
        phase: Phase::PreCluster,
        skip: None,
        action: |ctx| {
            let firewall = EnsureFirewall::kubernetes_node();
            match ensure(ctx.exec, &firewall)? {
                TaskResult::Applied => Ok(StepOutcome::message("firewall rules added and saved")),
                TaskResult::Satisfied => Ok(StepOutcome::message("all ports already open")),
            }
        },
    }
}

pub(super) fn update_udev_rules() -> Step {
    Step {
        id: "update-udev-rules",
        name: "Update Udev Rules",
        description: "Give the video group access to AMD GPU devices",
        phase: Phase::PreCluster,
        skip: Some(skip_unless_gpu),
        action: |ctx| {
            let rules = WriteFile::new(UDEV_RULES_PATH, UDEV_RULES).with_permissions("0644");
            if ensure(ctx.exec, &rules)? == TaskResult::Satisfied {
                return Ok(StepOutcome::message("udev rules already current"));
            }
            ctx.exec
                .run("UpdateUdevRules.Reload", "udevadm", &["control", "--reload-rules"])?;
            ctx.exec.run("UpdateUdevRules.Trigger", "udevadm", &["trigger"])?;
            Ok(StepOutcome::done())
        },
    }
}

pub(super) fn create_chrony_config() -> Step {
    Step {
        id: "create-chrony-config",
        name: "Create Chrony Config",
        description: "Configure time sync; additional nodes follow the first node",
        phase: Phase::PostCluster,
        skip: None,
        action: run_create_chrony_config,
    }
}

fn run_create_chrony_config(ctx: &mut StepContext<'_>) -> StepResult {
    let exec = ctx.exec;
    let path = Path::new(CHRONY_CONF);
    let chrony = WriteFile::new(path, render_chrony_config(ctx.config)?).with_permissions("0644");
    if chrony.is_satisfied(exec)? {
        return Ok(StepOutcome::message("chrony.conf already current"));
    }

    if exec.stat("CreateChronyConfig.Stat", path)?.is_some() {
        let backup = Path::new("/etc/chrony/chrony.conf.bak");
        exec.copy_file("CreateChronyConfig.Backup", path, backup)?;
    }
    chrony.apply(exec)?;
    exec.run(
        "CreateChronyConfig.Restart",
        "systemctl",
        &["restart", "chronyd"],
    )?;
    Ok(StepOutcome::message("chrony.conf written, chronyd restarted"))
}
