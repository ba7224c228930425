//! RKE2 bootstrap and cluster add-on steps

use std::path::Path;

use tera::Tera;

use super::{Phase, Step, StepContext, StepOutcome, StepResult, read_produced};
use crate::config::NodeConfig;
use crate::error::{ProvisionError, Result};
use crate::exec::FileKind;
use crate::tasks::{EnsureDirectory, EnsureService, RunCommand, TaskResult, WriteFile, ensure};

pub const RKE2_CONFIG_PATH: &str = "/etc/rancher/rke2/config.yaml";
pub const RKE2_KUBECONFIG_PATH: &str = "/etc/rancher/rke2/rke2.yaml";
pub const NODE_TOKEN_PATH: &str = "/var/lib/rancher/rke2/server/node-token";
/// Directory the RKE2 helm controller applies on startup
pub const MANIFEST_DIR: &str = "/var/lib/rancher/rke2/server/manifests";
/// Supervisor port additional nodes register through
pub const JOIN_PORT: u16 = 9345;

const RKE2_CONFIG_DIR: &str = "/etc/rancher/rke2";
const RKE2_UNINSTALL_SCRIPT: &str = "/usr/local/bin/rke2-uninstall.sh";
const RKE2_CONFIG_TEMPLATE: &str = include_str!("../../templates/rke2-config.yaml.tera");
const METALLB_ADDRESS_TEMPLATE: &str = include_str!("../../templates/metallb-address.yaml.tera");
const LONGHORN_MANIFEST: &str = include_str!("../../templates/longhorn.yaml");
const METALLB_MANIFEST: &str = include_str!("../../templates/metallb.yaml");

fn skip_unless_first_node(config: &NodeConfig) -> Option<&'static str> {
    (!config.first_node).then_some("only runs on the first node")
}

/// Render `/etc/rancher/rke2/config.yaml` for this node
pub fn render_rke2_config(config: &NodeConfig) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("rke2-config", RKE2_CONFIG_TEMPLATE)?;

    let mut context = tera::Context::new();
    context.insert("domain", &config.domain);
    if !config.first_node {
        context.insert("server_ip", &config.server_ip);
        context.insert("join_token", &config.join_token);
    }
    Ok(tera.render("rke2-config", &context)?)
}

fn render_metallb_address(address: &str) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("metallb-address", METALLB_ADDRESS_TEMPLATE)?;

    let mut context = tera::Context::new();
    context.insert("address", address);
    Ok(tera.render("metallb-address", &context)?)
}

/// Source address from `ip route get` output
pub fn parse_route_source(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "src" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

/// One-liner an operator runs on a new machine to join this cluster
pub fn join_command(server_ip: &str, token: &str) -> String {
    format!(
        "printf 'FIRST_NODE = false\\nSERVER_IP = \"{server_ip}\"\\nJOIN_TOKEN = \"{token}\"\\n' > sprout.toml && sudo ./sprout --config sprout.toml run --yes\n"
    )
}

/// Primary address of this node, resolved once per run
fn node_ip(ctx: &mut StepContext<'_>) -> Result<String> {
    if let Some(ip) = &ctx.state.node_ip {
        return Ok(ip.clone());
    }
    let route = ctx
        .exec
        .probe("Network.RouteSource", "ip", &["route", "get", "1.1.1.1"])?;
    let ip = parse_route_source(&route)
        .ok_or_else(|| ProvisionError::step("default IP address could not be determined"))?;
    tracing::debug!(%ip, "resolved node address");
    ctx.state.node_ip = Some(ip.clone());
    Ok(ip)
}

fn write_manifest(ctx: &StepContext<'_>, name: &str, contents: &str) -> StepResult {
    ensure(ctx.exec, &EnsureDirectory::new(MANIFEST_DIR).with_mode("0755"))?;
    let path = Path::new(MANIFEST_DIR).join(name);
    let manifest = WriteFile::new(&path, contents).with_permissions("0644");
    Ok(match ensure(ctx.exec, &manifest)? {
        TaskResult::Applied => StepOutcome::message(format!("wrote {}", path.display())),
        TaskResult::Satisfied => StepOutcome::message(format!("{} unchanged", path.display())),
    })
}

pub(super) fn uninstall_rke2() -> Step {
    Step {
        id: "uninstall-rke2",
        name: "Uninstall RKE2",
        description: "Run the RKE2 uninstall script if it exists",
        phase: Phase::PreCluster,
        skip: None,
        action: run_uninstall_rke2,
    }
}

fn run_uninstall_rke2(ctx: &mut StepContext<'_>) -> StepResult {
    let script = Path::new(RKE2_UNINSTALL_SCRIPT);
    if ctx.exec.stat("UninstallRke2.Stat", script)? != Some(FileKind::File) {
        return Ok(StepOutcome::message("RKE2 is not installed"));
    }

    tracing::info!("uninstalling RKE2, this takes a couple of minutes");
    match ctx.exec.run("UninstallRke2.Run", RKE2_UNINSTALL_SCRIPT, &[]) {
        Ok(_) => Ok(StepOutcome::message("RKE2 uninstalled")),
        Err(e @ ProvisionError::Command { .. }) => {
            tracing::warn!(error = %e, "RKE2 uninstall script failed, continuing");
            Ok(StepOutcome::message("RKE2 uninstall script reported an error"))
        }
        Err(e) => Err(e),
    }
}

pub(super) fn prepare_rke2() -> Step {
    Step {
        id: "prepare-rke2",
        name: "Prepare for RKE2",
        description: "Load storage kernel modules and write the RKE2 config",
        phase: Phase::PreCluster,
        skip: None,
        action: run_prepare_rke2,
    }
}

fn run_prepare_rke2(ctx: &mut StepContext<'_>) -> StepResult {
    for module in ["iscsi_tcp", "dm_mod"] {
        ctx.exec
            .run(&format!("PrepareRke2.Modprobe.{module}"), "modprobe", &[module])?;
    }
    ensure(
        ctx.exec,
        &EnsureDirectory::new(RKE2_CONFIG_DIR).with_mode("0755"),
    )?;

    let rendered = render_rke2_config(ctx.config)?;
    let config = WriteFile::new(RKE2_CONFIG_PATH, rendered).with_permissions("0644");
    Ok(match ensure(ctx.exec, &config)? {
        TaskResult::Applied => StepOutcome::message(format!("wrote {RKE2_CONFIG_PATH}")),
        TaskResult::Satisfied => StepOutcome::message("RKE2 config unchanged"),
    })
}

pub(super) fn setup_rke2() -> Step {
    Step {
        id: "setup-rke2",
        name: "Setup RKE2",
        description: "Install RKE2 and start the server or agent service",
        phase: Phase::ClusterBootstrap,
        skip: None,
        action: run_setup_rke2,
    }
}

fn run_setup_rke2(ctx: &mut StepContext<'_>) -> StepResult {
    let config = ctx.config;
    let role = if config.first_node || config.control_plane {
        "server"
    } else {
        "agent"
    };

    let mut env = format!("INSTALL_RKE2_TYPE={role}");
    if let Some(version) = &config.rke2_version {
        env.push_str(&format!(" INSTALL_RKE2_VERSION=\"{version}\""));
    }
    let install = RunCommand::new(
        format!("install-rke2-{role}"),
        format!("Install RKE2 {role}"),
        format!("curl -sfL {} | {env} sh -", config.rke2_installation_url),
    )
    .unless("test -x /usr/local/bin/rke2");
    ensure(ctx.exec, &install)?;

    let service = format!("rke2-{role}");
    ensure(ctx.exec, &EnsureService::new(&service))?;
    Ok(StepOutcome::message(format!("{service} is running")))
}

pub(super) fn setup_longhorn() -> Step {
    Step {
        id: "setup-longhorn",
        name: "Setup Longhorn",
        description: "Drop the Longhorn chart into the RKE2 manifests directory",
        phase: Phase::PostCluster,
        skip: Some(skip_unless_first_node),
        action: |ctx| write_manifest(ctx, "longhorn.yaml", LONGHORN_MANIFEST),
    }
}

pub(super) fn setup_metallb() -> Step {
    Step {
        id: "setup-metallb",
        name: "Setup MetalLB",
        description: "Drop the MetalLB chart into the RKE2 manifests directory",
        phase: Phase::PostCluster,
        skip: Some(skip_unless_first_node),
        action: |ctx| write_manifest(ctx, "metallb.yaml", METALLB_MANIFEST),
    }
}

pub(super) fn create_metallb_config() -> Step {
    Step {
        id: "create-metallb-config",
        name: "Setup AddressPool for MetalLB",
        description: "Create the IPAddressPool and L2Advertisement for this node",
        phase: Phase::PostCluster,
        skip: Some(skip_unless_first_node),
        action: |ctx| {
            let ip = node_ip(ctx)?;
            let manifest = render_metallb_address(&ip)?;
            write_manifest(ctx, "metallb-address.yaml", &manifest)
        },
    }
}

pub(super) fn setup_kubeconfig() -> Step {
    Step {
        id: "setup-kubeconfig",
        name: "Setup KubeConfig",
        description: "Install an admin kubeconfig pointing at this node",
        phase: Phase::PostCluster,
        skip: Some(skip_unless_first_node),
        action: run_setup_kubeconfig,
    }
}

fn run_setup_kubeconfig(ctx: &mut StepContext<'_>) -> StepResult {
    let config = ctx.config;
    let target = &config.kubeconfig_path;
    let Some(rke2) = read_produced(
        ctx.exec,
        "SetupKubeconfig.Read",
        Path::new(RKE2_KUBECONFIG_PATH),
    )?
    else {
        return Ok(StepOutcome::message(format!(
            "would copy {RKE2_KUBECONFIG_PATH} to {} once RKE2 has started",
            target.display()
        )));
    };
    let ip = node_ip(ctx)?;
    let kubeconfig = rke2.replace("127.0.0.1", &ip);

    ensure(
        ctx.exec,
        &WriteFile::new(target, kubeconfig).with_permissions("0600"),
    )?;
    Ok(StepOutcome::message(format!(
        "kubeconfig for https://{ip}:6443 written to {}",
        target.display()
    )))
}

pub(super) fn final_output() -> Step {
    Step {
        id: "final-output",
        name: "Output",
        description: "Report how additional nodes join the cluster",
        phase: Phase::PostCluster,
        skip: None,
        action: run_final_output,
    }
}

fn run_final_output(ctx: &mut StepContext<'_>) -> StepResult {
    let config = ctx.config;
    if !config.first_node {
        let server = config.server_ip.as_deref().unwrap_or_default();
        return Ok(StepOutcome::message(format!(
            "node registered with https://{server}:{JOIN_PORT}; storage labels apply once it is Ready"
        )));
    }

    let path = &config.join_command_path;
    let Some(token) = read_produced(
        ctx.exec,
        "FinalOutput.ReadNodeToken",
        Path::new(NODE_TOKEN_PATH),
    )?
    else {
        return Ok(StepOutcome::message(format!(
            "would write the join command to {} once RKE2 has issued {NODE_TOKEN_PATH}",
            path.display()
        )));
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(ProvisionError::step(format!("{NODE_TOKEN_PATH} is empty")));
    }
    let ip = node_ip(ctx)?;

    ctx.exec
        .write_file("FinalOutput.WriteJoinCommand", path, &join_command(&ip, token))?;
    Ok(StepOutcome::message(format!(
        "to add nodes to this cluster, run the command in {}",
        path.display()
    )))
}
