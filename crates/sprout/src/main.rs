//! Sprout - Bare-Metal Kubernetes Node Provisioning
//!
//! Turns an Ubuntu host into an RKE2 node with Longhorn storage.
//! - `run`: execute the installation steps (live, dry run or mock)
//! - `steps`: list the steps and whether this configuration runs them
//! - `status` / `monitor`: read progress back from the run log

mod logging;
mod progress;
mod settings;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use console::{Emoji, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sprout_provision::{
    Catalogue, DiskSelector, DryRunExecutor, ExecMode, Executor, LiveExecutor, LogWatcher,
    MockExecutor, MockFixture, NodeConfig, Orchestrator, ProvisionError, RunReport, RunStatus,
    SelectAll, StepContext, StepStatus,
};

use logging::DEFAULT_LOG_FILE;
use progress::{InteractiveSelector, SpinnerProgress};

static SEEDLING: Emoji<'_, '_> = Emoji("🌱 ", "");
static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

#[derive(Parser, Debug)]
#[command(
    name = "sprout",
    version,
    about = "Provision bare-metal Kubernetes nodes with RKE2 and Longhorn"
)]
struct Args {
    /// Subcommand (defaults to run if not specified)
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (global)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run log, read back by `status` and `monitor`
    #[arg(long, global = true, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Console log level; the run log always records debug
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Override a configuration key (repeatable)
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = settings::parse_key_value)]
    overrides: Vec<(String, String)>,

    /// Show config file path and resolved settings, then exit
    #[arg(long)]
    show_config: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision this node (default)
    Run(RunArgs),

    /// List installation steps and whether they would run
    Steps,

    /// Summarize the most recent run from the run log
    Status,

    /// Follow a run in progress
    Monitor(MonitorArgs),
}

#[derive(Parser, Debug, Default)]
struct RunArgs {
    /// Log every change instead of making it
    #[arg(long, conflicts_with = "mock")]
    dry_run: bool,

    /// Answer every operation from a YAML fixture
    #[arg(long, value_name = "FIXTURE")]
    mock: Option<PathBuf>,

    /// Do not ask for confirmation; use every eligible disk
    #[arg(short, long)]
    yes: bool,

    /// Archive the existing run log before starting
    #[arg(long)]
    fresh: bool,
}

#[derive(Parser, Debug)]
struct MonitorArgs {
    /// Poll interval in milliseconds
    #[arg(long, default_value = "500")]
    interval: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.show_config {
        return show_config(&args);
    }

    match &args.command {
        Some(Commands::Run(run)) => run_install(&args, run),
        Some(Commands::Steps) => run_steps(&args),
        Some(Commands::Status) => run_status(&args),
        Some(Commands::Monitor(monitor)) => run_monitor(&args, monitor),
        None => run_install(&args, &RunArgs::default()),
    }
}

fn show_config(args: &Args) -> Result<()> {
    let path = args.config.clone().unwrap_or_else(settings::config_path);
    println!("{} Config: {}", FOLDER, path.display());
    if path.exists() {
        println!("  {CHECK} exists");
    } else {
        println!("  {} not found (will use defaults)", style("!").yellow());
    }

    let map = settings::load(args.config.as_deref(), &args.overrides)?;
    if !map.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_header(vec![
            Cell::new("Key").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
        for (key, value) in &map {
            let shown = if key == "JOIN_TOKEN" {
                mask(value)
            } else {
                value.clone()
            };
            table.add_row(vec![Cell::new(key), Cell::new(shown)]);
        }
        println!("\n{table}");
    }
    Ok(())
}

/// Load, convert and validate configuration, printing every problem found
fn load_node_config(args: &Args) -> Result<(NodeConfig, Orchestrator)> {
    let map = settings::load(args.config.as_deref(), &args.overrides)?;
    let planned = NodeConfig::from_map(&map).and_then(|config| {
        let catalogue = Catalogue::standard()?;
        let orchestrator = Orchestrator::plan(catalogue, &config)?;
        Ok((config, orchestrator))
    });

    match planned {
        Ok(planned) => Ok(planned),
        Err(ProvisionError::Config(errors)) => {
            println!("\n{} Configuration problems\n", style("▸").red().bold());
            for error in &errors {
                println!("  {} {error}", style("x").red());
            }
            println!();
            bail!("{} configuration problem(s), nothing was run", errors.len())
        }
        Err(e) => Err(e).context("Failed to plan installation"),
    }
}

/// Run the installation
fn run_install(args: &Args, run: &RunArgs) -> Result<()> {
    if run.fresh
        && let Some(archive) = logging::archive_log(&args.log_file)?
    {
        println!(
            "{} Previous run log archived to {}",
            style("i").cyan(),
            archive.display()
        );
    }
    logging::init_logging(&args.log_level, Some(&args.log_file))?;

    let (config, orchestrator) = load_node_config(args)?;

    let exec: Box<dyn Executor> = match (&run.mock, run.dry_run) {
        (Some(fixture), _) => Box::new(MockExecutor::new(
            MockFixture::from_file(fixture).context("Failed to load mock fixture")?,
        )),
        (None, true) => Box::new(DryRunExecutor::new()),
        (None, false) => Box::new(LiveExecutor::new()),
    };
    let mode = exec.mode();
    tracing::info!(%mode, version = env!("CARGO_PKG_VERSION"), "starting provisioning run");

    print_banner();
    print_config_table(&config, mode, &args.log_file);

    if mode == ExecMode::Live && !run.yes {
        let confirm = dialoguer::Confirm::new()
            .with_prompt("Provision this node?")
            .default(false)
            .interact()?;
        if !confirm {
            println!("Aborted.");
            return Ok(());
        }
    }

    let multi = MultiProgress::new();
    let interactive = InteractiveSelector::new(multi.clone());
    let selector: &dyn DiskSelector = if run.yes || mode == ExecMode::Mock {
        &SelectAll
    } else {
        &interactive
    };

    println!("\n{}", style("─".repeat(50)).dim());
    let mut ctx = StepContext::new(&config, exec.as_ref(), selector);
    let mut progress = SpinnerProgress::new(multi);
    let report = orchestrator.run(&mut ctx, &mut progress);
    println!("{}", style("─".repeat(50)).dim());

    print_report_table(&report);

    if let Some(failure) = &report.failure {
        println!(
            "\n{CROSS} {} failed, see {} for details",
            style(failure.id).red().bold(),
            args.log_file.display()
        );
        bail!("{failure}");
    }

    print_success(&config, mode);
    Ok(())
}

/// List steps with the decision this configuration leads to
fn run_steps(args: &Args) -> Result<()> {
    logging::init_logging(&args.log_level, None)?;
    let (config, orchestrator) = load_node_config(args)?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("#").fg(Color::Cyan),
        Cell::new("Step").fg(Color::Cyan),
        Cell::new("Phase").fg(Color::Cyan),
        Cell::new("Description").fg(Color::Cyan),
        Cell::new("Plan").fg(Color::Cyan),
    ]);
    for (i, step) in orchestrator.catalogue().steps().iter().enumerate() {
        let plan = match orchestrator.skip_reason(step, &config) {
            Some(reason) => Cell::new(format!("skip: {reason}")).fg(Color::Yellow),
            None => Cell::new("run").fg(Color::Green),
        };
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(step.id),
            Cell::new(step.phase),
            Cell::new(step.description),
            plan,
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Summarize the last run recorded in the run log
fn run_status(args: &Args) -> Result<()> {
    let status = RunStatus::from_path(&args.log_file)
        .with_context(|| format!("Failed to read run log: {}", args.log_file.display()))?;

    if status.is_empty() {
        println!(
            "{} No run recorded in {}",
            style("i").cyan(),
            args.log_file.display()
        );
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("Step").fg(Color::Cyan),
        Cell::new("Phase").fg(Color::Cyan),
        Cell::new("Status").fg(Color::Cyan),
        Cell::new("Time").fg(Color::Cyan),
        Cell::new("Detail").fg(Color::Cyan),
    ]);
    for step in &status.steps {
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(step.phase.map(|p| p.to_string()).unwrap_or_default()),
            status_cell(step.status),
            Cell::new(
                step.elapsed()
                    .map(|d| format!("{}s", d.num_seconds()))
                    .unwrap_or_default(),
            ),
            Cell::new(truncate(&step.detail, 60)),
        ]);
    }
    println!("{table}");

    match (&status.summary, status.current()) {
        (Some(summary), _) => println!("\n{SPARKLE} Finished: {summary}"),
        (None, Some(current)) => println!(
            "\n{} Running: {}",
            style("▸").cyan(),
            style(&current.id).bold()
        ),
        (None, None) => println!("\n{} Run did not finish", style("!").yellow()),
    }
    Ok(())
}

/// Follow the run log until the run completes
fn run_monitor(args: &Args, monitor: &MonitorArgs) -> Result<()> {
    let interval = Duration::from_millis(monitor.interval.max(50));
    let status = Arc::new(RwLock::new(RunStatus::new()));
    let watcher = LogWatcher::spawn(&args.log_file, Arc::clone(&status), interval / 2)?;

    println!(
        "{} Watching {}\n",
        style("▸").cyan(),
        style(args.log_file.display()).cyan()
    );

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut printed: Vec<String> = Vec::new();
    let snapshot = loop {
        let snapshot = status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // A new run started in the same log
        if printed
            .iter()
            .any(|id| snapshot.step(id).is_none_or(|s| !is_finished(s.status)))
        {
            printed.clear();
        }

        for step in snapshot.steps.iter().filter(|s| is_finished(s.status)) {
            if !printed.contains(&step.id) {
                bar.println(format!("{} {}", status_marker(step.status), step.id));
                printed.push(step.id.clone());
            }
        }

        bar.set_length(snapshot.steps.len() as u64);
        bar.set_position(printed.len() as u64);
        bar.set_message(
            snapshot
                .current()
                .map(|s| s.id.clone())
                .unwrap_or_else(|| "waiting for the next step".into()),
        );

        if snapshot.finished {
            break snapshot;
        }
        thread::sleep(interval);
    };

    bar.finish_and_clear();
    watcher.stop();

    let failed = snapshot.count(StepStatus::Failed);
    if failed == 0 {
        println!(
            "\n{CHECK} {}",
            snapshot.summary.as_deref().unwrap_or("run complete")
        );
        Ok(())
    } else {
        bail!("{failed} step(s) failed, see {}", args.log_file.display())
    }
}

fn is_finished(status: StepStatus) -> bool {
    matches!(
        status,
        StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed | StepStatus::NotRun
    )
}

fn status_marker(status: StepStatus) -> String {
    match status {
        StepStatus::Completed => style("v").green().to_string(),
        StepStatus::Skipped => style("o").yellow().to_string(),
        StepStatus::Failed => style("x").red().to_string(),
        StepStatus::NotRun => style("-").dim().to_string(),
        StepStatus::Pending | StepStatus::Running => style("·").dim().to_string(),
    }
}

fn status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Skipped => Color::Yellow,
        StepStatus::Failed => Color::Red,
        StepStatus::Running => Color::Cyan,
        StepStatus::Pending | StepStatus::NotRun => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn mask(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        "********".into()
    } else {
        format!("{}********", secret.chars().take(4).collect::<String>())
    }
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("╔═══════════════════════════════════════╗")
            .cyan()
            .bold()
    );
    println!(
        "{}",
        style("║        SPROUT NODE PROVISIONING       ║")
            .cyan()
            .bold()
    );
    println!(
        "{}",
        style("╚═══════════════════════════════════════╝")
            .cyan()
            .bold()
    );
}

fn print_config_table(config: &NodeConfig, mode: ExecMode, log_file: &Path) {
    println!("\n{} Configuration\n", style("▸").blue().bold());

    let role = match (config.first_node, config.control_plane) {
        (true, _) => "first server".to_string(),
        (false, true) => "additional server".to_string(),
        (false, false) => "agent".to_string(),
    };
    let disks = if config.no_disks_for_cluster {
        "none".to_string()
    } else if !config.cluster_premounted_disks.is_empty() {
        config
            .cluster_premounted_disks
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    } else if !config.cluster_disks.is_empty() {
        config.cluster_disks.join(", ")
    } else {
        "discover".to_string()
    };

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("Setting").fg(Color::Cyan),
        Cell::new("Value").fg(Color::Cyan),
    ]);
    table.add_row(vec![Cell::new("Mode"), Cell::new(mode)]);
    table.add_row(vec![Cell::new("Role"), Cell::new(role)]);
    if let Some(server) = &config.server_ip {
        table.add_row(vec![Cell::new("Server"), Cell::new(server)]);
    }
    table.add_row(vec![Cell::new("GPU node"), Cell::new(config.gpu_node)]);
    table.add_row(vec![Cell::new("Disks"), Cell::new(disks)]);
    table.add_row(vec![
        Cell::new("Domain"),
        Cell::new(config.domain.as_deref().unwrap_or("-")),
    ]);
    table.add_row(vec![
        Cell::new("RKE2 version"),
        Cell::new(config.rke2_version.as_deref().unwrap_or("latest")),
    ]);
    table.add_row(vec![Cell::new("Run log"), Cell::new(log_file.display())]);

    println!("{table}");

    match mode {
        ExecMode::DryRun => println!(
            "\n{} Dry run - changes are logged, not made",
            style("i").cyan()
        ),
        ExecMode::Mock => println!(
            "\n{} Mock run - every operation is answered by the fixture",
            style("i").cyan()
        ),
        ExecMode::Live => {}
    }
}

fn print_report_table(report: &RunReport) {
    println!(
        "\n{} {} completed, {} skipped, {} failed, {} not run in {:.1}s",
        style("▸").blue().bold(),
        report.count(StepStatus::Completed),
        report.count(StepStatus::Skipped),
        report.count(StepStatus::Failed),
        report.count(StepStatus::NotRun),
        report.elapsed().as_secs_f64()
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("Step").fg(Color::Cyan),
        Cell::new("Phase").fg(Color::Cyan),
        Cell::new("Status").fg(Color::Cyan),
        Cell::new("Time").fg(Color::Cyan),
        Cell::new("Detail").fg(Color::Cyan),
    ]);
    for record in report
        .records
        .iter()
        .filter(|r| r.status != StepStatus::Skipped)
    {
        table.add_row(vec![
            Cell::new(record.id),
            Cell::new(record.phase),
            status_cell(record.status),
            Cell::new(
                record
                    .elapsed
                    .map(|d| format!("{:.1}s", d.as_secs_f64()))
                    .unwrap_or_default(),
            ),
            Cell::new(truncate(record.detail.as_deref().unwrap_or_default(), 60)),
        ]);
    }
    println!("{table}");
}

fn print_success(config: &NodeConfig, mode: ExecMode) {
    println!();
    println!(
        "{}",
        style("╔═══════════════════════════════════════╗")
            .green()
            .bold()
    );
    println!(
        "{}",
        style("║              NODE READY!              ║")
            .green()
            .bold()
    );
    println!(
        "{}",
        style("╚═══════════════════════════════════════╝")
            .green()
            .bold()
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    if config.first_node {
        table.add_row(vec![
            Cell::new("Kubeconfig").fg(Color::Cyan),
            Cell::new(config.kubeconfig_path.display()),
        ]);
        table.add_row(vec![
            Cell::new("Join command").fg(Color::Cyan),
            Cell::new(config.join_command_path.display()),
        ]);
        if let Some(domain) = &config.domain {
            table.add_row(vec![
                Cell::new("API server").fg(Color::Cyan),
                Cell::new(format!("https://{domain}:6443")),
            ]);
        }
    } else {
        table.add_row(vec![
            Cell::new("Joined").fg(Color::Cyan),
            Cell::new(config.server_ip.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
    println!();

    match mode {
        ExecMode::Live => println!("{SEEDLING}Node provisioned!"),
        ExecMode::DryRun | ExecMode::Mock => println!("{SPARKLE}Rehearsal complete ({mode})"),
    }
}
