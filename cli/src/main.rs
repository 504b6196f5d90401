//! testorch command line.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use testorch::category::ExecutionPlan;
use testorch::metrics::format_run_metrics;
use testorch::orchestrator::CategoryStatus;
use testorch::splitter::split_statistics;
use testorch::{
    ExecutionMode, FailFastMode, Orchestrator, OrchestratorConfig, RunReport, RunRequest,
    SplittingStrategy, TestSplitter,
};

/// Config files picked up from the project root when `--config` is absent.
const DEFAULT_CONFIG_FILES: &[&str] = &["testorch.yaml", "testorch.yml", "testorch.toml"];

#[derive(Parser, Debug)]
#[command(name = "testorch", version, about = "Plan, split and run layered test categories")]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Environment block to apply from the configuration file
    #[arg(short, long, global = true)]
    env: Option<String>,

    /// Project root; history and commands are resolved against it
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the phased execution plan
    Plan(PlanArgs),
    /// Discover tests and split them into execution windows
    Split(SplitArgs),
    /// Execute categories phase by phase
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct SelectionArgs {
    /// Categories to run; defaults to the execution mode's categories
    categories: Vec<String>,

    /// Execution mode (fast_feedback, hybrid, nightly, background)
    #[arg(short, long)]
    mode: Option<String>,

    /// Maximum categories running at once
    #[arg(short = 'p', long)]
    max_parallel: Option<usize>,

    /// Do not pull in dependencies of the selected categories
    #[arg(long)]
    skip_dependencies: bool,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// Directories to search, relative to the root
    paths: Vec<PathBuf>,

    /// Splitting strategy
    #[arg(short, long)]
    strategy: Option<String>,

    /// Target window duration in minutes
    #[arg(short, long)]
    target_minutes: Option<f64>,

    /// Upper bound on the number of windows
    #[arg(long)]
    max_windows: Option<usize>,

    /// Only keep tests in these categories
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Print windows as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Fail-fast mode
    #[arg(short, long)]
    fail_fast: Option<String>,

    /// Discover tests under these paths and split them into windows
    #[arg(long = "discover")]
    discover: Vec<PathBuf>,

    /// Write the failure report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Returns whether the command succeeded.
async fn execute(cli: Cli) -> Result<bool> {
    let mut config = load_config(&cli)?;
    match cli.command {
        Command::Plan(args) => {
            apply_selection(&mut config, &args.selection)?;
            let orchestrator = Orchestrator::from_config(&config, &cli.root)?;
            let plan = orchestrator.plan(&request_for(&args.selection)?)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
            Ok(true)
        }
        Command::Split(args) => split(&config, &cli.root, args),
        Command::Run(args) => {
            apply_selection(&mut config, &args.selection)?;
            if let Some(mode) = &args.fail_fast {
                config.fail_fast.mode = mode.parse::<FailFastMode>()?;
            }
            let mut orchestrator = Orchestrator::from_config(&config, &cli.root)?;

            let mut request = request_for(&args.selection)?;
            if !args.discover.is_empty() {
                let tests = orchestrator.splitter().discover_tests(&args.discover, None);
                request = request.with_tests(tests);
            }

            let report = orchestrator.run(request).await?;
            if let Some(path) = &args.report {
                orchestrator
                    .fail_fast()
                    .export_failure_report(path)
                    .with_context(|| format!("writing failure report to {}", path.display()))?;
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(report.success)
        }
    }
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let path = cli.config.clone().or_else(|| find_default_config(&cli.root));
    let config = OrchestratorConfig::load(path.as_deref(), cli.env.as_deref())
        .with_context(|| match &path {
            Some(path) => format!("loading configuration from {}", path.display()),
            None => "loading configuration".to_string(),
        })?;
    tracing::debug!(path = ?path, environment = ?cli.env, "loaded configuration");
    Ok(config)
}

fn find_default_config(root: &Path) -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

fn apply_selection(config: &mut OrchestratorConfig, selection: &SelectionArgs) -> Result<()> {
    if let Some(max_parallel) = selection.max_parallel {
        anyhow::ensure!(max_parallel > 0, "--max-parallel must be at least 1");
        config.execution.max_parallel = max_parallel;
    }
    if selection.skip_dependencies {
        config.execution.skip_dependencies = true;
    }
    Ok(())
}

fn request_for(selection: &SelectionArgs) -> Result<RunRequest> {
    let mut request = RunRequest::for_categories(selection.categories.iter().cloned());
    if let Some(mode) = &selection.mode {
        request.mode = Some(mode.parse::<ExecutionMode>()?);
    }
    Ok(request)
}

fn split(config: &OrchestratorConfig, root: &Path, args: SplitArgs) -> Result<bool> {
    let strategy = match &args.strategy {
        Some(strategy) => strategy.parse::<SplittingStrategy>()?,
        None => config.splitting.strategy,
    };
    let target_seconds = args
        .target_minutes
        .map(|minutes| minutes * 60.0)
        .unwrap_or_else(|| config.splitting.target_window_seconds());
    anyhow::ensure!(target_seconds > 0.0, "--target-minutes must be positive");

    let splitter = TestSplitter::with_history_file(root, root.join(&config.history.test_history_path));
    let wanted = (!args.categories.is_empty()).then_some(args.categories.as_slice());
    let tests = splitter.discover_tests(&args.paths, wanted);

    let mut windows = splitter.create_windows(
        tests,
        strategy,
        target_seconds,
        args.max_windows.or(config.splitting.max_windows),
        config.execution.max_parallel,
    );
    if config.splitting.rebalance {
        windows = splitter.rebalance_windows(windows);
    }
    let stats = split_statistics(&windows);

    if args.json {
        let output = serde_json::json!({
            "strategy": strategy,
            "statistics": stats,
            "windows": windows,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(true);
    }

    println!(
        "{} {} tests into {} windows ({})",
        "Split".bold(),
        stats.test_count,
        stats.window_count,
        strategy
    );
    for window in &windows {
        let flags = match (window.sequential, window.isolated) {
            (true, true) => " sequential, isolated",
            (true, false) => " sequential",
            (false, true) => " isolated",
            (false, false) => "",
        };
        println!(
            "  window {:>3} [{:?}{}] {:>3} tests  {:>8.1}s / {:.1}s",
            window.id,
            window.priority,
            flags,
            window.len(),
            window.estimated_duration,
            window.max_duration
        );
    }
    println!(
        "  mean {:.1}s, cv {:.2}, balance {:.2}",
        stats.mean_duration, stats.coefficient_of_variation, stats.mean_balancing_score
    );
    Ok(true)
}

fn print_plan(plan: &ExecutionPlan) {
    println!(
        "{} {} categories in {} phases (~{:.0}s)",
        "Plan".bold(),
        plan.category_count(),
        plan.phases.len(),
        plan.total_estimated_duration
    );
    for (index, phase) in plan.phases.iter().enumerate() {
        let names: Vec<String> = phase
            .iter()
            .map(|name| {
                if plan.is_requested(name) {
                    name.clone()
                } else {
                    format!("{} {}", name, "(dependency)".dimmed())
                }
            })
            .collect();
        let duration = plan.phase_durations.get(index).copied().unwrap_or_default();
        println!("  phase {}: {}  ~{:.0}s", index + 1, names.join(", "), duration);
    }
    if !plan.ignored_categories.is_empty() {
        println!(
            "  {} {}",
            "ignored unknown:".yellow(),
            plan.ignored_categories.join(", ")
        );
    }
}

fn print_report(report: &RunReport) {
    for result in &report.results {
        let status = match result.status {
            CategoryStatus::Passed => "PASS".green().bold(),
            CategoryStatus::Failed => "FAIL".red().bold(),
            CategoryStatus::TimedOut => "TIME".red().bold(),
            CategoryStatus::Skipped => "SKIP".yellow().bold(),
        };
        println!(
            "{} {:<14} phase {}  {:.1}s",
            status,
            result.category,
            result.phase + 1,
            result.duration
        );
        if result.failed() {
            if let Some(message) = result.message.as_deref().and_then(|m| m.lines().last()) {
                println!("     {}", message.dimmed());
            }
        }
    }

    if let Some(decision) = &report.stop_decision {
        println!(
            "\n{} {} ({})",
            "Stopped early:".red().bold(),
            decision.reasoning,
            decision.reason
        );
    }

    println!("\n{}", format_run_metrics(&report.metrics));
    let verdict = if report.success {
        "Run passed".green().bold()
    } else {
        "Run failed".red().bold()
    };
    println!("{verdict}");
}
