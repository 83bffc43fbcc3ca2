//! ChainRunner CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Execute a chain against a capability catalog
//! chainrunner run chain.yaml --catalog capabilities.yaml
//!
//! # Dry run mode (echo resolved parameters, invoke nothing)
//! chainrunner run chain.yaml --dry-run
//!
//! # Check a chain without running it
//! chainrunner validate chain.yaml --catalog capabilities.yaml
//!
//! # Static cost and structure report
//! chainrunner analyze chain.yaml --json
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{info, warn};

use chainrunner::analysis::{analyze_chain, ChainAnalysis};
use chainrunner::capability::{
    CapabilityCatalog, CapabilityInvoker, DryRunInvoker, OpenCatalog, ProcessInvoker,
    StaticCatalog,
};
use chainrunner::config::{load_config, OrchestratorConfig};
use chainrunner::execution::{Engine, ResolutionMode};
use chainrunner::monitoring::ExecutionTimeline;
use chainrunner::registry::WorkflowRegistry;
use chainrunner::workflow::state::save_execution;
use chainrunner::workflow::{
    infer_mapping_dependencies, load_graph, validate_graph, StepGraph, StepStatus,
    WorkflowExecution, WorkflowStatus,
};
use chainrunner::{APP_NAME, VERSION};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "chainrunner")]
#[command(about = "Declarative step orchestration for capability chains")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Orchestrator configuration file
    #[arg(long, global = true, env = "CHAINRUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Capability catalog file (overrides the one in the config)
    #[arg(long, global = true, env = "CHAINRUNNER_CATALOG")]
    catalog: Option<PathBuf>,

    /// Add output-mapping sources to each step's dependencies before use
    #[arg(long, global = true)]
    infer_deps: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, schedule and execute a chain
    Run {
        /// Chain file (YAML or JSON)
        graph: PathBuf,

        /// Stop after the first failed step
        #[arg(long)]
        fail_fast: bool,

        /// Echo resolved parameters instead of invoking capabilities
        #[arg(long)]
        dry_run: bool,

        /// Maximum steps running at once
        #[arg(long, value_name = "N")]
        parallel: Option<usize>,

        /// Per-invocation timeout in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Treat unresolvable references as errors
        #[arg(long)]
        strict: bool,

        /// Directory capability commands run in
        #[arg(long)]
        working_dir: Option<PathBuf>,

        /// Write the final execution record as JSON
        #[arg(long, value_name = "PATH")]
        save_state: Option<PathBuf>,
    },

    /// Check a chain for structural and reference problems
    Validate {
        graph: PathBuf,

        /// Treat unresolvable references as errors
        #[arg(long)]
        strict: bool,
    },

    /// Estimate cost, complexity and parallelism of a chain
    Analyze {
        graph: PathBuf,

        /// Print the analysis as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Declarative Step Orchestration");
    println!();
}

fn load_settings(cli: &Cli) -> CliResult<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(catalog) = &cli.catalog {
        config.catalog = Some(catalog.clone());
    }
    Ok(config)
}

fn load_catalog(config: &OrchestratorConfig) -> CliResult<Option<Arc<StaticCatalog>>> {
    let Some(path) = &config.catalog else {
        return Ok(None);
    };
    let catalog = StaticCatalog::load(path)?;
    info!("Catalog: {} capabilities", catalog.len());
    Ok(Some(Arc::new(catalog)))
}

fn load_chain(path: &Path, infer_deps: bool) -> CliResult<StepGraph> {
    let mut graph = load_graph(path)?;
    if infer_deps {
        infer_mapping_dependencies(&mut graph);
    }
    Ok(graph)
}

/// Catalog used for existence checks; without one, capability checks are
/// switched off rather than failing every step.
fn checking_catalog(
    catalog: Option<Arc<StaticCatalog>>,
    config: &mut OrchestratorConfig,
) -> Arc<dyn CapabilityCatalog> {
    match catalog {
        Some(catalog) => catalog as Arc<dyn CapabilityCatalog>,
        None => {
            if config.validation.check_capabilities {
                warn!("No capability catalog configured, skipping capability checks");
            }
            config.validation.check_capabilities = false;
            Arc::new(OpenCatalog)
        }
    }
}

fn status_label(status: WorkflowStatus) -> colored::ColoredString {
    match status {
        WorkflowStatus::Completed => status.to_string().green().bold(),
        WorkflowStatus::Failed => status.to_string().red().bold(),
        WorkflowStatus::Cancelled => status.to_string().yellow().bold(),
        WorkflowStatus::Running => status.to_string().cyan(),
    }
}

fn print_execution(execution: &WorkflowExecution) {
    println!();
    for outcome in &execution.steps {
        let marker = match outcome.status {
            StepStatus::Completed => "✓".green(),
            StepStatus::Failed => "✗".red(),
            StepStatus::Skipped => "-".dimmed(),
            StepStatus::Pending | StepStatus::Running => "?".yellow(),
        };
        let retries = if outcome.retry_count > 0 {
            format!(" ({} retries)", outcome.retry_count)
        } else {
            String::new()
        };
        match &outcome.error {
            Some(err) => println!("  {} {}{}: {}", marker, outcome.step_id, retries, err),
            None => println!("  {} {}{}", marker, outcome.step_id, retries),
        }
    }

    print!("{}", ExecutionTimeline::from_execution(execution).gantt_chart());
    println!();
    println!(
        "Workflow {}: {}",
        execution.workflow_id,
        status_label(execution.status)
    );
    if let Some(err) = &execution.error {
        println!("  {}", err.red());
    }
}

async fn run_chain(
    cli: &Cli,
    graph_path: &Path,
    options: RunOptions,
) -> CliResult<WorkflowExecution> {
    let mut config = load_settings(cli)?;
    if options.strict {
        config.set_resolution_mode(ResolutionMode::Strict);
    }
    if options.fail_fast {
        config.engine.fail_fast = true;
    }
    if options.parallel.is_some() {
        config.engine.max_parallel = options.parallel;
    }
    if let Some(ms) = options.timeout_ms {
        config.engine.step_timeout = Some(Duration::from_millis(ms));
    }

    let catalog = load_catalog(&config)?;
    let invoker: Arc<dyn CapabilityInvoker> = if options.dry_run {
        info!("Mode: DRY RUN (capabilities will not be invoked)");
        Arc::new(DryRunInvoker)
    } else {
        let Some(catalog) = &catalog else {
            return Err("a capability catalog is required to run (use --catalog or --dry-run)".into());
        };
        let mut invoker = ProcessInvoker::new(Arc::clone(catalog));
        if let Some(dir) = &options.working_dir {
            if !dir.is_dir() {
                return Err(format!("Working directory does not exist: {}", dir.display()).into());
            }
            invoker.set_working_dir(dir);
        }
        Arc::new(invoker)
    };

    let graph = load_chain(graph_path, cli.infer_deps)?;
    let catalog = checking_catalog(catalog, &mut config);

    let engine = Engine::with_config(invoker, config.engine.clone());
    let mut registry = WorkflowRegistry::new(engine, catalog);
    registry.set_validation(config.validation.clone());

    let workflow_id = registry.submit(graph)?;
    let wait = registry.wait(&workflow_id);
    tokio::pin!(wait);
    let execution = tokio::select! {
        result = &mut wait => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling after the current batch");
            registry.cancel(&workflow_id);
            wait.await?
        }
    };

    if let Some(path) = &options.save_state {
        save_execution(&execution, path)?;
    }
    Ok(execution)
}

struct RunOptions {
    fail_fast: bool,
    dry_run: bool,
    parallel: Option<usize>,
    timeout_ms: Option<u64>,
    strict: bool,
    working_dir: Option<PathBuf>,
    save_state: Option<PathBuf>,
}

fn validate_chain(cli: &Cli, graph_path: &Path, strict: bool) -> CliResult<bool> {
    let mut config = load_settings(cli)?;
    if strict {
        config.set_resolution_mode(ResolutionMode::Strict);
    }
    let catalog = load_catalog(&config)?;
    let graph = load_chain(graph_path, cli.infer_deps)?;
    let catalog = checking_catalog(catalog, &mut config);

    let report = validate_graph(&graph, catalog.as_ref(), &config.validation);

    println!();
    for err in &report.errors {
        println!("  {} {}", "error:".red().bold(), err);
    }
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow().bold(), warning);
    }
    if report.valid {
        println!("{} ({} steps)", "Chain is valid".green().bold(), graph.len());
    } else {
        println!(
            "{} ({} errors)",
            "Chain is invalid".red().bold(),
            report.errors.len()
        );
    }
    Ok(report.valid)
}

fn print_analysis(analysis: &ChainAnalysis) {
    let metrics = &analysis.metrics;
    let distribution = &analysis.complexity.distribution;

    println!();
    println!("{}", "Chain Analysis".bold());
    println!("  Steps:                     {}", analysis.step_count);
    println!(
        "  Estimated duration:        {} ms",
        metrics.total_estimated_duration_ms
    );
    println!(
        "  Average complexity:        {:.2} (low {}, medium {}, high {})",
        metrics.average_complexity, distribution.low, distribution.medium, distribution.high
    );
    println!(
        "  Parallelization potential: {:.2}",
        metrics.parallelization_potential
    );
    if !metrics.bottlenecks.is_empty() {
        println!("  Bottlenecks:               {}", metrics.bottlenecks.join(", "));
    }

    let structure = &analysis.structure;
    for edge in &structure.circular_dependencies {
        println!(
            "  {} circular dependency {} -> {}",
            "error:".red().bold(),
            edge.step,
            edge.dependency
        );
    }
    for edge in &structure.unresolved_dependencies {
        println!(
            "  {} {} depends on unknown step {}",
            "error:".red().bold(),
            edge.step,
            edge.dependency
        );
    }
    for missing in &structure.missing_capabilities {
        println!(
            "  {} {} uses unknown capability {}",
            "error:".red().bold(),
            missing.step,
            missing.capability
        );
    }
    for risk in &analysis.complexity.risk_factors {
        println!("  {} {}", "risk:".yellow().bold(), risk);
    }
    for suggestion in &analysis.suggestions {
        println!("  {} {}", "hint:".cyan(), suggestion);
    }

    println!();
    if analysis.is_executable() {
        println!("{}", "Chain is executable".green().bold());
    } else {
        println!("{}", "Chain is not executable".red().bold());
    }
}

fn analyze(cli: &Cli, graph_path: &Path, json: bool) -> CliResult<bool> {
    let config = load_settings(cli)?;
    let catalog = load_catalog(&config)?;
    let graph = load_chain(graph_path, cli.infer_deps)?;

    let analysis = analyze_chain(
        &graph,
        catalog
            .as_deref()
            .map(|catalog| catalog as &dyn CapabilityCatalog),
        &config.analysis,
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        print_analysis(&analysis);
    }
    Ok(analysis.is_executable())
}

async fn run(cli: Cli) -> CliResult<bool> {
    match &cli.command {
        Commands::Run {
            graph,
            fail_fast,
            dry_run,
            parallel,
            timeout_ms,
            strict,
            working_dir,
            save_state,
        } => {
            print_banner();
            let options = RunOptions {
                fail_fast: *fail_fast,
                dry_run: *dry_run,
                parallel: *parallel,
                timeout_ms: *timeout_ms,
                strict: *strict,
                working_dir: working_dir.clone(),
                save_state: save_state.clone(),
            };
            let execution = run_chain(&cli, graph, options).await?;
            print_execution(&execution);
            Ok(execution.status == WorkflowStatus::Completed)
        }
        Commands::Validate { graph, strict } => validate_chain(&cli, graph, *strict),
        Commands::Analyze { graph, json } => analyze(&cli, graph, *json),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
