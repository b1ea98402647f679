//! gcpgpu CLI entrypoint.
//!
//! This is the main entrypoint for the gcpgpu command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use gcp_gpu_deploy::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use gcp_gpu_deploy::config::{
    ConfigParser, ConfigValidator, DeployConfig, StateBackend, find_config_file,
};
use gcp_gpu_deploy::context::RunContext;
use gcp_gpu_deploy::error::{DeployError, Result};
use gcp_gpu_deploy::graph::GraphBuilder;
use gcp_gpu_deploy::planner::{ExecutionReport, ExecutorSettings};
use gcp_gpu_deploy::provider::SimulatedCloud;
use gcp_gpu_deploy::reconciler::Reconciler;
use gcp_gpu_deploy::state::{
    LocalStateStore, RunStatus, S3StateStore, STATE_DIR, StateStore,
};

use clap::Parser;
use tracing::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// File holding the simulated cloud between runs.
const SIMULATED_CLOUD_FILE: &str = "simulated-cloud.json";

/// Exit code for a run that applied some changes and failed others.
const EXIT_PARTIAL_FAILURE: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => {
            cmd_validate(config, warnings, &formatter).map(|()| ExitCode::SUCCESS)
        }
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, concurrency } => {
            cmd_apply(config, yes, concurrency, &formatter).await
        }
        Commands::Destroy { yes, concurrency } => {
            cmd_destroy(config, yes, concurrency, &formatter).await
        }
        Commands::State { command } => cmd_state(config, command, &formatter)
            .await
            .map(|()| ExitCode::SUCCESS),
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new gcpgpu project in: {}", path.display());

    let config_path = path.join("gcpgpu.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/gcpgpu.deploy.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# gcpgpu")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit gcpgpu.deploy.yaml with your resources");
    eprintln!("  2. Run 'gcpgpu validate' to check your configuration");
    eprintln!("  3. Run 'gcpgpu plan' to see what will change");
    eprintln!("  4. Run 'gcpgpu apply' to converge");

    Ok(())
}

/// Validate configuration and the dependency graph.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let result = ConfigValidator::new().validate(&config)?;

    let mut ctx = RunContext::new(&config.project.name, &config.project.environment);
    let graph = GraphBuilder::new().build(&mut ctx, config.resources())?;
    graph.check_outputs(&config.outputs)?;
    debug!("Dependency graph has {} resources", graph.len());

    emit(&formatter.format_validation(&result, show_warnings));
    if formatter.format() == OutputFormat::Text {
        eprintln!("\nConfiguration summary:");
        eprintln!("  Project: {}", config.project.name);
        eprintln!("  Environment: {}", config.project.environment);
        eprintln!("  Resources: {}", graph.len());
        eprintln!("  Outputs: {}", config.outputs.len());
    }
    Ok(())
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (reconciler, _cloud) = build_reconciler(config_path, None).await?;
    let mut ctx = reconciler.context();
    let plan = reconciler.plan(&mut ctx).await?;

    emit(&formatter.format_plan(&plan, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Apply the plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (reconciler, cloud) = build_reconciler(config_path, concurrency).await?;

    let plan = reconciler.plan(&mut reconciler.context()).await?;
    if plan.is_empty() {
        emit(&formatter.format_plan(&plan, false));
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve {
        emit(&formatter.format_plan(&plan, false));
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let mut ctx = reconciler.context();
    let report = with_interrupt(ctx.cancellation_token(), reconciler.apply(&mut ctx)).await;
    finish_run(report, &cloud, formatter).await
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (reconciler, cloud) = build_reconciler(config_path, concurrency).await?;

    let state = reconciler.load_state().await?;
    if state.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("The following resources will be destroyed:");
    for record in state.resources.values() {
        eprintln!("  - {} ({}, {})", record.name, record.kind, record.provider_id);
    }

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let mut ctx = reconciler.context();
    let report = with_interrupt(ctx.cancellation_token(), reconciler.destroy(&mut ctx)).await;
    finish_run(report, &cloud, formatter).await
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(&formatter.format_state(&state));
            } else {
                eprintln!("No state found at {}.", store.location());
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store
                .acquire_lock(holder.as_deref().unwrap_or(""), None)
                .await?;
            emit(&formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
#[allow(clippy::print_stdout)]
fn emit(output: &str) {
    println!("{output}");
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Runs `work`, cancelling the run on Ctrl-C.
async fn with_interrupt<F>(token: CancellationToken, work: F) -> F::Output
where
    F: std::future::Future,
{
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight actions");
            token.cancel();
        }
    });

    let output = work.await;
    watcher.abort();
    output
}

/// Persists the simulated cloud and reports the run.
async fn finish_run(
    report: Result<ExecutionReport>,
    cloud: &CloudHandle,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    cloud.save().await?;
    let report = report?;

    emit(&formatter.format_report(&report));
    Ok(match report.status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::Failure => ExitCode::FAILURE,
        RunStatus::PartialFailure => ExitCode::from(EXIT_PARTIAL_FAILURE),
    })
}

/// The simulated cloud and where it is persisted.
struct CloudHandle {
    cloud: SimulatedCloud,
    path: PathBuf,
}

impl CloudHandle {
    async fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(SIMULATED_CLOUD_FILE);
        let cloud = SimulatedCloud::load(&path).await?;
        Ok(Self { cloud, path })
    }

    async fn save(&self) -> Result<()> {
        self.cloud.save(&self.path).await
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads the configuration with `.env` and environment overrides.
fn load_config(config_path: Option<&Path>) -> Result<(DeployConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_file))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Local directory for state and the simulated cloud.
fn local_dir(config: &DeployConfig, config_file: &Path) -> PathBuf {
    config.state.path.as_ref().map_or_else(
        || config_dir(config_file).join(STATE_DIR),
        PathBuf::from,
    )
}

/// Creates the state store named by the configuration.
async fn create_state_store(config: &DeployConfig, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => Arc::new(LocalStateStore::with_base_dir(local_dir(config, config_file))),
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| DeployError::internal("S3 bucket not configured"))?;
            Arc::new(
                S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref())
                    .await?,
            )
        }
    };
    debug!("Using {} state at {}", store.backend_type(), store.location());
    Ok(store)
}

/// Builds a reconciler backed by the persisted simulated cloud.
async fn build_reconciler(
    config_path: Option<&Path>,
    concurrency: Option<usize>,
) -> Result<(Reconciler, CloudHandle)> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;
    let cloud = CloudHandle::load(&local_dir(&config, &config_file)).await?;

    let settings = ExecutorSettings {
        concurrency: concurrency.unwrap_or(config.execution.concurrency),
        retry: config.retry_policy(),
    };
    let reconciler = Reconciler::new(config, cloud.cloud.registry(), store).with_settings(settings);
    Ok((reconciler, cloud))
}
