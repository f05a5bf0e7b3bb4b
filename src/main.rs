//! ScanRunner Server Entry Point
//!
//! Loads settings, recovers persisted state and serves the HTTP API until
//! interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Serve with defaults (in-memory records, 127.0.0.1:8080)
//! scanrunner
//!
//! # Settings file plus overrides
//! scanrunner --config scanrunner.yaml --bind 0.0.0.0:9000
//!
//! # Persist records and artifacts
//! scanrunner --data-dir /var/lib/scanrunner --max-tasks 8
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use scanrunner::api::{self, AppState};
use scanrunner::artifact::FsArtifactStore;
use scanrunner::catalog::Catalog;
use scanrunner::config::Settings;
use scanrunner::execution::WorkflowEngine;
use scanrunner::monitoring::Watchdog;
use scanrunner::store::RecordStore;
use scanrunner::task::TaskManager;
use scanrunner::{APP_NAME, VERSION};

/// Command-line options; each one overrides the settings file.
#[derive(Debug, Default)]
struct Config {
    config_path: Option<PathBuf>,
    bind: Option<String>,
    data_dir: Option<PathBuf>,
    max_tasks: Option<usize>,
    verbose: bool,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} {}", APP_NAME.bold().cyan(), format!("v{}", VERSION).dimmed());
    println!("IPv6 scan task and workflow orchestrator");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: scanrunner [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config PATH       Settings file (YAML)");
    println!("  --bind ADDR         Address the HTTP API listens on");
    println!("  --data-dir PATH     Persist records and artifacts under PATH");
    println!("  --max-tasks N       Maximum concurrently running scan tasks");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  scanrunner --config scanrunner.yaml");
    println!("  scanrunner --data-dir /var/lib/scanrunner --bind 0.0.0.0:8080");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    // Returns the value following a flag
    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" | "-c" => {
                i += 1;
                config.config_path = Some(PathBuf::from(value(i, arg)?));
            }
            "--bind" => {
                i += 1;
                config.bind = Some(value(i, arg)?);
            }
            "--data-dir" => {
                i += 1;
                config.data_dir = Some(PathBuf::from(value(i, arg)?));
            }
            "--max-tasks" => {
                i += 1;
                let raw = value(i, arg)?;
                let max = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| format!("Invalid max-tasks value: {}", raw))?;
                config.max_tasks = Some(max);
            }
            other => {
                return Err(format!("Unknown option: {}", other));
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Reads the settings file, if any, and applies command-line overrides.
fn load_settings(config: &Config) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = match &config.config_path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    if let Some(bind) = &config.bind {
        settings.bind = bind.clone();
    }
    if let Some(dir) = &config.data_dir {
        settings.data_dir = Some(dir.clone());
    }
    if let Some(max) = config.max_tasks {
        settings.max_running_tasks = max;
    }
    settings.validate()?;
    Ok(settings)
}

/// Builds the Task Manager and Workflow Engine and recovers their state.
fn build_engine(settings: &Settings) -> Result<WorkflowEngine, Box<dyn std::error::Error>> {
    let mut catalog = Catalog::builtin();
    if let Some(path) = &settings.templates_file {
        let loaded = catalog.load_templates(path)?;
        info!("Loaded {} workflow templates from {}", loaded, path.display());
    }

    let (artifact_root, tasks, uploads, workflows, executions) = match &settings.data_dir {
        Some(dir) => {
            info!("Data directory: {}", dir.display());
            (
                dir.join("artifacts"),
                RecordStore::open(dir, "tasks")?,
                RecordStore::open(dir, "uploads")?,
                RecordStore::open(dir, "workflows")?,
                RecordStore::open(dir, "executions")?,
            )
        }
        None => {
            let scratch = env::temp_dir().join(format!("scanrunner-{}", std::process::id()));
            warn!(
                "No data directory configured; records are kept in memory and artifacts in {}",
                scratch.display()
            );
            (
                scratch,
                RecordStore::ephemeral(),
                RecordStore::ephemeral(),
                RecordStore::ephemeral(),
                RecordStore::ephemeral(),
            )
        }
    };

    let artifacts = FsArtifactStore::new(artifact_root)?;
    let task_manager = TaskManager::new(
        settings,
        Arc::new(catalog),
        Arc::new(artifacts),
        tasks,
        uploads,
    );
    let interrupted_tasks = task_manager.recover()?;

    let engine = WorkflowEngine::new(settings, task_manager, workflows, executions);
    let interrupted_executions = engine.recover()?;
    if interrupted_tasks + interrupted_executions > 0 {
        warn!(
            "{} tasks and {} executions were interrupted by the last shutdown",
            interrupted_tasks, interrupted_executions
        );
    }
    Ok(engine)
}

/// Serves the API until Ctrl-C, then stops every live Execution and Task.
async fn serve(settings: Settings, engine: WorkflowEngine) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();

    let watchdog = settings.task_timeout_secs.map(|secs| {
        Watchdog::new(engine.tasks().clone(), Duration::from_secs(secs)).spawn(shutdown.clone())
    });

    let listener = tokio::net::TcpListener::bind(&settings.bind)
        .await
        .map_err(|e| format!("Could not bind {}: {}", settings.bind, e))?;
    info!("Listening on http://{}", listener.local_addr()?);
    info!(
        "Max running tasks: {}, max running nodes per execution: {}",
        settings.max_running_tasks, settings.max_running_nodes
    );

    let app = api::router(AppState::new(engine.clone()));
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Could not listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    engine.shutdown().await;
    if let Some(handle) = watchdog {
        let _ = handle.await;
    }
    info!("All tasks stopped");
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let settings = load_settings(&config)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let engine = build_engine(&settings)?;
        serve(settings, engine).await
    })
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
