use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use vjbus::config::{DEFAULT_STOP_TIMEOUT, ENV_REGISTRY};
use vjbus::supervisor::{SUPERVISOR_NAME, control_timeout};
use vjbus::{
    BusConfig, Console, ConsoleConfig, ConsoleError, Envelope, HealthStatus, SupervisorConfig,
};

#[derive(Parser)]
#[command(name = "vjbus")]
#[command(about = "Supervise and talk to vjbus workers", long_about = None)]
struct Cli {
    /// Registry file shared by every process on the bus
    #[arg(long, global = true, env = ENV_REGISTRY)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the process supervisor for the workers in a config file")]
    Supervise {
        #[arg(long, value_name = "CONFIG_JSON")]
        config: PathBuf,
    },
    #[command(about = "List registered workers")]
    Workers {
        /// Include workers whose heartbeat is stale
        #[arg(long)]
        all: bool,
    },
    #[command(about = "Send a command to a worker and print its reply")]
    Send {
        worker: String,
        verb: String,
        /// Command data as a JSON object
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
        /// Reply timeout; defaults to the bus command timeout, extended by
        /// the supervisor stop timeout for `stop_worker`/`restart_worker`
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    #[command(about = "Health of every registered worker")]
    Health,
    #[command(about = "Current state of every registered worker")]
    States,
    #[command(about = "Print telemetry as JSON lines until interrupted")]
    Tail {
        /// Topic pattern: `*`, `prefix.*` or an exact topic
        #[arg(default_value = "*")]
        topic: String,
        #[arg(long)]
        worker: Option<String>,
    },
}

/// Exit codes for the three kinds of worker failure.
const EXIT_UNKNOWN_WORKER: u8 = 2;
const EXIT_UNHEALTHY: u8 = 3;
const EXIT_APPLICATION_ERROR: u8 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    vjbus::logging::init_tracing();
    let cli = Cli::parse();

    let mut bus = BusConfig::from_env().context("invalid environment")?;
    if let Some(path) = cli.registry {
        bus = bus.with_registry_path(path);
    }

    match cli.command {
        Commands::Supervise { config } => supervise(config, bus).await,
        Commands::Workers { all } => {
            let console = console(&bus)?;
            let workers = console.discover_workers(all).await?;
            print_json(&workers)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Send {
            worker,
            verb,
            data,
            timeout_ms,
        } => {
            let data = match data {
                Some(raw) => serde_json::from_str::<Map<String, Value>>(&raw)
                    .context("--data must be a JSON object")?,
                None => Map::new(),
            };
            let timeout = match timeout_ms {
                Some(ms) => Duration::from_millis(ms),
                None if worker == SUPERVISOR_NAME => {
                    control_timeout(&verb, bus.command_timeout, DEFAULT_STOP_TIMEOUT)
                }
                None => bus.command_timeout,
            };
            let console = console(&bus)?;
            let result = console.send_command(&worker, &verb, data, timeout).await;
            match result {
                Ok(ack) => {
                    print_json(&ack)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report_failure(&e)),
            }
        }
        Commands::Health => {
            let console = console(&bus)?;
            let reports = console.health_check_all().await?;
            print_json(&reports)?;
            let all_healthy = reports.iter().all(|r| r.status == HealthStatus::Healthy);
            Ok(if all_healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_UNHEALTHY)
            })
        }
        Commands::States => {
            let console = console(&bus)?;
            print_json(&console.get_all_states().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tail { topic, worker } => tail(&bus, &topic, worker.as_deref()).await,
    }
}

fn console(bus: &BusConfig) -> anyhow::Result<Console> {
    let registry = bus.registry()?;
    Ok(Console::new(
        registry,
        ConsoleConfig::new().with_command_timeout(bus.command_timeout),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_failure(error: &ConsoleError) -> ExitCode {
    match error {
        ConsoleError::UnknownWorker(worker) => {
            eprintln!("unknown worker: {worker}");
            ExitCode::from(EXIT_UNKNOWN_WORKER)
        }
        ConsoleError::Unhealthy { .. } | ConsoleError::Transport { .. } => {
            eprintln!("unhealthy: {error}");
            ExitCode::from(EXIT_UNHEALTHY)
        }
        ConsoleError::Application { worker, message } => {
            eprintln!("{worker} error: {message}");
            ExitCode::from(EXIT_APPLICATION_ERROR)
        }
        ConsoleError::Registry(e) => {
            eprintln!("registry error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn supervise(config_path: PathBuf, bus: BusConfig) -> anyhow::Result<ExitCode> {
    let config = SupervisorConfig::load(&config_path)?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    tracing::info!(
        config = %config_path.display(),
        registry = %bus.registry_path.display(),
        workers = config.workers.len(),
        "Starting supervisor"
    );
    vjbus::supervisor::serve(config, bus, cancel).await?;
    Ok(ExitCode::SUCCESS)
}

async fn tail(bus: &BusConfig, topic: &str, worker: Option<&str>) -> anyhow::Result<ExitCode> {
    let console = Arc::new(console(bus)?);
    console
        .subscribe(
            topic,
            |envelope: &Envelope| match serde_json::to_string(envelope) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "Unprintable envelope"),
            },
            worker,
        )
        .await?;

    let discovery = {
        let console = Arc::clone(&console);
        let interval = console.config().discovery_interval;
        tokio::spawn(async move { console.run_discovery(interval).await })
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    cancel.cancelled().await;

    console.shutdown();
    discovery.await.context("discovery task failed")?;
    Ok(ExitCode::SUCCESS)
}

/// Cancel `token` on ctrl-c or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown requested");
    token.cancel();
}
