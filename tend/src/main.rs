//! tend - lightweight process supervisor.
//!
//! `tend daemon` runs the supervisor in the foreground; every other
//! subcommand sends one request to a running daemon and prints the answer.

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tend::Config;
use tend::procfile;
use tend::services::control::{Client, DEFAULT_LOG_LINES, Request};
use tend::utils::signals::ShutdownSignals;
use tend::utils::systemd;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lightweight process supervisor.
#[derive(Parser)]
#[command(name = "tend")]
#[command(version = VERSION)]
#[command(about = "Lightweight process supervisor", long_about = None)]
struct Cli {
    /// Control socket path
    #[arg(long, global = true, env = "TEND_SOCKET", default_value = "/tmp/tend/tend.sock")]
    socket: PathBuf,

    /// Directory for task log files (daemon only)
    #[arg(long, global = true, env = "TEND_LOG_DIR", default_value = "/tmp/tend")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon in the foreground
    Daemon {
        #[command(subcommand)]
        action: Option<DaemonAction>,
    },

    /// Start tasks from a procfile (all of them if no names are given)
    Start {
        /// Procfile, or a directory containing one
        #[arg(short, long, default_value = "./")]
        file: PathBuf,

        /// Task names
        names: Vec<String>,
    },

    /// Stop tasks (all of them if no names are given)
    Stop {
        /// Task names
        names: Vec<String>,
    },

    /// List running tasks
    List,

    /// Print the last lines of a task's log
    Log {
        /// Task name
        name: String,

        /// Number of lines
        #[arg(default_value_t = DEFAULT_LOG_LINES)]
        count: usize,
    },
}

/// Manage the daemon as a systemd service.
#[derive(Subcommand)]
enum DaemonAction {
    /// Write and enable the systemd unit
    Install,
    /// Disable and delete the systemd unit
    Remove,
    Start,
    Stop,
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Daemon { action: None } => run_daemon(cli.socket, cli.log_dir).await,
        Commands::Daemon {
            action: Some(action),
        } => {
            let message = match action {
                DaemonAction::Install => systemd::install(&cli.socket, &cli.log_dir).await?,
                DaemonAction::Remove => systemd::remove().await?,
                DaemonAction::Start => systemd::start().await?,
                DaemonAction::Stop => systemd::stop().await?,
                DaemonAction::Status => systemd::status().await?,
            };
            println!("{message}");
            Ok(())
        }
        Commands::Start { file, names } => start(&cli.socket, &file, names).await,
        Commands::Stop { names } => {
            Client::new(&cli.socket)
                .send(&Request::Stop { names })
                .await?;
            Ok(())
        }
        Commands::List => {
            let response = Client::new(&cli.socket).send(&Request::List).await?;
            for name in response.tasks {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Log { name, count } => {
            let response = Client::new(&cli.socket)
                .send(&Request::Log {
                    name,
                    count: Some(count),
                })
                .await?;
            for line in response.lines {
                println!("{line}");
            }
            Ok(())
        }
    }
}

async fn run_daemon(socket_path: PathBuf, log_dir: PathBuf) -> Result<()> {
    info!("tend v{} starting", VERSION);

    let config = Config {
        socket_path,
        log_dir,
        ..Config::default()
    };

    let mut signals = ShutdownSignals::install()?;
    let shutdown = async move {
        let signal = signals.recv().await;
        info!("Received {}, shutting down", signal);
    };

    tend::run_daemon(config, shutdown).await?;
    info!("tend stopped");
    Ok(())
}

async fn start(socket: &Path, file: &Path, names: Vec<String>) -> Result<()> {
    let path = procfile::resolve_path(file);
    let mut tasks = procfile::parse_file(&path)
        .map_err(|e| anyhow!("{}: {}", path.display(), e))?;

    if !names.is_empty() {
        for missing in names.iter().filter(|n| !tasks.iter().any(|t| &t.name == *n)) {
            eprintln!("task `{}` is not defined in {}", missing, path.display());
        }
        tasks.retain(|task| names.contains(&task.name));
    }

    if tasks.is_empty() {
        bail!("nothing to start");
    }

    Client::new(socket).send(&Request::Start { tasks }).await?;
    Ok(())
}
