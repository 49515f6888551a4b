//! tend - a lightweight process supervisor.
//!
//! A long-running daemon starts, tracks and stops named child processes
//! ("tasks") on behalf of short-lived CLI invocations that talk to it over a
//! Unix domain socket.
//!
//! ## Architecture
//!
//! - **Procfile**: parses task definitions into [`spec::TaskSpec`]s (CLI side)
//! - **Supervisor**: spawns, tracks and stops task processes (daemon side)
//! - **Control**: one JSON request and one JSON response per socket connection
//! - **Logs**: per-task rotating log files the daemon writes task output to

pub mod error;
pub mod logs;
pub mod procfile;
pub mod services;
pub mod spec;
pub mod utils;

use crate::logs::{FileLogStore, RotationPolicy};
use crate::services::control::ControlServer;
use crate::services::supervisor::Supervisor;
use anyhow::Context;
use log::info;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Directory holding the task log files.
    pub log_dir: PathBuf,
    pub rotation: RotationPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/tend/tend.sock"),
            log_dir: PathBuf::from("/tmp/tend"),
            rotation: RotationPolicy::default(),
        }
    }
}

/// Run the daemon until `shutdown` resolves, then stop every task.
///
/// Fails only if the log directory or the control socket cannot be set up.
pub async fn run_daemon<F>(config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let store = FileLogStore::new(&config.log_dir, config.rotation)
        .with_context(|| format!("failed to create log directory {}", config.log_dir.display()))?;
    info!("Task logs go to {}", store.dir().display());

    let supervisor = Supervisor::new(Arc::new(store), std::env::vars_os().collect());

    let server = ControlServer::bind(&config.socket_path, supervisor)
        .await
        .with_context(|| {
            format!(
                "failed to open control socket {}",
                config.socket_path.display()
            )
        })?;

    server.serve(shutdown).await;
    Ok(())
}
