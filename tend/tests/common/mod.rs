//! Test helpers for tend integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tend::logs::{FileLogStore, RotationPolicy};
use tend::services::supervisor::Supervisor;
use tokio::net::UnixStream;

/// Supervisor writing task logs into `dir`, with the test's environment.
pub fn supervisor(dir: &TempDir) -> Arc<Supervisor> {
    let store = FileLogStore::new(dir.path().join("logs"), RotationPolicy::default())
        .expect("Failed to create log store");
    Supervisor::new(Arc::new(store), std::env::vars_os().collect())
}

/// Poll `check` every 20ms until it holds or `limit` elapses.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// A `tend daemon` subprocess with its own socket and log directory.
pub struct TestDaemon {
    process: Child,
    pub socket: PathBuf,
    pub log_dir: PathBuf,
    _dir: TempDir,
}

impl TestDaemon {
    /// Spawn the daemon and wait (up to 5 seconds) for its socket to accept.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let dir = TempDir::new()?;
        let socket = dir.path().join("run/tend.sock");
        let log_dir = dir.path().join("logs");

        let process = Command::new(env!("CARGO_BIN_EXE_tend"))
            .arg("--socket")
            .arg(&socket)
            .arg("--log-dir")
            .arg(&log_dir)
            .arg("daemon")
            .env("RUST_LOG", "debug")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let mut daemon = Self {
            process,
            socket,
            log_dir,
            _dir: dir,
        };

        for _ in 0..50 {
            if UnixStream::connect(&daemon.socket).await.is_ok() {
                return Ok(daemon);
            }
            if let Some(status) = daemon.process.try_wait()? {
                return Err(format!("daemon exited early: {status}").into());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err("daemon did not start in time".into())
    }

    /// Run the CLI against this daemon.
    pub fn cli(&self, args: &[&str]) -> std::process::Output {
        Command::new(env!("CARGO_BIN_EXE_tend"))
            .arg("--socket")
            .arg(&self.socket)
            .args(args)
            .output()
            .expect("Failed to run tend CLI")
    }

    /// SIGTERM the daemon and wait for it to exit.
    pub fn terminate(&mut self) -> std::process::ExitStatus {
        signal_daemon(&self.process);
        self.process.wait().expect("Failed to wait for daemon")
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Ok(None) = self.process.try_wait() {
            signal_daemon(&self.process);
            let _ = self.process.wait();
        }
    }
}

fn signal_daemon(process: &Child) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(process.id() as i32),
        nix::sys::signal::Signal::SIGTERM,
    );
}
