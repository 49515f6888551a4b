//! Signal handling utilities for the daemon and its tasks.

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::signal::unix::{SignalKind, signal};

/// SIGINT/SIGTERM listener driving daemon shutdown.
pub struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Install the handlers. Must be called inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::SIGINT,
            _ = self.terminate.recv() => Signal::SIGTERM,
        }
    }
}

/// Send `signal` to the process group led by `leader`.
///
/// A group that no longer exists is not an error: the task is already on
/// its way out and its waiter will tear it down.
pub fn signal_group(leader: Pid, signal: Signal) -> nix::Result<()> {
    match killpg(leader, signal) {
        Ok(()) => {
            debug!("Sent {:?} to process group {}", signal, leader);
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!("Process group {} already gone", leader);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Information about a child process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Shell-style code: the exit status, or 128 + signal number.
    pub exit_code: i32,
    pub signal: Option<Signal>,
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self {
                exit_code: code,
                signal: None,
            };
        }

        match status.signal() {
            Some(raw) => Self {
                exit_code: 128 + raw,
                signal: Signal::try_from(raw).ok(),
            },
            None => Self {
                exit_code: 255,
                signal: None,
            },
        }
    }
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(sig) => write!(f, "terminated by {sig:?}"),
            None => write!(f, "exit code {}", self.exit_code),
        }
    }
}
