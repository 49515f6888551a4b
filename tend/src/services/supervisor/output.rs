//! Output wiring: one pipe per task, drained into the task's log sink.

use crate::logs::LogSink;
use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::io;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

/// How long teardown waits for buffered output once the task's commands are
/// gone. A process the task forked into the background can hold the pipe
/// open for as long as it lives.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Write end of a task's output pipe.
///
/// Every command of the task gets dups of it as stdout and stderr. Call
/// [`close`](Self::close) once the last command has been spawned so the
/// reader can see EOF.
pub struct OutputPipe {
    write: OwnedFd,
    reader: OutputReader,
}

/// Reader side of a closed [`OutputPipe`].
pub struct OutputReader {
    task: String,
    handle: JoinHandle<()>,
}

impl OutputPipe {
    /// Create the pipe and spawn the reader that forwards complete lines to
    /// `sink` until EOF.
    pub fn open(task: &str, sink: Arc<dyn LogSink>) -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let receiver = pipe::Receiver::from_owned_fd(read)?;

        let handle = tokio::spawn(forward_lines(task.to_string(), receiver, sink));

        Ok(Self {
            write,
            reader: OutputReader {
                task: task.to_string(),
                handle,
            },
        })
    }

    /// stdout/stderr handles for one command.
    pub fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        Ok((
            Stdio::from(self.write.try_clone()?),
            Stdio::from(self.write.try_clone()?),
        ))
    }

    /// Drop the daemon's write end.
    pub fn close(self) -> OutputReader {
        drop(self.write);
        self.reader
    }
}

impl OutputReader {
    /// Wait until everything the task's commands wrote has reached the sink.
    ///
    /// Gives up after [`DRAIN_LIMIT`]; the reader then keeps running
    /// detached, and whatever it reads after the sink is closed is dropped.
    pub async fn drain(self) {
        match tokio::time::timeout(DRAIN_LIMIT, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Task {}: output reader failed: {}", self.task, e),
            Err(_) => warn!(
                "Task {}: output still open after {:?}, a background process holds it",
                self.task, DRAIN_LIMIT
            ),
        }
    }
}

async fn forward_lines(task: String, receiver: pipe::Receiver, sink: Arc<dyn LogSink>) {
    let mut reader = BufReader::new(receiver);
    let mut buf = Vec::new();
    let mut write_failed = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf);
                if let Err(e) = sink.write_line(&line) {
                    if !write_failed {
                        warn!("Task {}: failed to write log line: {}", task, e);
                        write_failed = true;
                    }
                }
            }
            Err(e) => {
                warn!("Task {}: output pipe read failed: {}", task, e);
                break;
            }
        }
    }

    debug!("Task {}: output pipe closed", task);
}
