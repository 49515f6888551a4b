//! Task Supervisor - owns the table of running tasks.
//!
//! The supervisor is the only component that spawns or signals task
//! processes. Its table maps a task name to a [`RunningTask`]; a name is
//! present exactly while a process for it has been spawned and not yet
//! reaped. The table lock is only held for point reads and writes, never
//! across process spawn, signal delivery or wait.
//!
//! Lifecycle of one task:
//!
//! 1. `start` claims the name, opens a log sink and the output pipe, runs the
//!    setup commands in order and spawns the main command.
//! 2. The claim becomes a table entry and an exit waiter is spawned. The
//!    waiter owns the child and is the only place that signals it.
//! 3. When the process exits the waiter tears the task down: drain buffered
//!    output, append the exit summary, close the sink, remove the entry and
//!    fire the completion signal. A name leaves the table only once its log
//!    is complete.
//!
//! `stop` asks the waiter to send SIGTERM to the task's process group and
//! waits for step 3.

mod output;
mod running;

use crate::error::StartError;
use crate::logs::{LogSink, LogStore};
use crate::spec::{TaskSpec, display_argv};
use crate::utils::privilege::ProcessConfig;
use crate::utils::signals::{self, ChildExit};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use output::OutputPipe;
use running::{RunningTask, SignalRequest, TaskProcess, completion};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// Result of a successful [`Supervisor::start`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A task with the same name is running or being started; nothing done.
    AlreadyRunning,
}

#[derive(Default)]
struct Table {
    running: HashMap<String, RunningTask>,
    /// Names claimed by a `start` that has not spawned its process yet.
    starting: HashSet<String>,
    /// Set by `shutdown`; no new task may start afterwards.
    closed: bool,
}

pub struct Supervisor {
    table: Mutex<Table>,
    store: Arc<dyn LogStore>,
    base_env: Vec<(OsString, OsString)>,
}

impl Supervisor {
    /// Create a supervisor writing task output to `store`. Tasks inherit
    /// `base_env` (minus `HOME`) plus their own variables.
    pub fn new(store: Arc<dyn LogStore>, base_env: Vec<(OsString, OsString)>) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(Table::default()),
            store,
            base_env,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start one task.
    ///
    /// Idempotent by name: if a task of that name is running (or another
    /// call is starting it) this returns [`StartOutcome::AlreadyRunning`]
    /// without touching any process. On error no table entry exists and
    /// the task's log sink is closed.
    pub async fn start(self: &Arc<Self>, spec: TaskSpec) -> Result<StartOutcome, StartError> {
        if !spec.is_valid() {
            warn!("Refusing to start invalid task {:?}", spec.name);
            return Err(StartError::InvalidSpec);
        }

        let Some(claim) = self.claim(&spec.name)? else {
            info!("Won't start task `{}` because it is already running", spec.name);
            return Ok(StartOutcome::AlreadyRunning);
        };

        let sink = self.store.open(&spec.name).map_err(StartError::LogSink)?;
        let pipe = match OutputPipe::open(&spec.name, Arc::clone(&sink)) {
            Ok(pipe) => pipe,
            Err(e) => {
                close_sink(&spec.name, sink.as_ref());
                return Err(StartError::Pipe(e));
            }
        };

        let launched = self.launch(&spec, &pipe).await;
        let output = pipe.close();

        let mut child = match launched {
            Ok(child) => child,
            Err(e) => {
                error!("Task `{}` failed to start: {}", spec.name, e);
                output.drain().await;
                append(&spec.name, sink.as_ref(), &format!("failed to start: {e}"));
                close_sink(&spec.name, sink.as_ref());
                return Err(e);
            }
        };

        let Some(raw_pid) = child.id() else {
            output.drain().await;
            close_sink(&spec.name, sink.as_ref());
            return Err(StartError::Launch {
                command: display_argv(&spec.command),
                source: io::Error::other("process exited before its pid was read"),
            });
        };
        let pid = Pid::from_raw(raw_pid as i32);

        let (done, waiter) = completion();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let task = RunningTask {
            pid,
            sink: Arc::clone(&sink),
            done: waiter,
            signals: signal_tx,
        };

        if claim.promote(task).is_err() {
            warn!("Task `{}` spawned during shutdown, terminating it", spec.name);
            if let Err(e) = signals::signal_group(pid, Signal::SIGTERM) {
                error!("Failed to signal task `{}`: {}", spec.name, e);
            }
            if let Err(e) = child.wait().await {
                warn!("Waiting for task `{}` failed: {}", spec.name, e);
            }
            output.drain().await;
            close_sink(&spec.name, sink.as_ref());
            return Err(StartError::ShuttingDown);
        }

        info!("Task `{}` started with PID {}", spec.name, pid);
        let process = TaskProcess {
            child,
            pid,
            signals: signal_rx,
            output,
            sink,
            done,
        };
        tokio::spawn(Arc::clone(self).wait_for_exit(spec.name, process));

        Ok(StartOutcome::Started { pid: raw_pid })
    }

    /// Start every task in order. A failing task does not stop the others.
    pub async fn start_all(
        self: &Arc<Self>,
        specs: Vec<TaskSpec>,
    ) -> Vec<(String, Result<StartOutcome, StartError>)> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            let result = self.start(spec).await;
            results.push((name, result));
        }
        results
    }

    /// Send SIGTERM to the task's process group and wait for its teardown.
    /// Unknown names are ignored.
    ///
    /// There is no SIGKILL escalation: a task that ignores SIGTERM keeps
    /// this call waiting until it exits on its own.
    pub async fn stop(&self, name: &str) {
        let target = {
            let table = self.lock();
            table
                .running
                .get(name)
                .map(|task| (task.pid, task.signals.clone(), task.done.clone()))
        };

        let Some((pid, signals, done)) = target else {
            debug!("Stop: task `{}` is not running", name);
            return;
        };

        info!("Stopping task `{}` (process group {})", name, pid);
        let (reply, delivered) = oneshot::channel();
        let request = SignalRequest {
            signal: Signal::SIGTERM,
            reply,
        };
        // A closed channel means the process was already reaped.
        if signals.send(request).is_ok() {
            if let Ok(Err(e)) = delivered.await {
                error!("Failed to signal task `{}`: {}", name, e);
                return;
            }
        }

        done.wait().await;
    }

    /// Stop every task present at call time, concurrently.
    pub async fn stop_all(self: &Arc<Self>) {
        let names: Vec<String> = self.lock().running.keys().cloned().collect();
        if names.is_empty() {
            return;
        }

        info!("Stopping {} task(s)", names.len());
        let mut stops = JoinSet::new();
        for name in names {
            let supervisor = Arc::clone(self);
            stops.spawn(async move { supervisor.stop(&name).await });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                error!("Stop task panicked: {}", e);
            }
        }
    }

    /// Refuse further starts, then stop everything.
    pub async fn shutdown(self: &Arc<Self>) {
        self.lock().closed = true;
        self.stop_all().await;
    }

    /// Names of running tasks, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().running.keys().cloned().collect();
        names.sort();
        names
    }

    /// Last `n` lines of a running task's log, oldest first. Never fails:
    /// problems are reported as a single explanatory line.
    pub async fn read_log(&self, name: &str, n: usize) -> Vec<String> {
        let identity = self
            .lock()
            .running
            .get(name)
            .map(|task| task.sink.identity().to_path_buf());

        let Some(identity) = identity else {
            return vec![format!("task {name} is not running")];
        };

        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.tail(&identity, n)).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => vec![format!("failed to read log of task {name}: {e}")],
            Err(e) => vec![format!("failed to read log of task {name}: {e}")],
        }
    }

    fn claim(&self, name: &str) -> Result<Option<Claim<'_>>, StartError> {
        let mut table = self.lock();
        if table.closed {
            return Err(StartError::ShuttingDown);
        }
        if table.running.contains_key(name) || table.starting.contains(name) {
            return Ok(None);
        }
        table.starting.insert(name.to_string());
        Ok(Some(Claim {
            supervisor: self,
            name: name.to_string(),
            released: false,
        }))
    }

    /// Run setup commands, then spawn the main command. All of them write
    /// into `pipe`.
    async fn launch(&self, spec: &TaskSpec, pipe: &OutputPipe) -> Result<Child, StartError> {
        let config = ProcessConfig::resolve(spec, self.base_env.iter().cloned())?;

        for argv in &spec.setup {
            let command = display_argv(argv);
            debug!("Task `{}`: running setup command `{}`", spec.name, command);

            let mut cmd = config
                .command(argv)
                .map_err(|source| StartError::SetupLaunch {
                    command: command.clone(),
                    source,
                })?;
            let (stdout, stderr) = pipe.stdio().map_err(StartError::Pipe)?;
            cmd.stdout(stdout).stderr(stderr);

            let status = cmd
                .status()
                .await
                .map_err(|source| StartError::SetupLaunch {
                    command: command.clone(),
                    source,
                })?;

            let exit = ChildExit::from(status);
            if !exit.success() {
                return Err(StartError::SetupFailed {
                    command,
                    status: exit.to_string(),
                });
            }
        }

        let command = display_argv(&spec.command);
        let mut cmd = config
            .command(&spec.command)
            .map_err(|source| StartError::Launch {
                command: command.clone(),
                source,
            })?;
        let (stdout, stderr) = pipe.stdio().map_err(StartError::Pipe)?;
        cmd.stdout(stdout).stderr(stderr);

        cmd.spawn()
            .map_err(|source| StartError::Launch { command, source })
    }

    /// Own the child until it is reaped, delivering signal requests while
    /// its pid still names the task's process group, then tear down. Runs
    /// exactly once per running task because it consumes the task's
    /// completion.
    async fn wait_for_exit(self: Arc<Self>, name: String, process: TaskProcess) {
        let TaskProcess {
            mut child,
            pid,
            mut signals,
            output,
            sink,
            done,
        } = process;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(request) = signals.recv() => request.deliver(pid),
            }
        };
        let exit = match status {
            Ok(status) => Some(ChildExit::from(status)),
            Err(e) => {
                error!("Waiting for task `{}` failed: {}", name, e);
                None
            }
        };

        // Pending requests get a closed reply channel.
        drop(signals);

        output.drain().await;
        let summary = match exit {
            Some(exit) => format!("process exited: {exit}"),
            None => "process state unknown".to_string(),
        };
        append(&name, sink.as_ref(), &summary);
        close_sink(&name, sink.as_ref());
        self.lock().running.remove(&name);

        match exit {
            Some(exit) if exit.success() => info!("Task `{}` ended", name),
            Some(exit) => warn!("Task `{}` ended: {}", name, exit),
            None => warn!("Task `{}` ended with unknown status", name),
        }

        done.fire();
    }
}

fn append(task: &str, sink: &dyn LogSink, line: &str) {
    if let Err(e) = sink.write_line(line) {
        warn!("Failed to write log of task `{}`: {}", task, e);
    }
}

fn close_sink(task: &str, sink: &dyn LogSink) {
    if let Err(e) = sink.close() {
        warn!("Failed to close log of task `{}`: {}", task, e);
    }
}

/// A name reserved by an in-flight `start`. Released on drop unless it was
/// promoted into a table entry.
struct Claim<'a> {
    supervisor: &'a Supervisor,
    name: String,
    released: bool,
}

impl Claim<'_> {
    /// Atomically swap the claim for a table entry. Fails, handing the task
    /// back, if shutdown began in the meantime.
    fn promote(mut self, task: RunningTask) -> Result<(), RunningTask> {
        let mut table = self.supervisor.lock();
        table.starting.remove(&self.name);
        self.released = true;

        if table.closed {
            return Err(task);
        }
        table.running.insert(self.name.clone(), task);
        Ok(())
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.supervisor.lock().starting.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Sink on a full disk: every write fails.
    struct FullSink {
        path: PathBuf,
        closes: AtomicUsize,
    }

    impl LogSink for FullSink {
        fn write_line(&self, _line: &str) -> io::Result<()> {
            Err(io::Error::other("no space left on device"))
        }

        fn close(&self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn identity(&self) -> &Path {
            &self.path
        }
    }

    struct FullStore(Arc<FullSink>);

    impl LogStore for FullStore {
        fn open(&self, _task: &str) -> io::Result<Arc<dyn LogSink>> {
            Ok(Arc::clone(&self.0) as Arc<dyn LogSink>)
        }

        fn tail(&self, _identity: &Path, _n: usize) -> io::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn full_disk() -> (Arc<Supervisor>, Arc<FullSink>) {
        let sink = Arc::new(FullSink {
            path: PathBuf::from("/dev/full"),
            closes: AtomicUsize::new(0),
        });
        let supervisor = Supervisor::new(Arc::new(FullStore(Arc::clone(&sink))), Vec::new());
        (supervisor, sink)
    }

    #[tokio::test]
    async fn failed_writes_do_not_abort_teardown() {
        let (supervisor, sink) = full_disk();

        supervisor
            .start(TaskSpec::new("noisy", ["sh", "-c", "echo hello; sleep 30"]))
            .await
            .unwrap();
        timeout(Duration::from_secs(10), supervisor.stop("noisy"))
            .await
            .unwrap();

        assert!(supervisor.list().is_empty());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_writes_do_not_mask_start_errors() {
        let (supervisor, sink) = full_disk();

        let mut spec = TaskSpec::new("noisy", ["true"]);
        spec.setup = vec![vec!["false".into()]];

        let err = supervisor.start(spec).await.unwrap_err();
        assert!(matches!(err, StartError::SetupFailed { .. }), "unexpected error: {err}");
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }
}
