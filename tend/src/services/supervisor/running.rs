//! Runtime record of a supervised task and its completion signal.

use super::output::OutputReader;
use crate::logs::LogSink;
use crate::utils::signals;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};

/// Table entry of a task whose process has been spawned and not yet reaped.
pub struct RunningTask {
    /// Pid of the main process, which also leads the task's process group.
    pub pid: Pid,
    pub sink: Arc<dyn LogSink>,
    pub done: CompletionWaiter,
    /// Signals go through the exit waiter, which owns the child.
    pub signals: mpsc::UnboundedSender<SignalRequest>,
}

/// Everything the exit waiter needs to reap a task and tear it down.
pub struct TaskProcess {
    pub child: Child,
    pub pid: Pid,
    pub signals: mpsc::UnboundedReceiver<SignalRequest>,
    pub output: OutputReader,
    pub sink: Arc<dyn LogSink>,
    pub done: Completion,
}

/// A signal for a task's process group, answered with the delivery result.
pub struct SignalRequest {
    pub signal: Signal,
    pub reply: oneshot::Sender<nix::Result<()>>,
}

impl SignalRequest {
    /// Only called while the group leader is unreaped, so `pid` still names
    /// the task's group.
    pub fn deliver(self, pid: Pid) {
        let result = signals::signal_group(pid, self.signal);
        // The requester may have given up waiting.
        let _ = self.reply.send(result);
    }
}

/// Fires once teardown of a task has finished.
///
/// `fire` consumes the value, so a completion can only ever fire once.
/// Dropping it without firing also releases waiters.
pub struct Completion(watch::Sender<bool>);

/// Cloneable handle that resolves when the matching [`Completion`] fires.
#[derive(Clone)]
pub struct CompletionWaiter(watch::Receiver<bool>);

pub fn completion() -> (Completion, CompletionWaiter) {
    let (tx, rx) = watch::channel(false);
    (Completion(tx), CompletionWaiter(rx))
}

impl Completion {
    pub fn fire(self) {
        self.0.send_replace(true);
    }
}

impl CompletionWaiter {
    pub async fn wait(mut self) {
        // Err means the sender is gone, which also ends the task's lifecycle.
        let _ = self.0.wait_for(|done| *done).await;
    }

    #[cfg(test)]
    fn is_done(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn all_waiters_release_on_fire() {
        let (done, waiter) = completion();
        let first = tokio::spawn(waiter.clone().wait());
        let second = tokio::spawn(waiter.clone().wait());

        assert!(!waiter.is_done());
        done.fire();

        timeout(Duration::from_secs(1), first).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), second).await.unwrap().unwrap();
        assert!(waiter.is_done());

        // Late waiters return immediately.
        timeout(Duration::from_secs(1), waiter.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_completion_releases_waiters() {
        let (done, waiter) = completion();
        drop(done);
        timeout(Duration::from_secs(1), waiter.wait()).await.unwrap();
    }
}
