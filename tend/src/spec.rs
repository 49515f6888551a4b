//! Task specification - the immutable description of what to run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A declarative task, as produced by the procfile parser and carried over
/// the control channel to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// argv of the main command, `command[0]` is the program.
    pub command: Vec<String>,
    /// Setup commands run to completion, in order, before `command`.
    #[serde(default)]
    pub setup: Vec<Vec<String>>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub chroot: Option<PathBuf>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Extra `KEY=VALUE` entries appended to the daemon environment.
    #[serde(default)]
    pub env: Vec<String>,
}

impl TaskSpec {
    /// Spec with just a name and a command; everything else defaulted.
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A spec can be started iff it has a name and a program to run.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.command.is_empty()
    }
}

/// Render an argv for log and error messages.
pub fn display_argv(argv: &[String]) -> String {
    argv.join(" ")
}
