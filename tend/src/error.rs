//! Error types for tend.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Procfile parsing errors. Line numbers are 1-based.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("line {line}: unknown directive `{directive}`")]
    UnknownDirective { line: usize, directive: String },

    #[error("line {line}: directive `{directive}` requires a value")]
    MissingValue { line: usize, directive: String },

    #[error("line {line}: duplicate `{directive}` in task block")]
    DuplicateDirective { line: usize, directive: String },

    #[error("line {line}: `{directive}` must be an absolute path, got {path:?}")]
    RelativePath {
        line: usize,
        directive: String,
        path: PathBuf,
    },

    #[error("line {line}: unknown user `{name}`")]
    UnknownUser { line: usize, name: String },

    #[error("line {line}: unknown group `{name}`")]
    UnknownGroup { line: usize, name: String },

    #[error("line {line}: env entry `{entry}` is not KEY=VALUE")]
    MalformedEnv { line: usize, entry: String },

    #[error("line {line}: unbalanced quotes in `{value}`")]
    UnbalancedQuotes { line: usize, value: String },

    #[error("line {line}: task block has no `{directive}`")]
    MissingDirective { line: usize, directive: String },

    #[error("line {line}: task `{name}` is defined more than once")]
    DuplicateTask { line: usize, name: String },

    #[error("failed to read procfile: {0}")]
    Io(#[from] io::Error),
}

/// Failures deriving the OS process attributes of a task.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("task `{task}`: user `{user}` not found")]
    UnknownUser { task: String, user: String },

    #[error("task `{task}`: group `{group}` not found")]
    UnknownGroup { task: String, group: String },

    #[error("task `{task}`: user database lookup failed: {source}")]
    Lookup {
        task: String,
        source: nix::errno::Errno,
    },

    #[error("task `{task}`: path {path:?} contains a NUL byte")]
    InvalidPath { task: String, path: PathBuf },
}

/// Per-task start failures. None of these affect other tasks or the daemon.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("task specification is invalid (empty name or command)")]
    InvalidSpec,

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("failed to open log sink: {0}")]
    LogSink(#[source] io::Error),

    #[error("failed to set up output pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error("setup command `{command}` could not be launched: {source}")]
    SetupLaunch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("setup command `{command}` failed: {status}")]
    SetupFailed { command: String, status: String },

    #[error("command `{command}` could not be launched: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// Control channel framing and decoding errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a complete message arrived")]
    Truncated,

    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Errors seen by CLI invocations talking to the daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to tend daemon at {path:?}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
