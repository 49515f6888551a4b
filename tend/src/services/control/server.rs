//! Daemon side of the control channel.

use super::{DEFAULT_LOG_LINES, Request, Response, read_message, write_message};
use crate::services::supervisor::Supervisor;
use log::{debug, error, info, warn};
use std::fs::{self, Permissions};
use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    supervisor: Arc<Supervisor>,
}

impl ControlServer {
    /// Bind the control socket at `path`.
    ///
    /// A leftover socket file with no listener behind it is replaced; if
    /// another daemon answers on it, binding fails with `AddrInUse`.
    pub async fn bind(path: impl Into<PathBuf>, supervisor: Arc<Supervisor>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("tend daemon already running at {}", path.display()),
                    ));
                }
                info!("Removing stale control socket {}", path.display());
                remove_socket(&path)?;
                UnixListener::bind(&path)?
            }
            Err(e) => return Err(e),
        };

        fs::set_permissions(&path, Permissions::from_mode(0o600))?;

        Ok(Self {
            listener,
            path,
            supervisor,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    /// and stop every task.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Listening on {}", self.path.display());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let supervisor = Arc::clone(&self.supervisor);
                        tokio::spawn(handle_connection(stream, supervisor));
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("Control channel closing, stopping all tasks");
        drop(self.listener);
        if let Err(e) = remove_socket(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }

        self.supervisor.shutdown().await;
        info!("All tasks stopped");
    }
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn handle_connection(stream: UnixStream, supervisor: Arc<Supervisor>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let request: Request = match read_message(&mut reader).await {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping control connection: {}", e);
            return;
        }
    };
    debug!("Control request: {:?}", request);

    let response = dispatch(&supervisor, request).await;
    if let Err(e) = write_message(&mut write, &response).await {
        warn!("Failed to send control response: {}", e);
    }
}

/// Run one request against the supervisor.
pub async fn dispatch(supervisor: &Arc<Supervisor>, request: Request) -> Response {
    match request {
        Request::Start { tasks } => {
            let supervisor = Arc::clone(supervisor);
            tokio::spawn(async move {
                let total = tasks.len();
                let results = supervisor.start_all(tasks).await;
                let failed: Vec<&str> = results
                    .iter()
                    .filter(|(_, result)| result.is_err())
                    .map(|(name, _)| name.as_str())
                    .collect();
                if failed.is_empty() {
                    debug!("Start request for {} task(s) done", total);
                } else {
                    warn!("{} of {} task(s) failed to start: {}", failed.len(), total, failed.join(", "));
                }
            });
            Response::default()
        }
        Request::Stop { names } if names.is_empty() => {
            supervisor.stop_all().await;
            Response::default()
        }
        Request::Stop { names } => {
            let mut stops = JoinSet::new();
            for name in names {
                let supervisor = Arc::clone(supervisor);
                stops.spawn(async move { supervisor.stop(&name).await });
            }
            while let Some(result) = stops.join_next().await {
                if let Err(e) = result {
                    error!("Stop task panicked: {}", e);
                }
            }
            Response::default()
        }
        Request::List => Response {
            tasks: supervisor.list(),
            ..Default::default()
        },
        Request::Log { name, .. } if name.is_empty() => Response {
            lines: vec!["task name cannot be empty".to_string()],
            ..Default::default()
        },
        Request::Log { name, count } => {
            let n = count.filter(|&n| n > 0).unwrap_or(DEFAULT_LOG_LINES);
            Response {
                lines: supervisor.read_log(&name, n).await,
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{FileLogStore, RotationPolicy};
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> Arc<Supervisor> {
        let store = FileLogStore::new(dir.path().join("logs"), RotationPolicy::default()).unwrap();
        Supervisor::new(Arc::new(store), Vec::new())
    }

    #[tokio::test]
    async fn replaces_stale_socket_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/tend.sock");

        let first = ControlServer::bind(&path, supervisor(&dir)).await.unwrap();
        drop(first);
        assert!(path.exists());

        let second = ControlServer::bind(&path, supervisor(&dir)).await.unwrap();
        let mode = fs::metadata(second.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn refuses_socket_with_live_listener() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tend.sock");

        let _live = ControlServer::bind(&path, supervisor(&dir)).await.unwrap();
        let err = ControlServer::bind(&path, supervisor(&dir))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn log_requires_a_task_name() {
        let dir = TempDir::new().unwrap();
        let response = dispatch(
            &supervisor(&dir),
            Request::Log {
                name: String::new(),
                count: None,
            },
        )
        .await;
        assert_eq!(response.lines, vec!["task name cannot be empty"]);
        assert!(response.tasks.is_empty());
    }
}
