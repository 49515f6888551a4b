//! Task log sinks.
//!
//! Every supervised run gets a [`LogSink`] from the daemon's [`LogStore`].
//! The sink receives the task's combined stdout/stderr line by line; its
//! [`identity`](LogSink::identity) is a file path that stays readable through
//! [`LogStore::tail`] after the sink itself has been closed and dropped.

use chrono::Local;
use log::{debug, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Append target for one run of one task.
pub trait LogSink: Send + Sync {
    /// Append one line (without trailing newline).
    fn write_line(&self, line: &str) -> io::Result<()>;
    /// Flush and release the target. Idempotent; later writes are dropped.
    fn close(&self) -> io::Result<()>;
    /// Stable locator of the persisted log.
    fn identity(&self) -> &Path;
}

/// Allocates sinks and reads persisted logs back.
pub trait LogStore: Send + Sync {
    fn open(&self, task: &str) -> io::Result<Arc<dyn LogSink>>;
    /// Last `n` lines behind `identity`, oldest first.
    fn tail(&self, identity: &Path, n: usize) -> io::Result<Vec<String>>;
}

/// Size and age bounds for rotated log files.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub max_size: u64,
    pub max_backups: usize,
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            max_backups: 10,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// File-backed store: `<dir>/<task>.log`, rotated to `<task>.log.<timestamp>`.
pub struct FileLogStore {
    dir: PathBuf,
    policy: RotationPolicy,
    colored: bool,
}

impl FileLogStore {
    /// Create the store, making sure `dir` exists. Line prefixes are
    /// coloured when the daemon's stdout is a terminal.
    pub fn new(dir: impl Into<PathBuf>, policy: RotationPolicy) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            policy,
            colored: io::stdout().is_terminal(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LogStore for FileLogStore {
    fn open(&self, task: &str) -> io::Result<Arc<dyn LogSink>> {
        let path = self.dir.join(format!("{}.log", file_stem(task)));
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        let color = self
            .colored
            .then(|| rand::thread_rng().gen_range(1..=231u8));

        debug!("Opened log sink {} for task {}", path.display(), task);

        Ok(Arc::new(FileSink {
            task: task.to_string(),
            path,
            color,
            policy: self.policy.clone(),
            active: Mutex::new(Some(ActiveFile { file, size })),
        }))
    }

    fn tail(&self, identity: &Path, n: usize) -> io::Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut lines = tail_file(identity, n)?;
        if lines.len() < n {
            if let Some(backup) = backups(identity)?.pop() {
                let mut older = tail_file(&backup, n - lines.len())?;
                older.extend(lines);
                lines = older;
            }
        }
        Ok(lines.into())
    }
}

struct ActiveFile {
    file: File,
    size: u64,
}

struct FileSink {
    task: String,
    path: PathBuf,
    color: Option<u8>,
    policy: RotationPolicy,
    active: Mutex<Option<ActiveFile>>,
}

impl FileSink {
    fn prefix(&self) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        match self.color {
            Some(code) => format!("\x1b[38;5;{code}m{now} {} | \x1b[0m", self.task),
            None => format!("{now} {} | ", self.task),
        }
    }

    fn rotate(&self, active: &mut ActiveFile) -> io::Result<()> {
        active.file.flush()?;

        let stamp = Local::now().format("%Y%m%dT%H%M%S%.9f");
        let mut backup = backup_path(&self.path, &stamp.to_string());
        let mut n = 1;
        while backup.exists() {
            backup = backup_path(&self.path, &format!("{stamp}-{n}"));
            n += 1;
        }

        fs::rename(&self.path, &backup)?;
        debug!("Rotated {} to {}", self.path.display(), backup.display());

        active.file = open_append(&self.path)?;
        active.size = 0;

        if let Err(e) = prune_backups(&self.path, &self.policy) {
            warn!("Failed to prune old logs of task {}: {}", self.task, e);
        }
        Ok(())
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(active) = guard.as_mut() else {
            return Ok(());
        };

        let entry = format!("{}{}\n", self.prefix(), line);
        let len = entry.len() as u64;
        if active.size > 0 && active.size + len > self.policy.max_size {
            self.rotate(active)?;
        }

        active.file.write_all(entry.as_bytes())?;
        active.size += len;
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        let taken = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some(mut active) => active.file.flush(),
            None => Ok(()),
        }
    }

    fn identity(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Task names come from user procfiles; keep them inside the log directory.
fn file_stem(task: &str) -> String {
    task.chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect()
}

fn backup_path(current: &Path, suffix: &str) -> PathBuf {
    let mut name = current.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Rotated files of `current`, oldest first.
fn backups(current: &Path) -> io::Result<Vec<PathBuf>> {
    let (Some(dir), Some(name)) = (current.parent(), current.file_name()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", name.to_string_lossy());

    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        // Backup suffixes are timestamps; `web.log.log` belongs to another task.
        let is_backup = file_name
            .to_string_lossy()
            .strip_prefix(&prefix)
            .is_some_and(|suffix| suffix.starts_with(|c: char| c.is_ascii_digit()));
        if is_backup {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn prune_backups(current: &Path, policy: &RotationPolicy) -> io::Result<()> {
    let mut found = backups(current)?;
    let excess = found.len().saturating_sub(policy.max_backups);
    for old in found.drain(..excess) {
        fs::remove_file(old)?;
    }

    let now = SystemTime::now();
    for backup in found {
        let modified = fs::metadata(&backup)?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > policy.max_age {
            fs::remove_file(backup)?;
        }
    }
    Ok(())
}

fn tail_file(path: &Path, n: usize) -> io::Result<VecDeque<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = VecDeque::with_capacity(n);
    for line in reader.split(b'\n') {
        let line = line?;
        if lines.len() == n {
            lines.pop_front();
        }
        lines.push_back(String::from_utf8_lossy(&line).into_owned());
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, policy: RotationPolicy) -> FileLogStore {
        let mut store = FileLogStore::new(dir.path(), policy).unwrap();
        store.colored = false;
        store
    }

    #[test]
    fn tail_returns_last_lines_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, RotationPolicy::default());
        let sink = store.open("web").unwrap();

        for i in 0..5 {
            sink.write_line(&format!("line-{i}")).unwrap();
        }

        let lines = store.tail(sink.identity(), 2).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("web | line-3"));
        assert!(lines[1].ends_with("web | line-4"));
    }

    #[test]
    fn tail_reads_persisted_log_after_sink_is_gone() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, RotationPolicy::default());
        let sink = store.open("worker").unwrap();
        sink.write_line("hello").unwrap();
        sink.close().unwrap();

        let identity = sink.identity().to_path_buf();
        drop(sink);

        let lines = store.tail(&identity, 200).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("| hello"));
    }

    #[test]
    fn writes_after_close_are_dropped() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, RotationPolicy::default());
        let sink = store.open("web").unwrap();
        sink.write_line("before").unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        sink.write_line("after").unwrap();

        let lines = store.tail(sink.identity(), 10).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("before"));
    }

    #[test]
    fn rotates_and_tails_across_backup() {
        let dir = TempDir::new().unwrap();
        let store = store(
            &dir,
            RotationPolicy {
                max_size: 64,
                max_backups: 2,
                ..RotationPolicy::default()
            },
        );
        let sink = store.open("t").unwrap();
        for i in 0..10 {
            sink.write_line(&format!("line-{i}")).unwrap();
        }

        let rotated = backups(sink.identity()).unwrap();
        assert_eq!(rotated.len(), 2);

        let lines = store.tail(sink.identity(), 3).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("line-7"));
        assert!(lines[1].ends_with("line-8"));
        assert!(lines[2].ends_with("line-9"));
    }

    #[test]
    fn colored_prefix_wraps_timestamp_and_name() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, RotationPolicy::default());
        store.colored = true;
        let sink = store.open("web").unwrap();
        sink.write_line("hi").unwrap();

        let lines = store.tail(sink.identity(), 1).unwrap();
        assert!(lines[0].starts_with("\x1b[38;5;"));
        assert!(lines[0].ends_with("web | \x1b[0mhi"));
    }

    #[test]
    fn task_names_stay_inside_log_dir() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, RotationPolicy::default());
        let sink = store.open("../escape").unwrap();
        assert_eq!(sink.identity().parent(), Some(dir.path()));
    }
}
