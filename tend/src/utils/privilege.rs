//! Privilege and environment setup for task processes.
//!
//! [`ProcessConfig::resolve`] turns a [`TaskSpec`] into the attributes the
//! child process runs with; [`ProcessConfig::command`] applies them to a
//! command. Every command of a task (setup commands and the main command)
//! is built from the same config.

use crate::error::PrivilegeError;
use crate::spec::TaskSpec;
use nix::unistd::{self, Gid, Group, Uid, User};
use std::ffi::{CStr, CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};
use tokio::process::Command;

const HOME: &str = "HOME";

/// OS-level attributes of a task's processes.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    uid: Uid,
    gid: Gid,
    /// Whether uid/gid differ from the daemon's effective credential.
    switch_credentials: bool,
    chroot: Option<CString>,
    dir: Option<CString>,
    env: Vec<(OsString, OsString)>,
}

impl ProcessConfig {
    /// Derive process attributes from `spec` on top of the daemon
    /// environment `base_env`.
    ///
    /// The credential defaults to the daemon's effective uid/gid. A `user`
    /// sets uid, gid and `HOME`; a `group` overrides the gid.
    pub fn resolve<I>(spec: &TaskSpec, base_env: I) -> Result<Self, PrivilegeError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let euid = Uid::effective();
        let egid = Gid::effective();
        let mut uid = euid;
        let mut gid = egid;
        let mut home = None;

        if let Some(name) = &spec.user {
            let user = User::from_name(name)
                .map_err(|source| PrivilegeError::Lookup {
                    task: spec.name.clone(),
                    source,
                })?
                .ok_or_else(|| PrivilegeError::UnknownUser {
                    task: spec.name.clone(),
                    user: name.clone(),
                })?;
            uid = user.uid;
            gid = user.gid;
            home = Some(user.dir);
        }

        if let Some(name) = &spec.group {
            let group = Group::from_name(name)
                .map_err(|source| PrivilegeError::Lookup {
                    task: spec.name.clone(),
                    source,
                })?
                .ok_or_else(|| PrivilegeError::UnknownGroup {
                    task: spec.name.clone(),
                    group: name.clone(),
                })?;
            gid = group.gid;
        }

        Ok(Self {
            uid,
            gid,
            switch_credentials: uid != euid || gid != egid,
            chroot: c_path(&spec.name, spec.chroot.as_deref())?,
            dir: c_path(&spec.name, spec.dir.as_deref())?,
            env: compose_env(base_env, &spec.env, home.as_deref()),
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Value of `key` in the final environment.
    pub fn env_var(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    /// Build a command for `argv` running with these attributes, in its own
    /// process group, with stdin closed.
    pub fn command(&self, argv: &[String]) -> io::Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut cmd = process::Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .process_group(0);

        if self.chroot.is_none() && !self.switch_credentials {
            if let Some(dir) = &self.dir {
                cmd.current_dir(OsStr::from_bytes(dir.as_bytes()));
            }
            return Ok(Command::from(cmd));
        }

        let chroot = self.chroot.clone();
        let dir = self.dir.clone();
        let credentials = self.switch_credentials.then_some(Credentials {
            uid: self.uid,
            gid: self.gid,
            drop_groups: Uid::effective().is_root(),
        });

        // SAFETY: the closure runs in the forked child before exec and only
        // makes async-signal-safe syscalls on data prepared in the parent.
        unsafe {
            cmd.pre_exec(move || enter(chroot.as_deref(), dir.as_deref(), credentials));
        }

        Ok(Command::from(cmd))
    }
}

#[derive(Debug, Clone, Copy)]
struct Credentials {
    uid: Uid,
    gid: Gid,
    drop_groups: bool,
}

/// Runs in the child: chroot, chdir, then drop to the task credential.
fn enter(chroot: Option<&CStr>, dir: Option<&CStr>, credentials: Option<Credentials>) -> io::Result<()> {
    if let Some(root) = chroot {
        unistd::chroot(root)?;
        if dir.is_none() {
            unistd::chdir(c"/")?;
        }
    }

    if let Some(dir) = dir {
        unistd::chdir(dir)?;
    }

    if let Some(creds) = credentials {
        if creds.drop_groups {
            unistd::setgroups(&[creds.gid])?;
        }
        unistd::setgid(creds.gid)?;
        unistd::setuid(creds.uid)?;
    }

    Ok(())
}

fn c_path(task: &str, path: Option<&Path>) -> Result<Option<CString>, PrivilegeError> {
    path.map(|p| {
        CString::new(p.as_os_str().as_bytes()).map_err(|_| PrivilegeError::InvalidPath {
            task: task.to_string(),
            path: p.to_path_buf(),
        })
    })
    .transpose()
}

/// `base` without `HOME`, then `extra` (`KEY=VALUE`), then `HOME=<home>`.
/// A later key replaces an earlier one.
fn compose_env<I>(base: I, extra: &[String], home: Option<&Path>) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = base.into_iter().filter(|(k, _)| k != HOME).collect();

    for entry in extra {
        if let Some((key, value)) = entry.split_once('=') {
            upsert(&mut env, OsString::from(key), OsString::from(value));
        }
    }

    if let Some(home) = home {
        upsert(&mut env, OsString::from(HOME), PathBuf::from(home).into_os_string());
    }

    env
}

fn upsert(env: &mut Vec<(OsString, OsString)>, key: OsString, value: OsString) {
    env.retain(|(k, _)| *k != key);
    env.push((key, value));
}
