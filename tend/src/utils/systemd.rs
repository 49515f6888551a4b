//! Install and control the daemon as a systemd service.

use anyhow::{Result, anyhow};
use log::info;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const UNIT_NAME: &str = "tend.service";
const UNIT_DIR: &str = "/etc/systemd/system";

fn unit_path() -> PathBuf {
    Path::new(UNIT_DIR).join(UNIT_NAME)
}

/// Render the unit file running `exe daemon` with the given paths.
pub fn unit_file(exe: &Path, socket: &Path, log_dir: &Path) -> String {
    format!(
        "[Unit]
Description=tend process supervisor
After=network.target

[Service]
Type=simple
ExecStart={exe} --socket {socket} --log-dir {log_dir} daemon
KillSignal=SIGTERM
Restart=on-failure

[Install]
WantedBy=multi-user.target
",
        exe = exe.display(),
        socket = socket.display(),
        log_dir = log_dir.display(),
    )
}

async fn systemctl(args: &[&str]) -> Result<String> {
    let output = Command::new("systemctl").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "systemctl {} failed: {}",
            args.join(" "),
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub async fn install(socket: &Path, log_dir: &Path) -> Result<String> {
    let path = unit_path();
    if path.exists() {
        return Err(anyhow!("{} is already installed", UNIT_NAME));
    }

    let exe = std::env::current_exe()?;
    tokio::fs::write(&path, unit_file(&exe, socket, log_dir)).await?;
    info!("Wrote {}", path.display());

    systemctl(&["daemon-reload"]).await?;
    systemctl(&["enable", UNIT_NAME]).await?;
    Ok(format!("{UNIT_NAME} installed"))
}

pub async fn remove() -> Result<String> {
    let path = unit_path();
    if !path.exists() {
        return Err(anyhow!("{} is not installed", UNIT_NAME));
    }

    systemctl(&["disable", "--now", UNIT_NAME]).await?;
    tokio::fs::remove_file(&path).await?;
    systemctl(&["daemon-reload"]).await?;
    Ok(format!("{UNIT_NAME} removed"))
}

pub async fn start() -> Result<String> {
    systemctl(&["start", UNIT_NAME]).await?;
    Ok(format!("{UNIT_NAME} started"))
}

pub async fn stop() -> Result<String> {
    systemctl(&["stop", UNIT_NAME]).await?;
    Ok(format!("{UNIT_NAME} stopped"))
}

/// `systemctl is-active` exits non-zero for inactive units, so the state
/// string is reported rather than treated as a failure.
pub async fn status() -> Result<String> {
    let output = Command::new("systemctl")
        .args(["is-active", UNIT_NAME])
        .output()
        .await?;
    let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(format!("{UNIT_NAME} is {state}"))
}
