use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;

/// Drives the built posixprobe binary as a black box and judges it by
/// exit status, exactly the way an outer test runner would.
pub struct ProbeHarness {
    binary: PathBuf,
    temp_dir: TempDir,
}

impl ProbeHarness {
    pub fn new() -> Result<Self> {
        Ok(Self {
            binary: PathBuf::from(env!("CARGO_BIN_EXE_posixprobe")),
            temp_dir: TempDir::new().context("failed to create temporary directory")?,
        })
    }

    /// Temporary directory for per-test files
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Command builder for callers that need extra setup (pre_exec etc.)
    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Runs the binary with the given arguments and waits with a generous
    /// bound; a hang is a failure of the probes, not of this harness.
    pub async fn run(&self, args: &[&str]) -> Result<ExitStatus> {
        let mut child = self
            .command(args)
            .spawn()
            .context("failed to spawn posixprobe")?;
        Self::wait_bounded(&mut child, args).await
    }

    pub async fn wait_bounded(
        child: &mut tokio::process::Child,
        args: &[&str],
    ) -> Result<ExitStatus> {
        match timeout(Duration::from_secs(60), child.wait()).await {
            Ok(status) => status.context("wait for posixprobe failed"),
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!("posixprobe {:?} did not exit within 60s", args)
            }
        }
    }
}
