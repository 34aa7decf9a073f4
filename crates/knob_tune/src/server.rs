//! Control of the target server process.
//!
//! Restarts go through `pg_ctl` against the server's data directory. The
//! override file is `postgresql.auto.conf`, which `ALTER SYSTEM` writes and
//! which can keep the server from starting when it holds a bad value.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;

/// File written by `ALTER SYSTEM` inside the data directory.
pub const OVERRIDE_FILE_NAME: &str = "postgresql.auto.conf";

/// Stop/start and override-file operations on one server instance.
pub trait ServerControl: Send + Sync {
    fn stop(&self) -> anyhow::Result<()>;

    fn start(&self) -> anyhow::Result<()>;

    /// Deletes the override file. Returns `false` when there was nothing to delete.
    fn remove_override_file(&self) -> anyhow::Result<bool>;
}

/// [`ServerControl`] backed by the `pg_ctl` binary on the local host.
#[derive(Debug, Clone)]
pub struct PgCtlServer {
    pg_ctl: PathBuf,
    data_dir: PathBuf,
}

impl PgCtlServer {
    pub fn new(pg_ctl: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            pg_ctl: pg_ctl.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn override_file(&self) -> PathBuf {
        self.data_dir.join(OVERRIDE_FILE_NAME)
    }

    fn server_log(&self) -> PathBuf {
        self.data_dir.join("knob_tune_server.log")
    }

    fn run_pg_ctl(&self, action: &str, extra: &[&str]) -> anyhow::Result<()> {
        let output = Command::new(&self.pg_ctl)
            .arg("-D")
            .arg(&self.data_dir)
            .args(extra)
            .arg(action)
            .output()
            .with_context(|| format!("spawn {} {action}", self.pg_ctl.display()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "pg_ctl {action} exited with {}: {}",
            output.status,
            stderr.trim()
        )
    }
}

impl ServerControl for PgCtlServer {
    fn stop(&self) -> anyhow::Result<()> {
        tracing::info!(data_dir = %self.data_dir.display(), "stopping server");
        self.run_pg_ctl("stop", &["-w", "-m", "fast"])
    }

    fn start(&self) -> anyhow::Result<()> {
        tracing::info!(data_dir = %self.data_dir.display(), "starting server");
        let log = self.server_log();
        let log = log.to_string_lossy();
        self.run_pg_ctl("start", &["-w", "-l", log.as_ref()])
    }

    fn remove_override_file(&self) -> anyhow::Result<bool> {
        remove_file_if_present(&self.override_file())
    }
}

/// Removes `path`, treating a missing file as success.
pub fn remove_file_if_present(path: &Path) -> anyhow::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::warn!(path = %path.display(), "removed override file");
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
