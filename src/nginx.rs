//! Validation, backup, and hot-reload of the external nginx process
//!
//! The apply cycle is render -> validate -> backup -> write -> reload, each
//! step short-circuiting on failure. Nothing here panics past the orchestrator
//! boundary: callers always receive a success flag and a message.

use crate::db::Database;
use crate::render;
use anyhow::{Context, Result};
use chrono::Utc;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Outcome of a publish cycle or one of its subprocess steps
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Drives the external nginx binary: syntax checks, reloads, and the full
/// backup-and-apply cycle.
pub struct NginxManager {
    binary: String,
    config_path: PathBuf,
    backup_dir: PathBuf,
    timeout: Duration,
}

impl NginxManager {
    pub fn new(config: &crate::config::NginxConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            config_path: config.config_path.clone(),
            backup_dir: config.backup_dir.clone(),
            timeout: config.subprocess_timeout(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Whether the configured binary resolves to a file, either directly or
    /// via PATH lookup. Used for health reporting only; invocation errors are
    /// still handled per call.
    pub fn binary_available(&self) -> bool {
        let path = Path::new(&self.binary);
        if path.components().count() > 1 {
            return path.is_file();
        }
        std::env::var_os("PATH")
            .map(|dirs| std::env::split_paths(&dirs).any(|dir| dir.join(&self.binary).is_file()))
            .unwrap_or(false)
    }

    /// Syntax-check a candidate configuration with `nginx -t -c <tempfile>`.
    ///
    /// The candidate is written next to the live config with a `.test`
    /// suffix and removed afterward regardless of outcome. Binary-not-found,
    /// timeout, and nonzero exit all come back as a failed Outcome, never as
    /// an error.
    pub async fn validate_config(&self, content: &str) -> Outcome {
        let temp_path = self.test_file_path();

        if let Some(parent) = temp_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Outcome::fail(format!("Failed to create config directory: {}", e));
            }
        }
        if let Err(e) = tokio::fs::write(&temp_path, content).await {
            return Outcome::fail(format!("Failed to write test config: {}", e));
        }

        let outcome = self
            .run_nginx(&["-t", "-c", &temp_path.to_string_lossy()], "validation")
            .await;

        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            warn!(path = %temp_path.display(), error = %e, "Failed to remove test config");
        }

        if outcome.success {
            Outcome::ok("Configuration valid")
        } else {
            outcome
        }
    }

    /// Ask the running nginx process to re-read its configuration without
    /// dropping connections. There is no rollback: a reload that exits zero
    /// but misbehaves at runtime is invisible here.
    pub async fn reload(&self) -> Outcome {
        let outcome = self.run_nginx(&["-s", "reload"], "reload").await;
        if outcome.success {
            info!("nginx reloaded");
            Outcome::ok("nginx reloaded")
        } else {
            outcome
        }
    }

    /// Perform the full publish cycle for the current desired state and
    /// report one combined outcome.
    pub async fn apply(&self, db: &Database) -> Outcome {
        info!("Generating nginx configuration");
        let snapshot = match render::build_snapshot(db) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Failed to read desired state");
                return Outcome::fail(format!("Render failed: {}", e));
            }
        };
        let content = render::render_config(&snapshot, Utc::now());

        info!("Validating configuration syntax");
        let validation = self.validate_config(&content).await;
        if !validation.success {
            return Outcome::fail(format!("Validation failed: {}", validation.message));
        }

        // Best-effort copy of the previous live config; the original stays
        // in place so a later write failure does not lose it.
        if self.config_path.exists() {
            if let Err(e) = self.backup_current().await {
                error!(error = %e, "Failed to back up current config");
                return Outcome::fail(format!("Backup failed: {}", e));
            }
        }

        info!(path = %self.config_path.display(), "Writing new config");
        if let Err(e) = self.write_live(&content).await {
            error!(error = %e, "Failed to write config");
            return Outcome::fail(format!("Write failed: {}", e));
        }

        info!("Reloading nginx");
        let reload = self.reload().await;
        if !reload.success {
            // The new file is already live on disk; the process has not
            // picked it up. Inconsistent until a later successful reload.
            error!(message = %reload.message, "Reload failed");
            return Outcome::fail(format!("Reload failed: {}", reload.message));
        }

        info!("Configuration applied");
        Outcome::ok("Configuration applied and nginx reloaded")
    }

    /// Copy the live config into the backup directory under a UTC-stamped name
    async fn backup_current(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.backup_dir.display()))?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = self.backup_dir.join(format!("nginx.conf.{}", stamp));
        tokio::fs::copy(&self.config_path, &backup_path)
            .await
            .with_context(|| format!("Failed to copy to {}", backup_path.display()))?;

        info!(path = %backup_path.display(), "Backed up current config");
        Ok(())
    }

    async fn write_live(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&self.config_path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;
        Ok(())
    }

    /// Sibling of the live config with a fixed `.test` suffix. Predictable,
    /// so two concurrent validations can collide (known narrow race).
    fn test_file_path(&self) -> PathBuf {
        let mut os: OsString = self.config_path.as_os_str().to_owned();
        os.push(".test");
        PathBuf::from(os)
    }

    /// Run the nginx binary with a bounded timeout, interpreting only the
    /// exit code and captured output.
    async fn run_nginx(&self, args: &[&str], what: &str) -> Outcome {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = tokio::time::timeout(self.timeout, cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                if output.status.success() {
                    Outcome::ok("")
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let message = if stderr.trim().is_empty() {
                        format!("nginx {} exited with {}", what, output.status)
                    } else {
                        stderr.trim().to_string()
                    };
                    Outcome::fail(message)
                }
            }
            Ok(Err(e)) => Outcome::fail(format!("Failed to run {}: {}", self.binary, e)),
            Err(_) => Outcome::fail(format!(
                "{} timed out after {}s",
                what,
                self.timeout.as_secs()
            )),
        }
    }
}
