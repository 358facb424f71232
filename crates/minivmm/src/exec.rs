//! Privileged shell invocation driver.
//!
//! Every external command (`ip`, `qemu-img`, `genisoimage`,
//! `qemu-system-*`) goes through this one choke point so tests can inject a
//! fake executor instead of mocking at call sites.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        ExecOutput {
            status_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        ExecOutput {
            status_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn output(&self, argv: &[String]) -> std::io::Result<ExecOutput>;
}

/// Runs commands on the host via `tokio::process`.
pub struct HostExecutor;

#[async_trait]
impl Executor for HostExecutor {
    async fn output(&self, argv: &[String]) -> std::io::Result<ExecOutput> {
        let (cmd, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv")
        })?;
        let out = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(ExecOutput {
            status_code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }
}

#[derive(Clone)]
pub struct Exec {
    executor: Arc<dyn Executor>,
}

impl Exec {
    pub fn host() -> Self {
        Exec {
            executor: Arc::new(HostExecutor),
        }
    }

    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Exec { executor }
    }

    /// Run a command; non-zero exit (or a spawn failure) is `Upstream`.
    /// Returns captured stdout.
    pub async fn run<S: AsRef<str>>(&self, argv: &[S]) -> Result<String> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        let joined = argv.join(" ");
        debug!(cmd = %joined, "exec");

        let out = self
            .executor
            .output(&argv)
            .await
            .map_err(|e| Error::upstream(format!("spawn '{joined}'"), e))?;

        if !out.success() {
            let code = out.status_code.unwrap_or(-1);
            return Err(Error::upstream(
                format!("'{joined}' exited with {code}"),
                anyhow::anyhow!("{}", out.stderr.trim().to_string()),
            ));
        }
        Ok(out.stdout)
    }

    /// Run a batch of commands, logging failures and carrying on. Used
    /// where partial host state must not abort a repeated bring-up.
    pub async fn run_all_ignore_errors(&self, cmds: &[Vec<String>]) {
        for cmd in cmds {
            if let Err(e) = self.run(cmd).await {
                warn!(error = %e, "ignoring failed command");
            }
        }
    }

    /// Exit-code existence probe: true iff the command ran and exited 0.
    pub async fn probe<S: AsRef<str>>(&self, argv: &[S]) -> bool {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        match self.executor.output(&argv).await {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }
}

pub fn argv<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|s| s.as_ref().to_string()).collect()
}
