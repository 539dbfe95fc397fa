//! nft-driver - Transaction driver for the `nft` binary
//!
//! Provides the thin layer between a table reconciler and the kernel:
//! - Building an ordered batch of nftables operations ([`Transaction`])
//! - Submitting the batch atomically via `nft -f -`
//! - Listing chains and rules back out of the kernel via `nft --json`
//!
//! The driver never interprets rule bodies; it moves opaque text fragments
//! and reads back only the fields the reconciler needs (comment, handle).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

mod cli;
mod tx;

pub use cli::{ListedRule, NftCli};
pub use tx::{BaseChainSpec, ChainType, HookPoint, Rule, Transaction};

/// Errors surfaced by the driver.  Transient kernel failures show up as
/// `Command`; the caller owns any retry policy.
#[derive(Debug, Error)]
pub enum NftError {
    #[error("nft binary not found on PATH")]
    NotFound,
    #[error("failed to execute nft: {0}")]
    Exec(#[from] std::io::Error),
    #[error("nft exited with code {code:?}: {stderr}")]
    Command { code: Option<i32>, stderr: String },
    #[error("unparseable nft json output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Address family of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ip,
    Ip6,
}

impl Family {
    pub fn from_ip_version(ip_version: u8) -> Family {
        if ip_version == 6 {
            Family::Ip6
        } else {
            Family::Ip
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The interface a table reconciler programs the kernel through.  The real
/// implementation is [`NftCli`]; tests substitute an in-memory kernel model.
#[async_trait]
pub trait NftBackend: Send + Sync {
    /// Start an empty transaction against this backend's table.
    fn new_transaction(&self) -> Transaction;

    /// Submit the transaction as one atomic batch.
    async fn run(&self, tx: &Transaction) -> Result<(), NftError>;

    /// Names of all chains currently in the table.
    async fn list_chains(&self) -> Result<Vec<String>, NftError>;

    /// Rules currently in the given chain, in order.
    async fn list_rules(&self, chain: &str) -> Result<Vec<ListedRule>, NftError>;
}

/// Captured output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Subprocess shim.  Lets tests intercept every external command the driver
/// (or a diagnostic path) would run.
#[async_trait]
pub trait CmdRunner: Send + Sync {
    async fn run_command(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<String>,
    ) -> std::io::Result<CmdOutput>;

    /// Resolve a bare program name against PATH.
    fn look_path(&self, name: &str) -> Option<PathBuf>;
}

/// The real subprocess runner.
pub struct RealCmd;

#[async_trait]
impl CmdRunner for RealCmd {
    async fn run_command(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<String>,
    ) -> std::io::Result<CmdOutput> {
        debug!(program = %program.display(), ?args, "Running command");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                // Dropping the pipe closes it so nft sees EOF.
            }
        }
        let output = child.wait_with_output().await?;
        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn look_path(&self, name: &str) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

/// Convenience for sharing a runner between the driver and callers that need
/// their own subprocess access (diagnostics).
pub fn real_cmd_runner() -> Arc<dyn CmdRunner> {
    Arc::new(RealCmd)
}
