//! The remote-shell seam.
//!
//! The executor and health checker drive commands exclusively through
//! [`RemoteShell`]; concrete transports (local subprocess, ssh) live in the
//! agent crate. Implementations must be cancellation-safe: dropping the
//! future returned by `execute` must not leave the remote command
//! unreaped on our side of the transport.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What one remote command produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Wall-clock duration of the remote call.
    pub duration: Duration,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Simulated outcome used in dry-run mode.
    pub fn simulated(command: &str) -> Self {
        Self {
            stdout: format!("[dry-run] {command}"),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::ZERO,
        }
    }

    /// The failure-side message for the ledger: stderr if present,
    /// otherwise a generic exit-code description.
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("command exited with code {}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// Transport-level failures, distinct from non-zero exit codes.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("timeout")]
    Timeout { seconds: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("connection_error: {0}")]
    Connection(String),

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// The `error_message` recorded in the ledger for this failure.
    /// "timeout" and "connection_error" are exact strings; the severity
    /// taxonomy and the autocorrection rules key on them.
    pub fn ledger_message(&self) -> String {
        match self {
            Self::Timeout { .. } => "timeout".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::Connection(_) => "connection_error".to_string(),
            Self::Io(e) => format!("transport i/o error: {e}"),
        }
    }
}

/// A secure remote shell offering `Execute(cmd, timeout)`.
///
/// `connect` is called once by the coordinator at task start and
/// `disconnect` on every exit path, including cancellation.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self) -> Result<(), ExecError>;

    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutcome, ExecError>;

    async fn disconnect(&self) -> Result<(), ExecError>;
}
