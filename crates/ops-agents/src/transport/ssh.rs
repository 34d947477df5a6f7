//! Remote transport over the system `ssh` client.
//!
//! Runs every command as `ssh <opts> user@host -- sh -c '<quoted>'` in
//! batch mode (no password prompts). The openssh client reserves exit
//! code 255 for its own failures, which maps onto the transport's
//! `connection_error` class.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use oversight::{ExecError, ExecOutcome, RemoteShell};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::quote::remote_invocation;

/// Connection coordinates for one managed host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SshShell {
    target: SshTarget,
}

impl SshShell {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    /// Base ssh argument vector, before the remote command.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.target.connect_timeout.as_secs()),
            "-p".to_string(),
            self.target.port.to_string(),
        ];
        if let Some(identity) = &self.target.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.target.user, self.target.host));
        args.push("--".to_string());
        args
    }

    async fn run(&self, remote: &str, timeout: Duration) -> Result<ExecOutcome, ExecError> {
        let started = Instant::now();
        let mut args = self.base_args();
        args.push(remote.to_string());

        let child = tokio::process::Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                seconds: timeout.as_secs(),
            })??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // 255 is ssh itself failing (unreachable host, auth refused),
        // not the remote command.
        if exit_code == 255 {
            return Err(ExecError::Connection(stderr.trim().to_string()));
        }

        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(&self) -> Result<(), ExecError> {
        info!(
            host = %self.target.host,
            user = %self.target.user,
            "probing ssh connectivity"
        );
        self.run("true", self.target.connect_timeout + Duration::from_secs(5))
            .await?;
        Ok(())
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutcome, ExecError> {
        debug!(host = %self.target.host, command, "executing over ssh");
        self.run(&remote_invocation(command), timeout).await
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        // Each command runs over its own connection; nothing to tear down.
        Ok(())
    }
}
