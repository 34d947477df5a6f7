//! Local subprocess transport: `sh -c` with a hard timeout.
//!
//! Used for single-host operation and as the reference transport in
//! tests. `kill_on_drop` makes cancellation safe: dropping the in-flight
//! future reaps the child.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use oversight::{ExecError, ExecOutcome, RemoteShell};
use tracing::debug;

pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteShell for LocalShell {
    async fn connect(&self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutcome, ExecError> {
        debug!(command, timeout_secs = timeout.as_secs(), "executing locally");
        let started = Instant::now();

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
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

        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: started.elapsed(),
        })
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let shell = LocalShell::new();
        let out = shell
            .execute("echo hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_outcome_not_an_error() {
        let shell = LocalShell::new();
        let out = shell
            .execute("echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn timeout_maps_to_typed_error() {
        let shell = LocalShell::new();
        let err = shell
            .execute("sleep 5", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert_eq!(err.ledger_message(), "timeout");
    }
}
