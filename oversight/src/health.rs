//! Health checks: non-mutating commands whose outcome classifies a
//! subtask as passed / warning / failed.
//!
//! Outcome rule: wrong exit code → failed (retried until the budget is
//! spent); right exit code with no expected pattern → passed; pattern
//! match on stdout → passed; stdout containing "warning" → warning;
//! otherwise failed.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::shell::{ExecError, RemoteShell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Warning,
    Unknown,
}

/// Per-check-type configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub expected_exit_code: i32,
    /// Regex matched against stdout when the exit code is right.
    pub expected_output_pattern: Option<String>,
    /// A failed critical check demotes the whole subtask.
    pub critical: bool,
    pub description: String,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            expected_exit_code: 0,
            expected_output_pattern: None,
            critical: true,
            description: String::new(),
        }
    }
}

/// Result of one health check run (including retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_type: String,
    pub command: String,
    pub status: CheckStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub attempts: u32,
    pub critical: bool,
}

/// Aggregation over a subtask's checks: failed iff any critical check
/// failed; warning iff any non-critical failure or warning is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub overall_status: CheckStatus,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub critical_failures: usize,
    pub success_rate: f64,
}

/// Runs verification commands through the remote shell and classifies
/// the outcomes.
pub struct HealthChecker {
    configs: HashMap<String, CheckConfig>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            configs: Self::builtin_configs(),
        }
    }

    /// Named presets for the common verification shapes.
    fn builtin_configs() -> HashMap<String, CheckConfig> {
        let mut configs = HashMap::new();
        configs.insert(
            "system_running".to_string(),
            CheckConfig {
                timeout: Duration::from_secs(10),
                retry_count: 2,
                expected_output_pattern: Some(r"running|degraded".to_string()),
                description: "systemd overall state".to_string(),
                ..Default::default()
            },
        );
        configs.insert(
            "service_active".to_string(),
            CheckConfig {
                timeout: Duration::from_secs(15),
                retry_count: 3,
                expected_output_pattern: Some(r"active".to_string()),
                description: "service is active".to_string(),
                ..Default::default()
            },
        );
        configs.insert(
            "port_listening".to_string(),
            CheckConfig {
                timeout: Duration::from_secs(10),
                retry_count: 2,
                expected_output_pattern: Some(r"LISTEN".to_string()),
                description: "port is listening".to_string(),
                ..Default::default()
            },
        );
        configs.insert(
            "disk_space".to_string(),
            CheckConfig {
                timeout: Duration::from_secs(10),
                retry_count: 1,
                description: "disk usage below threshold".to_string(),
                ..Default::default()
            },
        );
        configs.insert(
            "memory_usage".to_string(),
            CheckConfig {
                timeout: Duration::from_secs(10),
                retry_count: 1,
                critical: false,
                description: "memory usage below threshold".to_string(),
                ..Default::default()
            },
        );
        configs.insert(
            "http_response".to_string(),
            CheckConfig {
                timeout: Duration::from_secs(30),
                retry_count: 3,
                expected_output_pattern: Some(r"^[23]\d\d".to_string()),
                description: "endpoint answers 2xx/3xx".to_string(),
                ..Default::default()
            },
        );
        configs
    }

    pub fn config_for(&self, check_type: &str) -> CheckConfig {
        self.configs.get(check_type).cloned().unwrap_or_default()
    }

    /// Run one check, retrying on failure until the retry budget is spent.
    pub async fn run_check(
        &self,
        shell: &dyn RemoteShell,
        command: &str,
        check_type: &str,
        config: Option<CheckConfig>,
    ) -> CheckResult {
        let config = config.unwrap_or_else(|| self.config_for(check_type));
        let started = std::time::Instant::now();
        let mut attempts = 0u32;
        let mut last: Option<CheckResult> = None;

        let max_attempts = config.retry_count.max(1);
        while attempts < max_attempts {
            attempts += 1;
            let result = self
                .run_once(shell, command, check_type, &config, attempts)
                .await;

            if result.status == CheckStatus::Passed || result.status == CheckStatus::Warning {
                return CheckResult {
                    duration: started.elapsed(),
                    attempts,
                    ..result
                };
            }
            last = Some(result);

            if attempts < max_attempts {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        let mut result = last.expect("at least one attempt ran");
        result.duration = started.elapsed();
        result.attempts = attempts;
        warn!(
            check_type,
            command,
            attempts,
            "health check failed after retries"
        );
        result
    }

    async fn run_once(
        &self,
        shell: &dyn RemoteShell,
        command: &str,
        check_type: &str,
        config: &CheckConfig,
        attempt: u32,
    ) -> CheckResult {
        debug!(check_type, command, attempt, "running health check");

        let base = CheckResult {
            check_type: check_type.to_string(),
            command: command.to_string(),
            status: CheckStatus::Unknown,
            output: None,
            error: None,
            exit_code: None,
            duration: Duration::ZERO,
            attempts: attempt,
            critical: config.critical,
        };

        match shell.execute(command, config.timeout).await {
            Ok(outcome) => {
                let status = classify(
                    outcome.exit_code,
                    &outcome.stdout,
                    config.expected_exit_code,
                    config.expected_output_pattern.as_deref(),
                );
                CheckResult {
                    status,
                    output: Some(outcome.stdout),
                    error: if outcome.stderr.is_empty() {
                        None
                    } else {
                        Some(outcome.stderr)
                    },
                    exit_code: Some(outcome.exit_code),
                    ..base
                }
            }
            Err(err) => CheckResult {
                status: match err {
                    ExecError::Cancelled => CheckStatus::Unknown,
                    _ => CheckStatus::Failed,
                },
                error: Some(err.ledger_message()),
                ..base
            },
        }
    }

    /// Aggregate a subtask's check results into one verdict.
    pub fn aggregate(results: &[CheckResult]) -> AggregateReport {
        let total = results.len();
        let passed = results.iter().filter(|r| r.status == CheckStatus::Passed).count();
        let warnings = results.iter().filter(|r| r.status == CheckStatus::Warning).count();
        let failed = results.iter().filter(|r| r.status == CheckStatus::Failed).count();
        let critical_failures = results
            .iter()
            .filter(|r| r.status == CheckStatus::Failed && r.critical)
            .count();

        let overall_status = if critical_failures > 0 {
            CheckStatus::Failed
        } else if failed > 0 || warnings > 0 {
            CheckStatus::Warning
        } else if total == 0 {
            CheckStatus::Unknown
        } else {
            CheckStatus::Passed
        };

        AggregateReport {
            overall_status,
            total,
            passed,
            failed,
            warnings,
            critical_failures,
            success_rate: if total == 0 {
                0.0
            } else {
                passed as f64 / total as f64 * 100.0
            },
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(
    exit_code: i32,
    stdout: &str,
    expected_exit_code: i32,
    expected_pattern: Option<&str>,
) -> CheckStatus {
    if exit_code != expected_exit_code {
        return CheckStatus::Failed;
    }
    let Some(pattern) = expected_pattern else {
        return CheckStatus::Passed;
    };
    match Regex::new(pattern) {
        Ok(re) if re.is_match(stdout) => CheckStatus::Passed,
        Ok(_) => {
            if stdout.to_lowercase().contains("warning") {
                CheckStatus::Warning
            } else {
                CheckStatus::Failed
            }
        }
        Err(_) => CheckStatus::Unknown,
    }
}
