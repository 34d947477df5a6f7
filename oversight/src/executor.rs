//! Subtask execution: per command Validate → Execute → Observe →
//! (Autocorrect → retry) → record to the tracker.
//!
//! The executor never decides escalation — it records faithfully and
//! returns; the coordinator queries the tracker and the escalation
//! system after every failure.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autocorrect::{AutocorrectionEngine, CorrectionKind, Failure};
use crate::config::PolicyConfig;
use crate::health::{AggregateReport, CheckConfig, CheckStatus, HealthChecker};
use crate::shell::{ExecError, ExecOutcome, RemoteShell};
use crate::task::Subtask;
use crate::tracker::{AttemptOutcome, ErrorTracker};
use crate::validator::{CommandValidator, ValidationContext};

/// Ambient execution settings for one subtask run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    pub dry_run: bool,
    /// Permit commands the validator flags as destructive-with-confirmation.
    pub allow_destructive: bool,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            dry_run: false,
            allow_destructive: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of driving a single command (including its retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub original_command: String,
    /// The command string that actually ran last (after corrections).
    pub executed_command: String,
    pub attempts: u32,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
    pub duration: Duration,
    pub autocorrection_used: bool,
    pub rejected_by_validator: bool,
    pub cancelled: bool,
}

/// Result of one subtask run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask_id: String,
    pub step_id: String,
    pub success: bool,
    pub command_results: Vec<CommandOutcome>,
    pub health: Option<AggregateReport>,
    pub rollback_performed: bool,
    /// Errors recorded against the step during this run.
    pub error_count: u32,
    pub autocorrections_applied: u32,
    pub duration: Duration,
    pub cancelled: bool,
}

/// Drives subtasks through the safety gate, the shell, and the ledger.
pub struct SubtaskExecutor {
    validator: Arc<CommandValidator>,
    tracker: Arc<ErrorTracker>,
    autocorrect: Arc<AutocorrectionEngine>,
    health: Arc<HealthChecker>,
    config: PolicyConfig,
}

impl SubtaskExecutor {
    pub fn new(
        validator: Arc<CommandValidator>,
        tracker: Arc<ErrorTracker>,
        autocorrect: Arc<AutocorrectionEngine>,
        health: Arc<HealthChecker>,
        config: PolicyConfig,
    ) -> Self {
        Self {
            validator,
            tracker,
            autocorrect,
            health,
            config,
        }
    }

    pub async fn execute_subtask(
        &self,
        shell: &dyn RemoteShell,
        subtask: &Subtask,
        ctx: &ExecutionContext,
    ) -> SubtaskResult {
        let started = std::time::Instant::now();
        let step_id = subtask.step_id.clone();
        let mut result = SubtaskResult {
            subtask_id: subtask.id.clone(),
            step_id: step_id.clone(),
            success: true,
            command_results: Vec::new(),
            health: None,
            rollback_performed: false,
            error_count: 0,
            autocorrections_applied: 0,
            duration: Duration::ZERO,
            cancelled: false,
        };
        // Whether a mutating command actually ran against the host.
        let mut mutated = false;

        for command in &subtask.commands {
            if ctx.cancel.is_cancelled() {
                // Remaining commands are skipped without records.
                result.cancelled = true;
                result.success = false;
                break;
            }

            let outcome = self
                .drive_command(shell, command, subtask, ctx, &mut result, &mut mutated)
                .await;

            let failed = !outcome.success;
            let was_cancelled = outcome.cancelled;
            result.command_results.push(outcome);

            if was_cancelled {
                result.cancelled = true;
                result.success = false;
                break;
            }
            if failed {
                result.success = false;
                break;
            }
        }

        if result.success && !subtask.health_checks.is_empty() {
            let report = self.run_health_checks(shell, subtask, ctx, &mut result).await;
            let health_failed = report.overall_status == CheckStatus::Failed;
            result.health = Some(report);
            if health_failed {
                result.success = false;
            }
        }

        if !result.success && mutated {
            if ctx.dry_run {
                info!(subtask_id = %subtask.id, "dry-run: rollback skipped");
            } else {
                self.rollback(shell, subtask).await;
                result.rollback_performed = !subtask.rollback_commands.is_empty();
            }
        }

        result.duration = started.elapsed();
        info!(
            subtask_id = %subtask.id,
            step_id = %step_id,
            success = result.success,
            errors = result.error_count,
            autocorrections = result.autocorrections_applied,
            "subtask finished"
        );
        result
    }

    /// One command through the full loop, retrying under the
    /// autocorrection budget.
    async fn drive_command(
        &self,
        shell: &dyn RemoteShell,
        command: &str,
        subtask: &Subtask,
        ctx: &ExecutionContext,
        result: &mut SubtaskResult,
        mutated: &mut bool,
    ) -> CommandOutcome {
        let step_id = &subtask.step_id;
        let vctx = ValidationContext {
            step_id: Some(step_id.clone()),
            task_id: Some(ctx.task_id.clone()),
        };

        let mut current = command.to_string();
        let mut attempts = 0u32;
        let mut autocorrection_used = false;
        let mut model_attempted = false;

        let max_attempts = if self.config.auto_correction_enabled {
            1 + self.config.max_retries_per_command
        } else {
            1
        };

        loop {
            attempts += 1;

            // 1. Validate. A rejected command is recorded but never run and
            //    never autocorrected.
            let report = self.validator.validate(&current, Some(&vctx));
            let refusal = if !report.valid {
                Some("forbidden")
            } else if report.requires_confirmation && !ctx.allow_destructive {
                Some("requires_confirmation")
            } else {
                None
            };
            if let Some(reason) = refusal {
                self.tracker.record_attempt(
                    step_id,
                    AttemptOutcome::failed(current.clone(), Duration::ZERO, None, reason)
                        .with_autocorrection(autocorrection_used)
                        .with_metadata(
                            "validator_errors",
                            serde_json::json!(report.errors),
                        ),
                );
                result.error_count += 1;
                return CommandOutcome {
                    original_command: command.to_string(),
                    executed_command: current.clone(),
                    attempts,
                    success: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error_message: Some(reason.to_string()),
                    duration: Duration::ZERO,
                    autocorrection_used,
                    rejected_by_validator: true,
                    cancelled: false,
                };
            }

            // 2. Execute (or simulate).
            let execution = if ctx.dry_run {
                Ok(ExecOutcome::simulated(&current))
            } else {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(ExecError::Cancelled),
                    r = shell.execute(&current, subtask.timeout) => r,
                }
            };

            // 3. Record and decide progression.
            match execution {
                Ok(outcome) if outcome.success() => {
                    if !ctx.dry_run {
                        *mutated = true;
                    }
                    self.tracker.record_attempt(
                        step_id,
                        AttemptOutcome::succeeded(
                            current.clone(),
                            outcome.duration,
                            outcome.exit_code,
                        )
                        .with_autocorrection(autocorrection_used),
                    );
                    debug!(step_id, command = %current, "command succeeded");
                    return CommandOutcome {
                        original_command: command.to_string(),
                        executed_command: current,
                        attempts,
                        success: true,
                        exit_code: Some(outcome.exit_code),
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        error_message: None,
                        duration: outcome.duration,
                        autocorrection_used,
                        rejected_by_validator: false,
                        cancelled: false,
                    };
                }
                Ok(outcome) => {
                    if !ctx.dry_run {
                        *mutated = true;
                    }
                    let message = outcome.error_message();
                    self.tracker.record_attempt(
                        step_id,
                        AttemptOutcome::failed(
                            current.clone(),
                            outcome.duration,
                            Some(outcome.exit_code),
                            message.clone(),
                        )
                        .with_autocorrection(autocorrection_used),
                    );
                    result.error_count += 1;

                    // 4. Autocorrect and re-enter validation.
                    if attempts < max_attempts {
                        let failure = Failure {
                            command: &current,
                            stderr: &outcome.stderr,
                            exit_code: Some(outcome.exit_code),
                        };
                        if let Some(correction) =
                            self.autocorrect.correct(&failure, !model_attempted).await
                        {
                            if correction.kind == CorrectionKind::ModelRewrite {
                                model_attempted = true;
                            }
                            info!(
                                step_id,
                                from = %current,
                                to = %correction.command,
                                kind = %correction.kind,
                                "autocorrection applied"
                            );
                            current = correction.command;
                            autocorrection_used = true;
                            result.autocorrections_applied += 1;
                            continue;
                        }
                    }

                    return CommandOutcome {
                        original_command: command.to_string(),
                        executed_command: current,
                        attempts,
                        success: false,
                        exit_code: Some(outcome.exit_code),
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        error_message: Some(message),
                        duration: outcome.duration,
                        autocorrection_used,
                        rejected_by_validator: false,
                        cancelled: false,
                    };
                }
                Err(ExecError::Cancelled) => {
                    // Counted as an error, never retried.
                    self.tracker.record_attempt(
                        step_id,
                        AttemptOutcome::failed(current.clone(), Duration::ZERO, None, "cancelled")
                            .with_autocorrection(autocorrection_used),
                    );
                    result.error_count += 1;
                    return CommandOutcome {
                        original_command: command.to_string(),
                        executed_command: current,
                        attempts,
                        success: false,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        error_message: Some("cancelled".to_string()),
                        duration: Duration::ZERO,
                        autocorrection_used,
                        rejected_by_validator: false,
                        cancelled: true,
                    };
                }
                Err(err) => {
                    let message = err.ledger_message();
                    self.tracker.record_attempt(
                        step_id,
                        AttemptOutcome::failed(
                            current.clone(),
                            Duration::ZERO,
                            None,
                            message.clone(),
                        )
                        .with_autocorrection(autocorrection_used),
                    );
                    result.error_count += 1;

                    if attempts < max_attempts {
                        let failure = Failure {
                            command: &current,
                            stderr: &message,
                            exit_code: None,
                        };
                        if let Some(correction) =
                            self.autocorrect.correct(&failure, !model_attempted).await
                        {
                            if correction.kind == CorrectionKind::ModelRewrite {
                                model_attempted = true;
                            }
                            current = correction.command;
                            autocorrection_used = true;
                            result.autocorrections_applied += 1;
                            continue;
                        }
                    }

                    return CommandOutcome {
                        original_command: command.to_string(),
                        executed_command: current,
                        attempts,
                        success: false,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        error_message: Some(message),
                        duration: Duration::ZERO,
                        autocorrection_used,
                        rejected_by_validator: false,
                        cancelled: false,
                    };
                }
            }
        }
    }

    async fn run_health_checks(
        &self,
        shell: &dyn RemoteShell,
        subtask: &Subtask,
        ctx: &ExecutionContext,
        result: &mut SubtaskResult,
    ) -> AggregateReport {
        let mut checks = Vec::with_capacity(subtask.health_checks.len());
        let config = CheckConfig {
            timeout: subtask.timeout,
            ..Default::default()
        };

        for command in &subtask.health_checks {
            let check = if ctx.dry_run {
                // Dry-run verification goes through the same simulated path
                // as execution.
                let sim = DryRunShell;
                self.health
                    .run_check(&sim, command, "general", Some(config.clone()))
                    .await
            } else {
                self.health
                    .run_check(shell, command, "general", Some(config.clone()))
                    .await
            };

            if check.status == CheckStatus::Failed && check.critical {
                self.tracker.record_error(
                    &subtask.step_id,
                    command,
                    &format!(
                        "health check failed: {}",
                        check.error.clone().unwrap_or_else(|| "unexpected output".into())
                    ),
                    check.exit_code,
                    false,
                    Default::default(),
                );
                result.error_count += 1;
            }
            checks.push(check);
        }

        HealthChecker::aggregate(&checks)
    }

    /// Run rollback commands in order, logging failures without recording
    /// them. Rollback is exempt from cancellation: once started it runs
    /// to the end of its list.
    async fn rollback(&self, shell: &dyn RemoteShell, subtask: &Subtask) {
        for command in &subtask.rollback_commands {
            warn!(subtask_id = %subtask.id, command, "running rollback command");
            match shell.execute(command, subtask.timeout).await {
                Ok(outcome) if outcome.success() => {}
                Ok(outcome) => warn!(
                    command,
                    exit_code = outcome.exit_code,
                    "rollback command failed"
                ),
                Err(e) => warn!(command, error = %e, "rollback command errored"),
            }
        }
    }
}

/// Shell stand-in for dry-run health checks.
struct DryRunShell;

#[async_trait::async_trait]
impl RemoteShell for DryRunShell {
    async fn connect(&self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn execute(&self, command: &str, _timeout: Duration) -> Result<ExecOutcome, ExecError> {
        Ok(ExecOutcome::simulated(command))
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        Ok(())
    }
}
