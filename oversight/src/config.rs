//! Policy configuration shared by the deterministic components.
//!
//! Every knob that bounds retries, escalation, or retention lives here so
//! that the agent layer can load one struct, validate it once, and hand
//! clones to each component.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error returned when a configuration value is out of range.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {got}")]
    TooSmall {
        field: &'static str,
        min: u64,
        got: u64,
    },

    #[error("{field} must be at most {max}, got {got}")]
    TooLarge {
        field: &'static str,
        max: u64,
        got: u64,
    },

    #[error("human_escalation_threshold ({human}) must be >= error_threshold_per_step ({planner})")]
    ThresholdOrder { planner: u32, human: u32 },
}

/// Bounds for retries, escalation tiers, and record retention.
///
/// Defaults match the calibrated production values; `validate()` must be
/// called after deserializing user-supplied overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Errors a step may accumulate before the planner is notified (T1).
    pub error_threshold_per_step: u32,
    /// Errors before a human operator is escalated to (T2, >= T1).
    pub human_escalation_threshold: u32,
    /// Cooldown between escalation requests of the same type for a step.
    pub escalation_cooldown_minutes: u32,
    /// Autocorrection retries per individual command.
    pub max_retries_per_command: u32,
    /// Whether the autocorrection engine is consulted at all.
    pub auto_correction_enabled: bool,
    /// Replace remote execution with simulated results.
    pub dry_run_mode: bool,
    /// Days to keep attempt/error records for terminal steps.
    pub max_retention_days: u32,
    /// Upper bound on the number of steps the planner may return.
    pub max_steps: u32,
    /// Per-command execution timeout.
    pub command_timeout_seconds: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            error_threshold_per_step: 4,
            human_escalation_threshold: 6,
            escalation_cooldown_minutes: 5,
            max_retries_per_command: 2,
            auto_correction_enabled: true,
            dry_run_mode: false,
            max_retention_days: 7,
            max_steps: 10,
            command_timeout_seconds: 30,
        }
    }
}

impl PolicyConfig {
    /// Validate all ranges. Called once at load time; components assume a
    /// validated config afterwards.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_threshold_per_step < 1 {
            return Err(ConfigError::TooSmall {
                field: "error_threshold_per_step",
                min: 1,
                got: self.error_threshold_per_step as u64,
            });
        }
        if self.human_escalation_threshold < self.error_threshold_per_step {
            return Err(ConfigError::ThresholdOrder {
                planner: self.error_threshold_per_step,
                human: self.human_escalation_threshold,
            });
        }
        if self.max_retention_days < 1 {
            return Err(ConfigError::TooSmall {
                field: "max_retention_days",
                min: 1,
                got: self.max_retention_days as u64,
            });
        }
        if self.max_steps < 1 {
            return Err(ConfigError::TooSmall {
                field: "max_steps",
                min: 1,
                got: self.max_steps as u64,
            });
        }
        if self.max_steps > 50 {
            return Err(ConfigError::TooLarge {
                field: "max_steps",
                max: 50,
                got: self.max_steps as u64,
            });
        }
        if self.command_timeout_seconds < 1 {
            return Err(ConfigError::TooSmall {
                field: "command_timeout_seconds",
                min: 1,
                got: self.command_timeout_seconds,
            });
        }
        Ok(())
    }

    /// Threshold at which plan revision is requested (T1 + 1).
    pub fn plan_revision_threshold(&self) -> u32 {
        self.error_threshold_per_step + 1
    }

    /// Threshold at which the task is emergency-stopped (T2 + 2).
    pub fn emergency_stop_threshold(&self) -> u32 {
        self.human_escalation_threshold + 2
    }

    /// Per-command timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Escalation cooldown as a `Duration`.
    pub fn escalation_cooldown(&self) -> Duration {
        Duration::from_secs(u64::from(self.escalation_cooldown_minutes) * 60)
    }
}
