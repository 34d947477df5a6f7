//! Typed events published by the coordinator and components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::EscalationType;

/// Everything a subscriber (notifier, reporter, timeline collector) can
/// observe about a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpsEvent {
    /// A task entered the pipeline.
    TaskStarted {
        task_id: String,
        title: String,
        dry_run: bool,
        timestamp: DateTime<Utc>,
    },

    /// The coordinator moved between lifecycle phases.
    PhaseChanged {
        task_id: String,
        phase: String,
        timestamp: DateTime<Utc>,
    },

    /// Progress heartbeat, published at every state transition.
    Progress {
        task_id: String,
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        progress_percentage: f32,
        message: String,
        timestamp: DateTime<Utc>,
    },

    StepStarted {
        task_id: String,
        step_id: String,
        title: String,
        timestamp: DateTime<Utc>,
    },

    StepCompleted {
        task_id: String,
        step_id: String,
        timestamp: DateTime<Utc>,
    },

    StepFailed {
        task_id: String,
        step_id: String,
        error_count: u32,
        last_error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    EscalationRaised {
        task_id: String,
        step_id: String,
        request_id: String,
        kind: EscalationType,
        error_count: u32,
        timestamp: DateTime<Utc>,
    },

    EscalationResolved {
        task_id: String,
        request_id: String,
        resolution: String,
        timestamp: DateTime<Utc>,
    },

    TaskCompleted {
        task_id: String,
        duration_seconds: u64,
        timestamp: DateTime<Utc>,
    },

    TaskFailed {
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    TaskCancelled {
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The state manager re-applied a past snapshot.
    StateRestored {
        snapshot_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl OpsEvent {
    /// Stable tag for logging and filtering.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::Progress { .. } => "progress",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::EscalationRaised { .. } => "escalation_raised",
            Self::EscalationResolved { .. } => "escalation_resolved",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::StateRestored { .. } => "state_restored",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::TaskStarted { timestamp, .. }
            | Self::PhaseChanged { timestamp, .. }
            | Self::Progress { timestamp, .. }
            | Self::StepStarted { timestamp, .. }
            | Self::StepCompleted { timestamp, .. }
            | Self::StepFailed { timestamp, .. }
            | Self::EscalationRaised { timestamp, .. }
            | Self::EscalationResolved { timestamp, .. }
            | Self::TaskCompleted { timestamp, .. }
            | Self::TaskFailed { timestamp, .. }
            | Self::TaskCancelled { timestamp, .. }
            | Self::StateRestored { timestamp, .. } => *timestamp,
        }
    }
}
