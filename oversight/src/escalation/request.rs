//! Escalation request model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four escalation tiers, weakest to strongest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EscalationType {
    /// Report to the planner; execution continues.
    PlannerNotification,
    /// Ask the planner to revise the step; the step pauses.
    PlanRevision,
    /// Notify a human operator; the step pauses.
    HumanEscalation,
    /// Cancel the task; nothing further executes.
    EmergencyStop,
}

impl std::fmt::Display for EscalationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlannerNotification => write!(f, "planner_notification"),
            Self::PlanRevision => write!(f, "plan_revision"),
            Self::HumanEscalation => write!(f, "human_escalation"),
            Self::EmergencyStop => write!(f, "emergency_stop"),
        }
    }
}

/// Request lifecycle: pending → in_progress → {resolved, failed} or
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    InProgress,
    Resolved,
    Failed,
    Cancelled,
}

impl EscalationStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One escalation, created by the system and mutated only to record its
/// resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: String,
    pub kind: EscalationType,
    pub step_id: String,
    pub task_id: String,
    pub reason: String,
    /// Error count at trigger time.
    pub error_count: u32,
    /// The threshold that was crossed.
    pub threshold_exceeded: u32,
    pub timestamp: DateTime<Utc>,
    /// Error ledger excerpt for the consumer.
    pub error_details: serde_json::Value,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
}

impl EscalationRequest {
    pub fn new(
        kind: EscalationType,
        step_id: impl Into<String>,
        task_id: impl Into<String>,
        error_count: u32,
        threshold_exceeded: u32,
        error_details: serde_json::Value,
    ) -> Self {
        let step_id = step_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            reason: format!(
                "step {step_id} reached {error_count} errors (threshold {threshold_exceeded})"
            ),
            kind,
            step_id,
            task_id: task_id.into(),
            error_count,
            threshold_exceeded,
            timestamp: Utc::now(),
            error_details,
            status: EscalationStatus::Pending,
            resolution: None,
        }
    }
}
