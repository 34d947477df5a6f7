//! Ledger record types and the failure taxonomy.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity classified from the error message by keyword taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Escalation level derived from a step's error count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    #[default]
    None,
    Autocorrection,
    PlannerNotification,
    HumanEscalation,
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Autocorrection => write!(f, "autocorrection"),
            Self::PlannerNotification => write!(f, "planner_notification"),
            Self::HumanEscalation => write!(f, "human_escalation"),
        }
    }
}

/// One execution of one command, success or failure. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: String,
    pub step_id: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub autocorrection_used: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// The failure-side projection of an attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub step_id: String,
    pub command: String,
    pub error_message: String,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub retry_count: u32,
    pub autocorrection_applied: bool,
    pub escalation_level: EscalationLevel,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Classify an error message into a severity (case-insensitive substring
/// match, strongest class first).
pub fn classify_severity(error_message: &str) -> ErrorSeverity {
    let lower = error_message.to_lowercase();

    const CRITICAL: &[&str] = &[
        "permission denied",
        "access denied",
        "operation not permitted",
        "disk full",
        "no space left",
        "out of memory",
    ];
    const HIGH: &[&str] = &[
        "connection refused",
        "timeout",
        "service not found",
        "package not found",
        "command not found",
    ];
    const MEDIUM: &[&str] = &[
        "syntax error",
        "invalid option",
        "file not found",
        "directory not found",
    ];

    if CRITICAL.iter().any(|p| lower.contains(p)) {
        ErrorSeverity::Critical
    } else if HIGH.iter().any(|p| lower.contains(p)) {
        ErrorSeverity::High
    } else if MEDIUM.iter().any(|p| lower.contains(p)) {
        ErrorSeverity::Medium
    } else {
        ErrorSeverity::Low
    }
}

/// Histogram key for an error message: first matching class wins.
pub fn classify_pattern(error_message: &str) -> &'static str {
    let lower = error_message.to_lowercase();
    let classes: &[(&str, &[&str])] = &[
        ("permission_denied", &["permission denied", "access denied"]),
        ("command_not_found", &["command not found", "no such file"]),
        (
            "connection_error",
            &["connection refused", "timeout", "network"],
        ),
        ("syntax_error", &["syntax error", "invalid option"]),
        ("file_not_found", &["file not found", "directory not found"]),
        ("package_error", &["package not found", "unable to locate"]),
        ("service_error", &["service not found", "unit not found"]),
    ];

    for (name, keywords) in classes {
        if keywords.iter().any(|k| lower.contains(k)) {
            return name;
        }
    }
    "unknown"
}
