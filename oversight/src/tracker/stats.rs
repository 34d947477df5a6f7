//! Derived per-step and global statistics over the ledgers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::{AttemptRecord, ErrorRecord, EscalationLevel};

/// Derived view of one step's ledger. Kept incrementally and recomputable
/// from the raw records (the two must always agree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepErrorStats {
    pub step_id: String,
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub failed_attempts: u32,
    pub error_count: u32,
    pub autocorrection_count: u32,
    pub total_duration: Duration,
    pub last_error_timestamp: Option<DateTime<Utc>>,
    /// Histogram of pattern classes seen in error messages.
    pub error_patterns: HashMap<String, u32>,
    /// Escalation level at the time of each recorded error.
    pub escalation_history: Vec<EscalationLevel>,
}

impl StepErrorStats {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            total_attempts: 0,
            successful_attempts: 0,
            failed_attempts: 0,
            error_count: 0,
            autocorrection_count: 0,
            total_duration: Duration::ZERO,
            last_error_timestamp: None,
            error_patterns: HashMap::new(),
            escalation_history: Vec::new(),
        }
    }

    pub fn apply_attempt(&mut self, attempt: &AttemptRecord) {
        self.total_attempts += 1;
        self.total_duration += attempt.duration;
        if attempt.success {
            self.successful_attempts += 1;
        } else {
            self.failed_attempts += 1;
        }
        if attempt.autocorrection_used {
            self.autocorrection_count += 1;
        }
    }

    pub fn apply_error(&mut self, error: &ErrorRecord, pattern: &str) {
        self.error_count += 1;
        self.last_error_timestamp = Some(error.timestamp);
        *self.error_patterns.entry(pattern.to_string()).or_insert(0) += 1;
        self.escalation_history.push(error.escalation_level);
    }

    /// Rebuild from raw records; used after retention cleanup and by the
    /// replay law test.
    pub fn recompute(
        step_id: &str,
        attempts: &[AttemptRecord],
        errors: &[ErrorRecord],
    ) -> Self {
        let mut stats = Self::new(step_id);
        for attempt in attempts {
            stats.apply_attempt(attempt);
        }
        for error in errors {
            let pattern = super::records::classify_pattern(&error.error_message);
            stats.apply_error(error, pattern);
        }
        stats
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            f64::from(self.successful_attempts) / f64::from(self.total_attempts) * 100.0
        }
    }
}

/// Cross-step totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_attempts: u64,
    pub total_errors: u64,
    pub autocorrections_applied: u64,
    pub autocorrections_successful: u64,
    pub steps_tracked: usize,
    pub total_attempt_records: usize,
    pub total_error_records: usize,
}

impl GlobalStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            (self.total_attempts - self.total_errors) as f64 / self.total_attempts as f64 * 100.0
        }
    }

    pub fn autocorrection_success_rate(&self) -> f64 {
        if self.autocorrections_applied == 0 {
            0.0
        } else {
            self.autocorrections_successful as f64 / self.autocorrections_applied as f64 * 100.0
        }
    }
}
