//! Append-only ledger of attempts and errors per step.
//!
//! The tracker is the only cross-thread mutable structure in the core;
//! writes are serialized behind one `RwLock`. Records are never mutated
//! after append, and the derived stats are recomputable from the raw
//! records at any time (`cleanup_old_records` relies on this).

mod records;
mod stats;

pub use records::{
    classify_pattern, classify_severity, AttemptRecord, ErrorRecord, ErrorSeverity,
    EscalationLevel,
};
pub use stats::{GlobalStats, StepErrorStats};

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PolicyConfig;

/// Outcome of one command execution, as reported by the executor.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub command: String,
    pub success: bool,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub autocorrection_used: bool,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AttemptOutcome {
    pub fn succeeded(command: impl Into<String>, duration: Duration, exit_code: i32) -> Self {
        Self {
            command: command.into(),
            success: true,
            duration,
            exit_code: Some(exit_code),
            error_message: None,
            autocorrection_used: false,
            metadata: HashMap::new(),
        }
    }

    pub fn failed(
        command: impl Into<String>,
        duration: Duration,
        exit_code: Option<i32>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            success: false,
            duration,
            exit_code,
            error_message: Some(error_message.into()),
            autocorrection_used: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_autocorrection(mut self, used: bool) -> Self {
        self.autocorrection_used = used;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Read-only projection of one step's error situation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub step_id: String,
    pub error_count: u32,
    pub total_attempts: u32,
    pub success_rate: f64,
    pub escalation_level: EscalationLevel,
    pub error_patterns: HashMap<String, u32>,
    pub last_error_timestamp: Option<DateTime<Utc>>,
    /// The most recent error messages, newest last (bounded).
    pub recent_errors: Vec<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    attempts: HashMap<String, Vec<AttemptRecord>>,
    errors: HashMap<String, Vec<ErrorRecord>>,
    stats: HashMap<String, StepErrorStats>,
    /// Last timestamp handed out; guards against the clock going backward.
    last_tick: Option<DateTime<Utc>>,
    autocorrections_successful: u64,
}

impl Ledger {
    /// Monotonic timestamp: if the wall clock went backward, reuse the
    /// last observed timestamp plus one millisecond.
    fn next_tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let tick = match self.last_tick {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_tick = Some(tick);
        tick
    }
}

/// Append-only attempt/error ledger with derived stats and the
/// escalation-level function.
pub struct ErrorTracker {
    planner_threshold: u32,
    human_threshold: u32,
    retention_days: u32,
    inner: RwLock<Ledger>,
}

impl ErrorTracker {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            planner_threshold: config.error_threshold_per_step,
            human_threshold: config.human_escalation_threshold,
            retention_days: config.max_retention_days,
            inner: RwLock::new(Ledger::default()),
        }
    }

    /// Append an attempt; a failed attempt also appends the implied
    /// error record. Returns the attempt id.
    pub fn record_attempt(&self, step_id: &str, outcome: AttemptOutcome) -> String {
        let mut ledger = self.inner.write().expect("tracker lock poisoned");
        let timestamp = ledger.next_tick();

        let attempt = AttemptRecord {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.to_string(),
            command: outcome.command.clone(),
            timestamp,
            success: outcome.success,
            duration: outcome.duration,
            exit_code: outcome.exit_code,
            error_message: outcome.error_message.clone(),
            autocorrection_used: outcome.autocorrection_used,
            metadata: outcome.metadata.clone(),
        };
        let attempt_id = attempt.id.clone();

        ledger
            .stats
            .entry(step_id.to_string())
            .or_insert_with(|| StepErrorStats::new(step_id))
            .apply_attempt(&attempt);
        if outcome.success && outcome.autocorrection_used {
            ledger.autocorrections_successful += 1;
        }
        ledger
            .attempts
            .entry(step_id.to_string())
            .or_default()
            .push(attempt);

        debug!(
            step_id,
            command = %outcome.command,
            success = outcome.success,
            "attempt recorded"
        );

        if !outcome.success {
            let message = outcome
                .error_message
                .unwrap_or_else(|| "unknown error".to_string());
            Self::append_error(
                &mut ledger,
                self.planner_threshold,
                self.human_threshold,
                step_id,
                &outcome.command,
                &message,
                outcome.exit_code,
                outcome.autocorrection_used,
                outcome.metadata,
            );
        }

        attempt_id
    }

    /// Append an error record directly (without an attempt), e.g. for a
    /// failed critical health check. Returns the error id.
    pub fn record_error(
        &self,
        step_id: &str,
        command: &str,
        error_message: &str,
        exit_code: Option<i32>,
        autocorrection_applied: bool,
        metadata: HashMap<String, serde_json::Value>,
    ) -> String {
        let mut ledger = self.inner.write().expect("tracker lock poisoned");
        Self::append_error(
            &mut ledger,
            self.planner_threshold,
            self.human_threshold,
            step_id,
            command,
            error_message,
            exit_code,
            autocorrection_applied,
            metadata,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn append_error(
        ledger: &mut Ledger,
        planner_threshold: u32,
        human_threshold: u32,
        step_id: &str,
        command: &str,
        error_message: &str,
        exit_code: Option<i32>,
        autocorrection_applied: bool,
        metadata: HashMap<String, serde_json::Value>,
    ) -> String {
        let timestamp = ledger.next_tick();
        let severity = classify_severity(error_message);
        let pattern = classify_pattern(error_message);

        let retry_count = ledger
            .errors
            .get(step_id)
            .map(|errors| errors.iter().filter(|e| e.command == command).count() as u32)
            .unwrap_or(0);

        // Level as of *after* this error lands.
        let count_after = ledger.errors.get(step_id).map(|e| e.len()).unwrap_or(0) as u32 + 1;
        let escalation_level =
            level_for_count(count_after, planner_threshold, human_threshold);

        let error = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.to_string(),
            command: command.to_string(),
            error_message: error_message.to_string(),
            severity,
            timestamp,
            exit_code,
            retry_count,
            autocorrection_applied,
            escalation_level,
            metadata,
        };
        let error_id = error.id.clone();

        ledger
            .stats
            .entry(step_id.to_string())
            .or_insert_with(|| StepErrorStats::new(step_id))
            .apply_error(&error, pattern);
        ledger
            .errors
            .entry(step_id.to_string())
            .or_default()
            .push(error);

        warn!(
            step_id,
            command,
            %severity,
            pattern,
            error_count = count_after,
            "error recorded"
        );

        error_id
    }

    /// Pure function of the step's current error count and the two
    /// configured thresholds.
    pub fn escalation_level(&self, step_id: &str) -> EscalationLevel {
        level_for_count(
            self.error_count(step_id),
            self.planner_threshold,
            self.human_threshold,
        )
    }

    pub fn error_count(&self, step_id: &str) -> u32 {
        let ledger = self.inner.read().expect("tracker lock poisoned");
        ledger.errors.get(step_id).map(|e| e.len()).unwrap_or(0) as u32
    }

    pub fn attempt_count(&self, step_id: &str) -> u32 {
        let ledger = self.inner.read().expect("tracker lock poisoned");
        ledger.attempts.get(step_id).map(|a| a.len()).unwrap_or(0) as u32
    }

    pub fn step_stats(&self, step_id: &str) -> Option<StepErrorStats> {
        let ledger = self.inner.read().expect("tracker lock poisoned");
        ledger.stats.get(step_id).cloned()
    }

    pub fn attempts(&self, step_id: &str) -> Vec<AttemptRecord> {
        let ledger = self.inner.read().expect("tracker lock poisoned");
        ledger.attempts.get(step_id).cloned().unwrap_or_default()
    }

    pub fn errors(&self, step_id: &str) -> Vec<ErrorRecord> {
        let ledger = self.inner.read().expect("tracker lock poisoned");
        ledger.errors.get(step_id).cloned().unwrap_or_default()
    }

    /// Errors for a step within the last `hours` hours, oldest first.
    pub fn recent_errors(&self, step_id: &str, hours: i64) -> Vec<ErrorRecord> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let ledger = self.inner.read().expect("tracker lock poisoned");
        ledger
            .errors
            .get(step_id)
            .map(|errors| {
                errors
                    .iter()
                    .filter(|e| e.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn error_summary(&self, step_id: &str) -> ErrorSummary {
        let ledger = self.inner.read().expect("tracker lock poisoned");
        let stats = ledger.stats.get(step_id);
        let errors = ledger.errors.get(step_id);
        let error_count = errors.map(|e| e.len()).unwrap_or(0) as u32;

        ErrorSummary {
            step_id: step_id.to_string(),
            error_count,
            total_attempts: stats.map(|s| s.total_attempts).unwrap_or(0),
            success_rate: stats.map(|s| s.success_rate()).unwrap_or(0.0),
            escalation_level: level_for_count(
                error_count,
                self.planner_threshold,
                self.human_threshold,
            ),
            error_patterns: stats.map(|s| s.error_patterns.clone()).unwrap_or_default(),
            last_error_timestamp: stats.and_then(|s| s.last_error_timestamp),
            recent_errors: errors
                .map(|e| {
                    e.iter()
                        .rev()
                        .take(5)
                        .rev()
                        .map(|r| r.error_message.clone())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn global_stats(&self) -> GlobalStats {
        let ledger = self.inner.read().expect("tracker lock poisoned");
        let total_attempts: u64 = ledger.attempts.values().map(|a| a.len() as u64).sum();
        let total_errors: u64 = ledger.errors.values().map(|e| e.len() as u64).sum();
        let autocorrections_applied: u64 = ledger
            .attempts
            .values()
            .flatten()
            .filter(|a| a.autocorrection_used)
            .count() as u64;

        GlobalStats {
            total_attempts,
            total_errors,
            autocorrections_applied,
            autocorrections_successful: ledger.autocorrections_successful,
            steps_tracked: ledger.stats.len(),
            total_attempt_records: total_attempts as usize,
            total_error_records: total_errors as usize,
        }
    }

    /// Drop records older than the retention window and recompute stats.
    ///
    /// Records of steps in `active_steps` (not yet terminal) are kept
    /// regardless of age.
    pub fn cleanup_old_records(&self, active_steps: &HashSet<String>) {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
        let mut ledger = self.inner.write().expect("tracker lock poisoned");

        let step_ids: Vec<String> = ledger
            .attempts
            .keys()
            .chain(ledger.errors.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut dropped = 0usize;
        for step_id in step_ids {
            if active_steps.contains(&step_id) {
                continue;
            }
            if let Some(attempts) = ledger.attempts.get_mut(&step_id) {
                let before = attempts.len();
                attempts.retain(|a| a.timestamp >= cutoff);
                dropped += before - attempts.len();
            }
            if let Some(errors) = ledger.errors.get_mut(&step_id) {
                let before = errors.len();
                errors.retain(|e| e.timestamp >= cutoff);
                dropped += before - errors.len();
            }

            let attempts = ledger.attempts.get(&step_id).cloned().unwrap_or_default();
            let errors = ledger.errors.get(&step_id).cloned().unwrap_or_default();
            if attempts.is_empty() && errors.is_empty() {
                ledger.attempts.remove(&step_id);
                ledger.errors.remove(&step_id);
                ledger.stats.remove(&step_id);
            } else {
                ledger
                    .stats
                    .insert(step_id.clone(), StepErrorStats::recompute(&step_id, &attempts, &errors));
            }
        }

        info!(dropped, retention_days = self.retention_days, "old records cleaned up");
    }

    /// Drop everything for one step. Used by plan revision to zero the
    /// error budget before re-entering execution.
    pub fn reset_step(&self, step_id: &str) {
        let mut ledger = self.inner.write().expect("tracker lock poisoned");
        ledger.attempts.remove(step_id);
        ledger.errors.remove(step_id);
        ledger.stats.remove(step_id);
        info!(step_id, "step ledger reset");
    }
}

fn level_for_count(count: u32, planner_threshold: u32, human_threshold: u32) -> EscalationLevel {
    if count == 0 {
        EscalationLevel::None
    } else if count < planner_threshold {
        EscalationLevel::Autocorrection
    } else if count < human_threshold {
        EscalationLevel::PlannerNotification
    } else {
        EscalationLevel::HumanEscalation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ErrorTracker {
        ErrorTracker::new(&PolicyConfig::default())
    }

    fn fail(command: &str, message: &str) -> AttemptOutcome {
        AttemptOutcome::failed(command, Duration::from_millis(50), Some(1), message)
    }

    #[test]
    fn failed_attempt_implies_error_record() {
        let t = tracker();
        t.record_attempt("step-1", fail("apt update", "connection refused"));

        assert_eq!(t.attempt_count("step-1"), 1);
        assert_eq!(t.error_count("step-1"), 1);

        t.record_attempt(
            "step-1",
            AttemptOutcome::succeeded("apt update", Duration::from_millis(40), 0),
        );
        assert_eq!(t.attempt_count("step-1"), 2);
        assert_eq!(t.error_count("step-1"), 1);
    }

    #[test]
    fn error_count_matches_record_count_invariant() {
        let t = tracker();
        for i in 0..5 {
            t.record_attempt("step-1", fail("cmd", &format!("failure {i}")));
        }
        assert_eq!(t.error_count("step-1"), t.errors("step-1").len() as u32);
        assert_eq!(
            t.step_stats("step-1").unwrap().error_count,
            t.error_count("step-1")
        );
    }

    #[test]
    fn escalation_level_thresholds() {
        let t = tracker(); // T_planner = 4, T_human = 6
        assert_eq!(t.escalation_level("s"), EscalationLevel::None);

        t.record_attempt("s", fail("cmd", "boom"));
        assert_eq!(t.escalation_level("s"), EscalationLevel::Autocorrection);

        for _ in 0..3 {
            t.record_attempt("s", fail("cmd", "boom"));
        }
        assert_eq!(t.error_count("s"), 4);
        assert_eq!(t.escalation_level("s"), EscalationLevel::PlannerNotification);

        t.record_attempt("s", fail("cmd", "boom"));
        assert_eq!(t.escalation_level("s"), EscalationLevel::PlannerNotification);

        t.record_attempt("s", fail("cmd", "boom"));
        assert_eq!(t.error_count("s"), 6);
        assert_eq!(t.escalation_level("s"), EscalationLevel::HumanEscalation);
    }

    #[test]
    fn escalation_level_is_monotonic_over_time() {
        let t = tracker();
        let mut last = t.escalation_level("s");
        for _ in 0..10 {
            t.record_attempt("s", fail("cmd", "boom"));
            let level = t.escalation_level("s");
            assert!(level >= last, "level weakened: {last:?} -> {level:?}");
            last = level;
        }
    }

    #[test]
    fn timestamps_strictly_increase() {
        let t = tracker();
        for _ in 0..20 {
            t.record_attempt("s", fail("cmd", "boom"));
        }
        let attempts = t.attempts("s");
        for pair in attempts.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
        let errors = t.errors("s");
        for pair in errors.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
    }

    #[test]
    fn replay_recomputes_identical_stats() {
        let t = tracker();
        t.record_attempt("s", fail("apt install nginx", "permission denied"));
        t.record_attempt(
            "s",
            AttemptOutcome::succeeded("sudo apt install nginx", Duration::from_millis(80), 0)
                .with_autocorrection(true),
        );
        t.record_attempt("s", fail("systemctl start nginx", "unit not found"));

        let live = t.step_stats("s").unwrap();
        let replayed = StepErrorStats::recompute("s", &t.attempts("s"), &t.errors("s"));

        assert_eq!(live.total_attempts, replayed.total_attempts);
        assert_eq!(live.successful_attempts, replayed.successful_attempts);
        assert_eq!(live.failed_attempts, replayed.failed_attempts);
        assert_eq!(live.error_count, replayed.error_count);
        assert_eq!(live.autocorrection_count, replayed.autocorrection_count);
        assert_eq!(live.error_patterns, replayed.error_patterns);
    }

    #[test]
    fn retry_count_tracks_same_command() {
        let t = tracker();
        t.record_attempt("s", fail("apt update", "timeout"));
        t.record_attempt("s", fail("apt update", "timeout"));
        t.record_attempt("s", fail("other", "timeout"));

        let errors = t.errors("s");
        assert_eq!(errors[0].retry_count, 0);
        assert_eq!(errors[1].retry_count, 1);
        assert_eq!(errors[2].retry_count, 0);
    }

    #[test]
    fn cleanup_spares_active_steps() {
        let t = ErrorTracker::new(&PolicyConfig {
            max_retention_days: 1,
            ..Default::default()
        });
        t.record_attempt("active", fail("cmd", "boom"));
        t.record_attempt("done", fail("cmd", "boom"));

        // Age both steps' records past the retention window.
        {
            let mut ledger = t.inner.write().unwrap();
            let old = Utc::now() - chrono::Duration::days(3);
            for records in ledger.attempts.values_mut() {
                for r in records.iter_mut() {
                    r.timestamp = old;
                }
            }
            for records in ledger.errors.values_mut() {
                for r in records.iter_mut() {
                    r.timestamp = old;
                }
            }
        }

        let active: HashSet<String> = ["active".to_string()].into();
        t.cleanup_old_records(&active);

        assert_eq!(t.attempt_count("active"), 1, "active step must be spared");
        assert_eq!(t.attempt_count("done"), 0);
        assert!(t.step_stats("done").is_none());
    }

    #[test]
    fn reset_step_zeroes_the_budget() {
        let t = tracker();
        for _ in 0..4 {
            t.record_attempt("s", fail("cmd", "boom"));
        }
        assert_eq!(t.escalation_level("s"), EscalationLevel::PlannerNotification);

        t.reset_step("s");
        assert_eq!(t.error_count("s"), 0);
        assert_eq!(t.escalation_level("s"), EscalationLevel::None);
    }

    #[test]
    fn global_stats_aggregate() {
        let t = tracker();
        t.record_attempt("a", fail("x", "boom"));
        t.record_attempt(
            "a",
            AttemptOutcome::succeeded("sudo x", Duration::from_millis(10), 0)
                .with_autocorrection(true),
        );
        t.record_attempt("b", AttemptOutcome::succeeded("y", Duration::from_millis(5), 0));

        let stats = t.global_stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.autocorrections_applied, 1);
        assert_eq!(stats.autocorrections_successful, 1);
        assert_eq!(stats.steps_tracked, 2);
        assert!((stats.autocorrection_success_rate() - 100.0).abs() < f64::EPSILON);
    }
}
