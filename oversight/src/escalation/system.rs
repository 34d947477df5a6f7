//! The escalation state machine.
//!
//! Deterministic: the tier is a pure function of the step's error count
//! and the configured thresholds. Consumers register typed handler lists
//! which are invoked synchronously on the emitter's thread; a handler
//! that errors moves the request to `Failed` and leaves the step paused
//! for manual intervention.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::request::{EscalationRequest, EscalationStatus, EscalationType};
use crate::config::PolicyConfig;

/// The four tier thresholds, derived from the policy config:
/// `T1`, `T1 + 1`, `T2`, `T2 + 2`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EscalationThresholds {
    pub planner_notification: u32,
    pub plan_revision: u32,
    pub human_escalation: u32,
    pub emergency_stop: u32,
}

impl EscalationThresholds {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            planner_notification: config.error_threshold_per_step,
            plan_revision: config.plan_revision_threshold(),
            human_escalation: config.human_escalation_threshold,
            emergency_stop: config.emergency_stop_threshold(),
        }
    }

    /// Strongest tier whose threshold `error_count` has reached.
    pub fn tier_for(&self, error_count: u32) -> Option<EscalationType> {
        if error_count >= self.emergency_stop {
            Some(EscalationType::EmergencyStop)
        } else if error_count >= self.human_escalation {
            Some(EscalationType::HumanEscalation)
        } else if error_count >= self.plan_revision {
            Some(EscalationType::PlanRevision)
        } else if error_count >= self.planner_notification {
            Some(EscalationType::PlannerNotification)
        } else {
            None
        }
    }

    fn threshold_of(&self, kind: EscalationType) -> u32 {
        match kind {
            EscalationType::PlannerNotification => self.planner_notification,
            EscalationType::PlanRevision => self.plan_revision,
            EscalationType::HumanEscalation => self.human_escalation,
            EscalationType::EmergencyStop => self.emergency_stop,
        }
    }
}

/// What the coordinator should do after a failed attempt.
#[derive(Debug, Clone)]
pub struct EscalationDecision {
    /// The newly raised request, if one was created this call.
    pub request: Option<EscalationRequest>,
    /// The tier the error count maps to (even when cooldown suppressed).
    pub kind: Option<EscalationType>,
    /// Pause the step until the active request resolves.
    pub pause_step: bool,
    /// Cancel the whole task.
    pub cancel_task: bool,
    /// A request of this type is already active or inside its cooldown.
    pub suppressed_by_cooldown: bool,
}

impl EscalationDecision {
    fn none() -> Self {
        Self {
            request: None,
            kind: None,
            pause_step: false,
            cancel_task: false,
            suppressed_by_cooldown: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("unknown escalation request: {0}")]
    UnknownRequest(String),

    #[error("request {id} is already terminal ({status:?})")]
    AlreadyTerminal {
        id: String,
        status: EscalationStatus,
    },
}

/// Consumer callback, invoked synchronously when a request is raised.
pub type EscalationHandler =
    Box<dyn Fn(&EscalationRequest) -> anyhow::Result<()> + Send + Sync>;

/// Counters surfaced in status reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationStats {
    pub total_raised: u64,
    pub planner_notifications: u64,
    pub plan_revisions: u64,
    pub human_escalations: u64,
    pub emergency_stops: u64,
    pub suppressed_by_cooldown: u64,
    pub failed_deliveries: u64,
}

#[derive(Default)]
struct Registry {
    requests: HashMap<String, EscalationRequest>,
    /// Last raise time per (step, type), for the cooldown window.
    last_raised: HashMap<(String, EscalationType), DateTime<Utc>>,
    stats: EscalationStats,
}

/// Owns active escalations and the cooldown registry.
pub struct EscalationSystem {
    thresholds: EscalationThresholds,
    cooldown: ChronoDuration,
    registry: Mutex<Registry>,
    handlers: Mutex<HashMap<EscalationType, Vec<EscalationHandler>>>,
}

impl EscalationSystem {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            thresholds: EscalationThresholds::from_config(config),
            cooldown: ChronoDuration::minutes(i64::from(config.escalation_cooldown_minutes)),
            registry: Mutex::new(Registry::default()),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> EscalationThresholds {
        self.thresholds
    }

    /// Append a consumer handler for one escalation type. Handler lists
    /// are append-only; handlers must return promptly.
    pub fn register_handler(&self, kind: EscalationType, handler: EscalationHandler) {
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Evaluate a step's error count after a failed attempt and raise a
    /// request when a threshold is crossed and no cooldown applies.
    pub fn evaluate(
        &self,
        step_id: &str,
        task_id: &str,
        error_count: u32,
        error_details: serde_json::Value,
    ) -> EscalationDecision {
        let Some(kind) = self.thresholds.tier_for(error_count) else {
            return EscalationDecision::none();
        };

        let pause_step = matches!(
            kind,
            EscalationType::PlanRevision | EscalationType::HumanEscalation
        );
        let cancel_task = kind == EscalationType::EmergencyStop;

        let mut registry = self.registry.lock().expect("escalation lock poisoned");

        if self.in_cooldown(&registry, step_id, kind) {
            registry.stats.suppressed_by_cooldown += 1;
            info!(step_id, %kind, error_count, "escalation suppressed by cooldown");
            return EscalationDecision {
                request: None,
                kind: Some(kind),
                pause_step,
                cancel_task,
                suppressed_by_cooldown: true,
            };
        }

        let mut request = EscalationRequest::new(
            kind,
            step_id,
            task_id,
            error_count,
            self.thresholds.threshold_of(kind),
            error_details,
        );

        registry
            .last_raised
            .insert((step_id.to_string(), kind), request.timestamp);
        registry.stats.total_raised += 1;
        match kind {
            EscalationType::PlannerNotification => registry.stats.planner_notifications += 1,
            EscalationType::PlanRevision => registry.stats.plan_revisions += 1,
            EscalationType::HumanEscalation => registry.stats.human_escalations += 1,
            EscalationType::EmergencyStop => registry.stats.emergency_stops += 1,
        }

        // Deliver synchronously. Any handler error fails the request.
        let handlers = self.handlers.lock().expect("handler lock poisoned");
        if let Some(list) = handlers.get(&kind) {
            let mut delivery_failed = false;
            for handler in list {
                if let Err(e) = handler(&request) {
                    warn!(
                        request_id = %request.id,
                        step_id,
                        %kind,
                        error = %e,
                        "escalation handler failed"
                    );
                    delivery_failed = true;
                }
            }
            request.status = if delivery_failed {
                registry.stats.failed_deliveries += 1;
                EscalationStatus::Failed
            } else {
                EscalationStatus::InProgress
            };
        }
        drop(handlers);

        info!(
            request_id = %request.id,
            step_id,
            task_id,
            %kind,
            error_count,
            status = ?request.status,
            "escalation raised"
        );

        registry
            .requests
            .insert(request.id.clone(), request.clone());

        EscalationDecision {
            request: Some(request),
            kind: Some(kind),
            pause_step,
            cancel_task,
            suppressed_by_cooldown: false,
        }
    }

    /// Blocked while a same-type request for the step is active, or the
    /// last raise is inside the cooldown window.
    fn in_cooldown(&self, registry: &Registry, step_id: &str, kind: EscalationType) -> bool {
        let active = registry
            .requests
            .values()
            .any(|r| r.step_id == step_id && r.kind == kind && r.status.is_active());
        if active {
            return true;
        }
        registry
            .last_raised
            .get(&(step_id.to_string(), kind))
            .map(|t| Utc::now() - *t < self.cooldown)
            .unwrap_or(false)
    }

    /// Record the consumer's resolution. For plan revision the caller
    /// also applies the revised step body before resolving.
    pub fn resolve(&self, request_id: &str, resolution: &str) -> Result<(), EscalationError> {
        self.finish(request_id, EscalationStatus::Resolved, resolution)
    }

    pub fn cancel(&self, request_id: &str, reason: &str) -> Result<(), EscalationError> {
        self.finish(request_id, EscalationStatus::Cancelled, reason)
    }

    pub fn fail(&self, request_id: &str, reason: &str) -> Result<(), EscalationError> {
        self.finish(request_id, EscalationStatus::Failed, reason)
    }

    fn finish(
        &self,
        request_id: &str,
        status: EscalationStatus,
        resolution: &str,
    ) -> Result<(), EscalationError> {
        let mut registry = self.registry.lock().expect("escalation lock poisoned");
        let request = registry
            .requests
            .get_mut(request_id)
            .ok_or_else(|| EscalationError::UnknownRequest(request_id.to_string()))?;

        if !request.status.is_active() {
            return Err(EscalationError::AlreadyTerminal {
                id: request_id.to_string(),
                status: request.status,
            });
        }

        request.status = status;
        request.resolution = Some(resolution.to_string());
        info!(request_id, ?status, resolution, "escalation finished");
        Ok(())
    }

    pub fn request(&self, request_id: &str) -> Option<EscalationRequest> {
        self.registry
            .lock()
            .expect("escalation lock poisoned")
            .requests
            .get(request_id)
            .cloned()
    }

    pub fn active_requests(&self) -> Vec<EscalationRequest> {
        let registry = self.registry.lock().expect("escalation lock poisoned");
        let mut active: Vec<_> = registry
            .requests
            .values()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|r| r.timestamp);
        active
    }

    pub fn requests_for_step(&self, step_id: &str) -> Vec<EscalationRequest> {
        let registry = self.registry.lock().expect("escalation lock poisoned");
        let mut requests: Vec<_> = registry
            .requests
            .values()
            .filter(|r| r.step_id == step_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }

    pub fn stats(&self) -> EscalationStats {
        self.registry
            .lock()
            .expect("escalation lock poisoned")
            .stats
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn system() -> EscalationSystem {
        EscalationSystem::new(&PolicyConfig::default()) // T1=4 T2=6 T3=8
    }

    #[test]
    fn tier_mapping_follows_thresholds() {
        let t = EscalationThresholds::from_config(&PolicyConfig::default());
        assert_eq!(t.tier_for(0), None);
        assert_eq!(t.tier_for(3), None);
        assert_eq!(t.tier_for(4), Some(EscalationType::PlannerNotification));
        assert_eq!(t.tier_for(5), Some(EscalationType::PlanRevision));
        assert_eq!(t.tier_for(6), Some(EscalationType::HumanEscalation));
        assert_eq!(t.tier_for(7), Some(EscalationType::HumanEscalation));
        assert_eq!(t.tier_for(8), Some(EscalationType::EmergencyStop));
        assert_eq!(t.tier_for(100), Some(EscalationType::EmergencyStop));
    }

    #[test]
    fn below_threshold_is_no_decision() {
        let s = system();
        let decision = s.evaluate("step", "task", 3, serde_json::json!({}));
        assert!(decision.kind.is_none());
        assert!(decision.request.is_none());
        assert!(!decision.pause_step);
    }

    #[test]
    fn planner_notification_raised_exactly_once_within_cooldown() {
        let s = system();
        let first = s.evaluate("step", "task", 4, serde_json::json!({}));
        let request = first.request.expect("first crossing raises");
        assert_eq!(request.kind, EscalationType::PlannerNotification);
        assert_eq!(request.status, EscalationStatus::Pending);
        assert!(!first.pause_step, "execution continues at notification tier");

        let duplicate = s.evaluate("step", "task", 4, serde_json::json!({}));
        assert!(duplicate.request.is_none());
        assert!(duplicate.suppressed_by_cooldown);
        assert_eq!(s.stats().planner_notifications, 1);
    }

    #[test]
    fn cooldown_expires_with_zero_window() {
        let config = PolicyConfig {
            escalation_cooldown_minutes: 0,
            ..Default::default()
        };
        let s = EscalationSystem::new(&config);

        let first = s.evaluate("step", "task", 4, serde_json::json!({}));
        let id = first.request.unwrap().id;
        // Still blocked: the first request is pending.
        assert!(s
            .evaluate("step", "task", 4, serde_json::json!({}))
            .suppressed_by_cooldown);

        s.resolve(&id, "noted").unwrap();
        // Resolved + zero window: a new request may be raised.
        let again = s.evaluate("step", "task", 4, serde_json::json!({}));
        assert!(again.request.is_some());
    }

    #[test]
    fn plan_revision_pauses_step() {
        let s = system();
        let decision = s.evaluate("step", "task", 5, serde_json::json!({}));
        assert_eq!(decision.kind, Some(EscalationType::PlanRevision));
        assert!(decision.pause_step);
        assert!(!decision.cancel_task);
    }

    #[test]
    fn emergency_stop_cancels_task() {
        let s = system();
        let decision = s.evaluate("step", "task", 8, serde_json::json!({}));
        assert_eq!(decision.kind, Some(EscalationType::EmergencyStop));
        assert!(decision.cancel_task);
        let request = decision.request.unwrap();
        assert_eq!(request.threshold_exceeded, 8);
    }

    #[test]
    fn different_types_do_not_share_cooldown() {
        let s = system();
        assert!(s
            .evaluate("step", "task", 4, serde_json::json!({}))
            .request
            .is_some());
        // Error count grew to the next tier: a different type, not blocked.
        assert!(s
            .evaluate("step", "task", 5, serde_json::json!({}))
            .request
            .is_some());
    }

    #[test]
    fn handler_acknowledgement_moves_to_in_progress() {
        let s = system();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        s.register_handler(
            EscalationType::PlannerNotification,
            Box::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let decision = s.evaluate("step", "task", 4, serde_json::json!({}));
        let request = decision.request.unwrap();
        assert_eq!(request.status, EscalationStatus::InProgress);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handler_fails_the_request() {
        let s = system();
        s.register_handler(
            EscalationType::HumanEscalation,
            Box::new(|_| anyhow::bail!("notification transport down")),
        );

        let decision = s.evaluate("step", "task", 6, serde_json::json!({}));
        let request = decision.request.unwrap();
        assert_eq!(request.status, EscalationStatus::Failed);
        assert_eq!(s.stats().failed_deliveries, 1);

        // A failed request is terminal, so the cooldown no longer sees an
        // active request; only the time window applies.
        let stored = s.request(&request.id).unwrap();
        assert_eq!(stored.status, EscalationStatus::Failed);
    }

    #[test]
    fn resolve_records_resolution() {
        let s = system();
        let id = s
            .evaluate("step", "task", 5, serde_json::json!({}))
            .request
            .unwrap()
            .id;

        s.resolve(&id, "step revised with new mirror").unwrap();
        let request = s.request(&id).unwrap();
        assert_eq!(request.status, EscalationStatus::Resolved);
        assert_eq!(
            request.resolution.as_deref(),
            Some("step revised with new mirror")
        );

        // Double resolution is an error.
        assert!(matches!(
            s.resolve(&id, "again"),
            Err(EscalationError::AlreadyTerminal { .. })
        ));
    }

    #[test]
    fn unknown_request_errors() {
        let s = system();
        assert!(matches!(
            s.resolve("nope", "x"),
            Err(EscalationError::UnknownRequest(_))
        ));
    }

    #[test]
    fn steps_have_independent_cooldowns() {
        let s = system();
        assert!(s
            .evaluate("step-a", "task", 4, serde_json::json!({}))
            .request
            .is_some());
        assert!(s
            .evaluate("step-b", "task", 4, serde_json::json!({}))
            .request
            .is_some());
    }
}
