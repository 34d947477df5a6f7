//! Coordinator lifecycle — explicit phases and legal transition guards.
//!
//! Every phase change is validated and recorded, so a run can be audited
//! (or replayed) from the transition log alone.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Phases of one task-driving coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// Opening the transport, loading components, restoring state.
    Initializing,
    /// Waiting for `execute_task`.
    Ready,
    /// The planner is producing the step graph.
    Planning,
    /// Steps are being generated and executed.
    Executing,
    /// Blocked on an escalation resolution.
    Escalated,
    /// Every step completed or was skipped — terminal.
    Completed,
    /// A step exhausted its budget or planning failed — terminal.
    Failed,
    /// Emergency stop or operator cancellation — terminal.
    Cancelled,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Planning => write!(f, "planning"),
            Self::Executing => write!(f, "executing"),
            Self::Escalated => write!(f, "escalated"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Legal edges of the phase graph:
/// ```text
/// Initializing → Ready
/// Ready        → Planning
/// Planning     → Executing
/// Executing    → Escalated | Completed
/// Escalated    → Executing
/// ```
/// plus `→ Failed` and `→ Cancelled` from every non-terminal phase.
fn is_legal(from: AgentPhase, to: AgentPhase) -> bool {
    use AgentPhase::*;

    if (to == Failed || to == Cancelled) && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Initializing, Ready)
            | (Ready, Planning)
            | (Planning, Executing)
            | (Executing, Escalated)
            | (Executing, Completed)
            | (Escalated, Executing)
    )
}

/// A single recorded phase change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: AgentPhase,
    pub to: AgentPhase,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal phase transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: AgentPhase,
    pub to: AgentPhase,
}

/// The phase machine: current phase, guards, and an auditable log.
#[derive(Debug)]
pub struct LifecycleMachine {
    current: AgentPhase,
    created_at: Instant,
    transitions: Vec<PhaseTransition>,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self {
            current: AgentPhase::Initializing,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> AgentPhase {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    /// Attempt to advance; illegal edges are rejected.
    pub fn advance(
        &mut self,
        to: AgentPhase,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(from = %self.current, %to, "phase transition");
        self.transitions.push(PhaseTransition {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Always legal from non-terminal phases.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(AgentPhase::Failed, Some(reason))
    }

    pub fn cancel(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(AgentPhase::Cancelled, Some(reason))
    }

    pub fn summary(&self) -> String {
        let path: Vec<String> = std::iter::once(AgentPhase::Initializing.to_string())
            .chain(self.transitions.iter().map(|t| t.to.to_string()))
            .collect();
        format!(
            "{} ({} transitions, {}ms)",
            path.join(" → "),
            self.transitions.len(),
            self.created_at.elapsed().as_millis(),
        )
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut m = LifecycleMachine::new();
        m.advance(AgentPhase::Ready, None).unwrap();
        m.advance(AgentPhase::Planning, Some("task received")).unwrap();
        m.advance(AgentPhase::Executing, None).unwrap();
        m.advance(AgentPhase::Completed, Some("all steps done")).unwrap();

        assert!(m.is_terminal());
        assert_eq!(m.transitions().len(), 4);
    }

    #[test]
    fn escalation_roundtrip() {
        let mut m = LifecycleMachine::new();
        m.advance(AgentPhase::Ready, None).unwrap();
        m.advance(AgentPhase::Planning, None).unwrap();
        m.advance(AgentPhase::Executing, None).unwrap();
        m.advance(AgentPhase::Escalated, Some("plan revision requested"))
            .unwrap();
        m.advance(AgentPhase::Executing, Some("revision applied")).unwrap();
        m.advance(AgentPhase::Completed, None).unwrap();
        assert!(m.is_terminal());
    }

    #[test]
    fn cannot_skip_phases() {
        let mut m = LifecycleMachine::new();
        let err = m.advance(AgentPhase::Executing, None).unwrap_err();
        assert_eq!(err.from, AgentPhase::Initializing);
        assert_eq!(err.to, AgentPhase::Executing);
    }

    #[test]
    fn fail_and_cancel_from_any_nonterminal() {
        for target in [AgentPhase::Failed, AgentPhase::Cancelled] {
            let mut m = LifecycleMachine::new();
            m.advance(AgentPhase::Ready, None).unwrap();
            m.advance(AgentPhase::Planning, None).unwrap();
            m.advance(target, Some("boom")).unwrap();
            assert!(m.is_terminal());
        }
    }

    #[test]
    fn terminal_phases_are_final() {
        let mut m = LifecycleMachine::new();
        m.fail("early failure").unwrap();
        assert!(m.advance(AgentPhase::Ready, None).is_err());
        assert!(m.fail("again").is_err());
        assert!(m.cancel("nope").is_err());
    }

    #[test]
    fn summary_lists_the_path() {
        let mut m = LifecycleMachine::new();
        m.advance(AgentPhase::Ready, None).unwrap();
        m.cancel("operator").unwrap();
        let summary = m.summary();
        assert!(summary.contains("initializing → ready → cancelled"));
        assert!(summary.contains("2 transitions"));
    }
}
