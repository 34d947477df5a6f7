//! Deterministic core of the opswarm agent.
//!
//! This crate holds everything that must never depend on a language model:
//! - the task/step/subtask data model and its status invariants
//! - the append-only attempt/error ledger and per-step error budgets
//! - the command validator (forbidden substrings, dangerous patterns,
//!   optional allow-list)
//! - the health checker that converts exit codes into step verdicts
//! - the rule-driven autocorrection engine (model fallback behind a trait)
//! - the four-tier escalation system with per-(step, type) cooldowns
//! - the subtask executor (validate → execute → record → autocorrect)
//! - the event bus and the persistent state manager
//!
//! The model-facing layer (`ops-agents`) wires these together; nothing in
//! this crate opens a socket or calls a model directly. All decisions made
//! here are deterministic and replayable from the ledgers.

pub mod autocorrect;
pub mod config;
pub mod escalation;
pub mod events;
pub mod executor;
pub mod health;
pub mod shell;
pub mod state;
pub mod task;
pub mod tracker;
pub mod validator;

pub use autocorrect::{
    AutocorrectionEngine, CommandRewriter, Correction, CorrectionKind, Failure, PackageManager,
};
pub use config::{ConfigError, PolicyConfig};
pub use escalation::{
    EscalationDecision, EscalationRequest, EscalationStatus, EscalationSystem, EscalationType,
};
pub use events::{EventBus, OpsEvent, SharedEventBus};
pub use executor::{CommandOutcome, ExecutionContext, SubtaskExecutor, SubtaskResult};
pub use health::{AggregateReport, CheckConfig, CheckResult, CheckStatus, HealthChecker};
pub use shell::{ExecError, ExecOutcome, RemoteShell};
pub use state::{StateChange, StateChannel, StateManager, StateSnapshot};
pub use task::{Priority, Step, StepStatus, Subtask, Task, TaskStatus};
pub use tracker::{
    AttemptRecord, ErrorRecord, ErrorSeverity, ErrorTracker, EscalationLevel, StepErrorStats,
};
pub use validator::{CommandValidator, SecurityLevel, ValidationContext, ValidationReport};
