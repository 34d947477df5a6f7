//! Task graph data model: Task → Steps (DAG) → Subtasks (command chains).
//!
//! The coordinator exclusively owns the mutable graph; every other
//! component sees step ids and read-only projections.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Step/task priority. Ordering is used for topological tie-breaking:
/// `Critical > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Task lifecycle. Transitions follow
/// `pending → in_progress → {completed, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Planning,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A concrete command chain for one step: mutating commands, verification
/// commands, and rollback commands run only after a partial mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub step_id: String,
    pub title: String,
    /// Mutating commands, executed in order.
    pub commands: Vec<String>,
    /// Verification commands, run after all mutating commands succeed.
    pub health_checks: Vec<String>,
    /// Executed in order when the subtask fails after mutating state.
    pub rollback_commands: Vec<String>,
    /// Sibling subtask ids that must complete first.
    pub depends_on: Vec<String>,
    /// Per-subtask command timeout.
    pub timeout: Duration,
}

impl Subtask {
    pub fn new(step_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.into(),
            title: title.into(),
            commands: Vec::new(),
            health_checks: Vec::new(),
            rollback_commands: Vec::new(),
            depends_on: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_health_checks(mut self, checks: Vec<String>) -> Self {
        self.health_checks = checks;
        self
    }

    pub fn with_rollback(mut self, rollback: Vec<String>) -> Self {
        self.rollback_commands = rollback;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One unit of the plan, with dependencies and an error budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    pub priority: Priority,
    /// Planner's estimate, in minutes.
    pub estimated_duration: u32,
    /// Ids of steps that must complete before this one may run.
    pub depends_on: Vec<String>,
    pub error_count: u32,
    pub max_errors: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Subtasks collected during execution (most recent generation).
    pub subtasks: Vec<Subtask>,
}

impl Step {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            status: StepStatus::Pending,
            priority: Priority::Medium,
            estimated_duration: 5,
            depends_on: Vec::new(),
            error_count: 0,
            max_errors: 4,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            subtasks: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration = minutes;
        self
    }

    /// A step is executable iff all of its dependencies are completed.
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.status == StepStatus::Pending && self.depends_on.iter().all(|d| completed.contains(d))
    }

    pub fn can_retry(&self) -> bool {
        self.error_count < self.max_errors
    }

    pub fn mark_started(&mut self) {
        self.status = StepStatus::Executing;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Plan revision resets the error budget and replaces the subtasks.
    pub fn reset_for_revision(&mut self, subtasks: Vec<Subtask>) {
        self.error_count = 0;
        self.status = StepStatus::Pending;
        self.completed_at = None;
        self.subtasks = subtasks;
    }
}

/// Derived progress view over a task's steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percent: f32,
}

/// A user-level intent expanded into a step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub steps: Vec<Step>,
    /// Deterministic execution order produced at plan time (step ids).
    pub execution_order: Vec<String>,
    /// Sum of step estimates, minutes.
    pub total_estimated_duration: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque context bag carried from planning into execution.
    pub context: HashMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            priority: Priority::Medium,
            status: TaskStatus::Pending,
            steps: Vec::new(),
            execution_order: Vec::new(),
            total_estimated_duration: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            context: HashMap::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn completed_step_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Pending steps whose dependencies are all completed, in execution
    /// order with ties already broken at plan time.
    pub fn ready_steps(&self) -> Vec<&Step> {
        let completed = self.completed_step_ids();
        self.execution_order
            .iter()
            .filter_map(|id| self.step(id))
            .filter(|s| s.is_ready(&completed))
            .collect()
    }

    /// A task is completed iff every step is completed or skipped.
    pub fn is_completed(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
    }

    /// A task is failed iff some step failed and cannot retry.
    pub fn is_failed(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.status == StepStatus::Failed && !s.can_retry())
    }

    pub fn progress(&self) -> TaskProgress {
        let total = self.steps.len();
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let failed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        let skipped = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        TaskProgress {
            total_steps: total,
            completed,
            failed,
            skipped,
            percent: if total == 0 {
                0.0
            } else {
                (completed + skipped) as f32 / total as f32 * 100.0
            },
        }
    }

    pub fn mark_started(&mut self) {
        self.status = TaskStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_task() -> Task {
        let mut task = Task::new("install nginx", "install and enable nginx");
        let first = Step::new("update package lists", "refresh apt indices");
        let mut second = Step::new("install nginx", "install the nginx package");
        second.depends_on = vec![first.id.clone()];
        task.execution_order = vec![first.id.clone(), second.id.clone()];
        task.steps = vec![first, second];
        task
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn readiness_follows_dependencies() {
        let mut task = two_step_task();
        let ready: Vec<_> = task.ready_steps().iter().map(|s| s.title.clone()).collect();
        assert_eq!(ready, vec!["update package lists"]);

        let first_id = task.steps[0].id.clone();
        task.step_mut(&first_id).unwrap().mark_completed();
        let ready: Vec<_> = task.ready_steps().iter().map(|s| s.title.clone()).collect();
        assert_eq!(ready, vec!["install nginx"]);
    }

    #[test]
    fn completed_iff_all_steps_terminal_good() {
        let mut task = two_step_task();
        assert!(!task.is_completed());

        for step in &mut task.steps {
            step.mark_completed();
        }
        assert!(task.is_completed());

        task.steps[1].status = StepStatus::Skipped;
        assert!(task.is_completed());
    }

    #[test]
    fn failed_requires_exhausted_budget() {
        let mut task = two_step_task();
        task.steps[0].mark_failed();
        // Budget not exhausted yet: step could still be retried.
        assert!(!task.is_failed());

        task.steps[0].error_count = task.steps[0].max_errors;
        assert!(task.is_failed());
    }

    #[test]
    fn revision_resets_budget_and_subtasks() {
        let mut task = two_step_task();
        let id = task.steps[0].id.clone();
        {
            let step = task.step_mut(&id).unwrap();
            step.error_count = 4;
            step.mark_failed();
        }

        let fresh = Subtask::new(id.clone(), "retry with mirrors fixed")
            .with_commands(vec!["sudo apt update".into()]);
        let step = task.step_mut(&id).unwrap();
        step.reset_for_revision(vec![fresh]);

        assert_eq!(step.error_count, 0);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.subtasks.len(), 1);
    }

    #[test]
    fn progress_counts_skipped_as_done() {
        let mut task = two_step_task();
        task.steps[0].mark_completed();
        task.steps[1].status = StepStatus::Skipped;
        let progress = task.progress();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.skipped, 1);
        assert!((progress.percent - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn serde_roundtrip() {
        let task = two_step_task();
        let json = serde_json::to_string(&task).unwrap();
        let restored: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.steps.len(), 2);
        assert_eq!(restored.steps[1].depends_on, task.steps[1].depends_on);
    }
}
