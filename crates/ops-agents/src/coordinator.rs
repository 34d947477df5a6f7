//! The coordinator: owns the task lifecycle and wires planning,
//! execution, and escalation together.
//!
//! One coordinator drives one task. The step loop is single-threaded;
//! remote-shell and model calls are the only suspension points, and the
//! loop stays responsive to cancellation between commands. Multiple
//! tasks run as multiple coordinators.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use oversight::tracker::ErrorSummary;
use oversight::{
    AutocorrectionEngine, CommandValidator, ErrorTracker, EscalationStatus, EscalationSystem,
    EscalationType, EventBus, ExecutionContext, HealthChecker, OpsEvent, PackageManager,
    RemoteShell, SharedEventBus, StateChannel, StateManager, StepStatus, Subtask, SubtaskExecutor,
    Task, TaskStatus,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::lifecycle::{AgentPhase, LifecycleMachine};
use crate::model::{ModelClient, ModelRewriter};
use crate::planner::{PlanningContext, TaskAgent};
use crate::subtasks::SubtaskAgent;

/// Per-step summary in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub title: String,
    pub status: StepStatus,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// What the caller gets back for every task, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub dry_run: bool,
    pub steps: Vec<StepReport>,
    /// Escalation requests raised during the run, oldest first.
    pub escalations: Vec<oversight::EscalationRequest>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lifecycle: String,
}

/// Outcome of driving one step to a verdict.
enum StepVerdict {
    Completed,
    Failed,
    /// Human escalation acknowledged; the step stays paused.
    Paused,
    CancelTask,
}

/// Wires the deterministic core to the model and the transport and
/// drives tasks through Planning → Executing → terminal.
pub struct Coordinator {
    config: AgentConfig,
    shell: Arc<dyn RemoteShell>,
    planner: TaskAgent,
    subtask_agent: SubtaskAgent,
    executor: SubtaskExecutor,
    tracker: Arc<ErrorTracker>,
    escalation: Arc<EscalationSystem>,
    state: Arc<StateManager>,
    events: SharedEventBus,
    lifecycle: Mutex<LifecycleMachine>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: AgentConfig,
        shell: Arc<dyn RemoteShell>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        let policy = config.policy.clone();
        let validator = Arc::new(CommandValidator::with_defaults());
        let tracker = Arc::new(ErrorTracker::new(&policy));
        let autocorrect = Arc::new(
            AutocorrectionEngine::new(PackageManager::for_os(&config.os_type))
                .with_rewriter(Arc::new(ModelRewriter::new(model.clone()))),
        );
        let health = Arc::new(HealthChecker::new());
        let events = EventBus::new().shared();

        Self {
            planner: TaskAgent::new(model.clone(), policy.clone(), config.model.timeout()),
            subtask_agent: SubtaskAgent::new(
                model,
                validator.clone(),
                autocorrect.clone(),
                config.os_type.clone(),
                config.model.timeout(),
                policy.command_timeout(),
            ),
            executor: SubtaskExecutor::new(
                validator,
                tracker.clone(),
                autocorrect,
                health,
                policy.clone(),
            ),
            escalation: Arc::new(EscalationSystem::new(&policy)),
            state: Arc::new(
                StateManager::new(config.state_path.clone()).with_events(events.clone()),
            ),
            tracker,
            events,
            lifecycle: Mutex::new(LifecycleMachine::new()),
            cancel: CancellationToken::new(),
            shell,
            config,
        }
    }

    pub fn events(&self) -> SharedEventBus {
        self.events.clone()
    }

    pub fn escalation(&self) -> Arc<EscalationSystem> {
        self.escalation.clone()
    }

    pub fn tracker(&self) -> Arc<ErrorTracker> {
        self.tracker.clone()
    }

    pub fn state(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    /// Cooperative cancellation handle for this task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Open the transport, restore prior state, start autosave.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.shell.connect().await?;
        match self.state.load() {
            Ok(true) => info!("prior state restored"),
            Ok(false) => info!("no prior state found"),
            Err(e) => warn!(error = %e, "prior state unreadable, starting fresh"),
        }
        self.state.start();
        self.advance(AgentPhase::Ready, Some("initialized"), None)?;
        Ok(())
    }

    /// Drive one task to a terminal status. Closes the transport and
    /// stops the state manager on every exit path.
    pub async fn execute_task(
        &self,
        description: &str,
        context: Option<&PlanningContext>,
        dry_run: bool,
    ) -> anyhow::Result<TaskReport> {
        let result = self.run_task(description, context, dry_run).await;
        if let Err(e) = self.shutdown().await {
            warn!(error = %e, "shutdown incomplete");
        }
        result
    }

    async fn run_task(
        &self,
        description: &str,
        context: Option<&PlanningContext>,
        dry_run: bool,
    ) -> anyhow::Result<TaskReport> {
        let dry_run = dry_run || self.config.policy.dry_run_mode;
        self.advance(AgentPhase::Planning, Some("task received"), None)?;

        // Planning, with exactly one retry on failure.
        let mut task = match self.planner.plan_task(description, context).await {
            Ok(task) => task,
            Err(first) => {
                warn!(error = %first, "planning failed, retrying once");
                match self.planner.plan_task(description, context).await {
                    Ok(task) => task,
                    Err(second) => {
                        error!(error = %second, "planning failed twice");
                        let _ = self.lifecycle.lock().expect("lifecycle lock").fail(
                            &format!("planning failed: {second}"),
                        );
                        return Err(second.into());
                    }
                }
            }
        };

        task.mark_started();
        self.events.publish(OpsEvent::TaskStarted {
            task_id: task.id.clone(),
            title: task.title.clone(),
            dry_run,
            timestamp: Utc::now(),
        });
        self.save_task_state(&task, "task planned");
        self.advance(AgentPhase::Executing, Some("plan accepted"), Some(&task))?;

        // The step loop: topological order, ties already broken at plan
        // time by priority then insertion order.
        loop {
            if self.cancel.is_cancelled() {
                task.mark_cancelled();
                self.finish(&mut task, AgentPhase::Cancelled, "cancellation requested")?;
                break;
            }

            let Some(step_id) = task.ready_steps().first().map(|s| s.id.clone()) else {
                if task.is_completed() {
                    task.mark_completed();
                    self.finish(&mut task, AgentPhase::Completed, "all steps completed")?;
                } else {
                    task.mark_failed();
                    self.finish(&mut task, AgentPhase::Failed, "no runnable steps remain")?;
                }
                break;
            };

            match self.drive_step(&mut task, &step_id, dry_run).await? {
                StepVerdict::Completed => {
                    self.publish_progress(&task, Some(&step_id), "step completed");
                    self.save_task_state(&task, "step completed");
                }
                StepVerdict::Failed | StepVerdict::Paused => {
                    task.mark_failed();
                    self.finish(&mut task, AgentPhase::Failed, "step failed")?;
                    break;
                }
                StepVerdict::CancelTask => {
                    let reason = if self.cancel.is_cancelled() {
                        "cancellation requested"
                    } else {
                        "emergency stop"
                    };
                    task.mark_cancelled();
                    self.finish(&mut task, AgentPhase::Cancelled, reason)?;
                    break;
                }
            }
        }

        Ok(self.report(&task, dry_run))
    }

    /// Execute one step: generate subtasks, run them, and consult the
    /// escalation ladder after every failure until a verdict is reached.
    async fn drive_step(
        &self,
        task: &mut Task,
        step_id: &str,
        dry_run: bool,
    ) -> anyhow::Result<StepVerdict> {
        let task_id = task.id.clone();
        {
            let step = task.step_mut(step_id).expect("ready step exists");
            step.status = StepStatus::Planning;
            self.events.publish(OpsEvent::StepStarted {
                task_id: task_id.clone(),
                step_id: step_id.to_string(),
                title: step.title.clone(),
                timestamp: Utc::now(),
            });
        }

        // Subtask generation. A step whose plan cannot be validated fails
        // without touching the host.
        let step_snapshot = task.step(step_id).expect("step exists").clone();
        let subtasks = match self.subtask_agent.plan_subtasks(&task_id, &step_snapshot).await {
            Ok(subtasks) => subtasks,
            Err(e) => {
                warn!(step_id, error = %e, "subtask generation failed");
                self.fail_step(task, step_id);
                return Ok(StepVerdict::Failed);
            }
        };
        {
            let step = task.step_mut(step_id).expect("step exists");
            step.subtasks = subtasks;
            step.mark_started();
        }
        self.publish_progress(task, Some(step_id), "step executing");

        let ctx = ExecutionContext {
            task_id: task_id.clone(),
            dry_run,
            allow_destructive: false,
            cancel: self.cancel.clone(),
        };

        let mut index = 0usize;
        loop {
            let subtask: Subtask = {
                let step = task.step(step_id).expect("step exists");
                match step.subtasks.get(index) {
                    Some(subtask) => subtask.clone(),
                    None => break, // every subtask succeeded
                }
            };

            let result = self.executor.execute_subtask(&*self.shell, &subtask, &ctx).await;

            // Keep the step's counter in lockstep with the ledger.
            let error_count = self.tracker.error_count(step_id);
            if let Some(step) = task.step_mut(step_id) {
                step.error_count = error_count;
            }

            if result.success {
                index += 1;
                continue;
            }
            if result.cancelled {
                return Ok(StepVerdict::CancelTask);
            }

            let summary = self.tracker.error_summary(step_id);
            let details = serde_json::to_value(&summary).unwrap_or_default();
            let decision = self
                .escalation
                .evaluate(step_id, &task_id, error_count, details);

            if let Some(request) = &decision.request {
                self.events.publish(OpsEvent::EscalationRaised {
                    task_id: task_id.clone(),
                    step_id: step_id.to_string(),
                    request_id: request.id.clone(),
                    kind: request.kind,
                    error_count,
                    timestamp: Utc::now(),
                });
            }

            if decision.cancel_task {
                return Ok(StepVerdict::CancelTask);
            }

            match decision.kind {
                Some(EscalationType::PlanRevision) if decision.request.is_some() => {
                    let request = decision.request.expect("checked above");
                    match self.revise_step(task, step_id, &summary, &request.id).await {
                        Ok(()) => {
                            // Fresh budget, fresh subtasks, re-enter from
                            // the top of the step.
                            index = 0;
                            continue;
                        }
                        Err(e) => {
                            warn!(step_id, error = %e, "plan revision failed");
                            let _ = self.escalation.fail(&request.id, &e.to_string());
                            // Resume the loop: the ladder climbs toward
                            // human escalation and the emergency stop.
                            if self.lifecycle.lock().expect("lifecycle lock").current()
                                == AgentPhase::Escalated
                            {
                                self.advance(
                                    AgentPhase::Executing,
                                    Some("revision failed, resuming"),
                                    Some(task),
                                )?;
                            }
                            continue;
                        }
                    }
                }
                Some(EscalationType::HumanEscalation) => {
                    let acknowledged = decision
                        .request
                        .as_ref()
                        .map(|r| r.status == EscalationStatus::InProgress)
                        .unwrap_or(false);
                    if acknowledged {
                        // An operator channel took the request; the step
                        // pauses awaiting manual intervention.
                        self.advance(
                            AgentPhase::Escalated,
                            Some("awaiting human operator"),
                            Some(task),
                        )?;
                        self.fail_step(task, step_id);
                        return Ok(StepVerdict::Paused);
                    }
                    // Unattended run: keep going so the emergency-stop
                    // backstop can end the task.
                    continue;
                }
                _ => {
                    // No tier, planner notification, or a cooldown-
                    // suppressed repeat: retry the failing subtask.
                    continue;
                }
            }
        }

        // All subtasks done.
        {
            let step = task.step_mut(step_id).expect("step exists");
            step.mark_completed();
        }
        self.events.publish(OpsEvent::StepCompleted {
            task_id,
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(StepVerdict::Completed)
    }

    /// Plan-revision consumer: ask the subtask agent for a new command
    /// structure, reset the step's error budget, and resolve the request.
    async fn revise_step(
        &self,
        task: &mut Task,
        step_id: &str,
        summary: &ErrorSummary,
        request_id: &str,
    ) -> anyhow::Result<()> {
        self.advance(AgentPhase::Escalated, Some("plan revision requested"), Some(task))?;

        let step_snapshot = task.step(step_id).expect("step exists").clone();
        let revised = self
            .subtask_agent
            .revise_step(&task.id, &step_snapshot, summary)
            .await?;

        self.tracker.reset_step(step_id);
        {
            let step = task.step_mut(step_id).expect("step exists");
            step.reset_for_revision(revised);
            step.mark_started();
        }
        self.escalation
            .resolve(request_id, "step revised with a new command structure")?;
        self.events.publish(OpsEvent::EscalationResolved {
            task_id: task.id.clone(),
            request_id: request_id.to_string(),
            resolution: "plan revised".to_string(),
            timestamp: Utc::now(),
        });

        self.advance(AgentPhase::Executing, Some("revision applied"), Some(task))?;
        info!(step_id, "step re-entered with revised plan");
        Ok(())
    }

    fn fail_step(&self, task: &mut Task, step_id: &str) {
        let task_id = task.id.clone();
        if let Some(step) = task.step_mut(step_id) {
            step.mark_failed();
            let last_error = self
                .tracker
                .error_summary(step_id)
                .recent_errors
                .last()
                .cloned();
            self.events.publish(OpsEvent::StepFailed {
                task_id,
                step_id: step_id.to_string(),
                error_count: step.error_count,
                last_error,
                timestamp: Utc::now(),
            });
        }
    }

    fn finish(
        &self,
        task: &mut Task,
        phase: AgentPhase,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.advance(phase, Some(reason), Some(task))?;
        self.save_task_state(task, reason);

        let event = match phase {
            AgentPhase::Completed => OpsEvent::TaskCompleted {
                task_id: task.id.clone(),
                duration_seconds: task
                    .started_at
                    .zip(task.completed_at)
                    .map(|(s, e)| (e - s).num_seconds().max(0) as u64)
                    .unwrap_or(0),
                timestamp: Utc::now(),
            },
            AgentPhase::Cancelled => OpsEvent::TaskCancelled {
                task_id: task.id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
            _ => OpsEvent::TaskFailed {
                task_id: task.id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        };
        self.events.publish(event);
        Ok(())
    }

    /// Phase change + progress event + state mirror.
    fn advance(
        &self,
        phase: AgentPhase,
        reason: Option<&str>,
        task: Option<&Task>,
    ) -> anyhow::Result<()> {
        self.lifecycle
            .lock()
            .expect("lifecycle lock")
            .advance(phase, reason)?;

        self.state.set_state(
            StateChannel::Agent,
            serde_json::json!({ "phase": phase.to_string() }),
            reason.unwrap_or("phase change"),
        );
        if let Some(task) = task {
            self.events.publish(OpsEvent::PhaseChanged {
                task_id: task.id.clone(),
                phase: phase.to_string(),
                timestamp: Utc::now(),
            });
            self.publish_progress(task, None, reason.unwrap_or(""));
        }
        Ok(())
    }

    fn publish_progress(&self, task: &Task, step_id: Option<&str>, message: &str) {
        let phase = self.lifecycle.lock().expect("lifecycle lock").current();
        self.events.publish(OpsEvent::Progress {
            task_id: task.id.clone(),
            phase: phase.to_string(),
            step_id: step_id.map(String::from),
            progress_percentage: task.progress().percent,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn save_task_state(&self, task: &Task, reason: &str) {
        match serde_json::to_value(task) {
            Ok(value) => self.state.set_state(StateChannel::Task, value, reason),
            Err(e) => warn!(error = %e, "task state not serializable"),
        }
    }

    fn report(&self, task: &Task, dry_run: bool) -> TaskReport {
        let steps = task
            .steps
            .iter()
            .map(|step| StepReport {
                step_id: step.id.clone(),
                title: step.title.clone(),
                status: step.status,
                error_count: step.error_count,
                last_error: self
                    .tracker
                    .error_summary(&step.id)
                    .recent_errors
                    .last()
                    .cloned(),
            })
            .collect();

        let mut escalations = Vec::new();
        for step in &task.steps {
            escalations.extend(self.escalation.requests_for_step(&step.id));
        }
        escalations.sort_by_key(|r| r.timestamp);

        TaskReport {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            dry_run,
            steps,
            escalations,
            started_at: task.started_at,
            completed_at: task.completed_at,
            lifecycle: self.lifecycle.lock().expect("lifecycle lock").summary(),
        }
    }

    /// Stop the autosave loop (with a final save) and close the
    /// transport. Safe to call more than once.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Err(e) = self.state.stop().await {
            warn!(error = %e, "final state save failed");
        }
        self.shell.disconnect().await?;
        Ok(())
    }
}
