//! End-to-end pipeline scenarios: a scripted model and a scripted shell
//! drive the coordinator through planning, execution, autocorrection,
//! and the escalation ladder.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ops_agents::config::AgentConfig;
use ops_agents::coordinator::Coordinator;
use ops_agents::model::{Completion, CompletionRequest, ModelClient, ModelError};
use ops_agents::planner::PlanningContext;
use oversight::{
    EscalationStatus, EscalationType, ExecError, ExecOutcome, PolicyConfig, RemoteShell,
    StepStatus, TaskStatus,
};

/// Routes prompts to canned answers by the markers each agent puts in
/// its prompt text.
struct ScriptedModel {
    plan: String,
    scratch: String,
    revision: String,
    parameters: String,
    rewrite: String,
}

impl ScriptedModel {
    fn new() -> Self {
        Self {
            plan: r#"{"steps":[]}"#.into(),
            scratch: r#"{"subtasks":[]}"#.into(),
            revision: r#"{"subtasks":[]}"#.into(),
            parameters: r#"{"parameters":{}}"#.into(),
            rewrite: "NONE".into(),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ModelError> {
        let content = if request.prompt.contains("PLANNING REQUIREMENTS") {
            self.plan.clone()
        } else if request.prompt.contains("PREVIOUS FAILURES") {
            self.revision.clone()
        } else if request.prompt.contains("Produce the shell commands") {
            self.scratch.clone()
        } else if request.prompt.contains("provide values for the") {
            self.parameters.clone()
        } else {
            self.rewrite.clone()
        };
        Ok(Completion {
            content,
            model: "scripted".into(),
            prompt_tokens: None,
            completion_tokens: None,
            duration: Duration::ZERO,
        })
    }
}

/// Scripted shell: per-command outcome queues, persistent failures, and
/// connection bookkeeping. Unknown commands succeed.
struct ScriptedShell {
    queues: Mutex<HashMap<String, Vec<ExecOutcome>>>,
    always_fail: Mutex<HashMap<String, (String, i32)>>,
    executed: Mutex<Vec<String>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl ScriptedShell {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    fn queue(self, command: &str, stdout: &str, stderr: &str, exit_code: i32) -> Self {
        self.queues
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push(ExecOutcome {
                stdout: stdout.into(),
                stderr: stderr.into(),
                exit_code,
                duration: Duration::from_millis(2),
            });
        self
    }

    fn fail_always(self, command: &str, stderr: &str, exit_code: i32) -> Self {
        self.always_fail
            .lock()
            .unwrap()
            .insert(command.to_string(), (stderr.to_string(), exit_code));
        self
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn connect(&self) -> Result<(), ExecError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, command: &str, _timeout: Duration) -> Result<ExecOutcome, ExecError> {
        self.executed.lock().unwrap().push(command.to_string());

        if let Some((stderr, exit_code)) = self.always_fail.lock().unwrap().get(command) {
            return Ok(ExecOutcome {
                stdout: String::new(),
                stderr: stderr.clone(),
                exit_code: *exit_code,
                duration: Duration::from_millis(2),
            });
        }
        if let Some(queue) = self.queues.lock().unwrap().get_mut(command) {
            if !queue.is_empty() {
                return Ok(queue.remove(0));
            }
        }
        Ok(ExecOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::from_millis(1),
        })
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn one_step_plan(title: &str, description: &str) -> String {
    format!(
        r#"{{"steps":[{{"title":"{title}","description":"{description}","priority":"high","estimated_duration":5,"dependencies":[]}}]}}"#
    )
}

fn scratch_subtask(title: &str, command: &str) -> String {
    format!(
        r#"{{"subtasks":[{{"title":"{title}","commands":["{command}"],"health_checks":[],"rollback_commands":[]}}]}}"#
    )
}

fn test_config(dir: &tempfile::TempDir, policy: PolicyConfig) -> AgentConfig {
    let mut config = AgentConfig::from_env();
    config.policy = policy;
    config.os_type = "ubuntu".into();
    config.state_path = PathBuf::from(dir.path().join("state.json"));
    config
}

async fn run(
    model: ScriptedModel,
    shell: Arc<ScriptedShell>,
    policy: PolicyConfig,
    task: &str,
) -> (ops_agents::coordinator::TaskReport, Coordinator) {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(test_config(&dir, policy), shell, Arc::new(model));
    coordinator.initialize().await.unwrap();
    let report = coordinator
        .execute_task(task, Some(&PlanningContext::default()), false)
        .await
        .unwrap();
    (report, coordinator)
}

#[tokio::test]
async fn single_step_happy_path() {
    // "Update package lists" matches the update_packages template:
    // sudo apt update + an apt-get check health probe.
    let mut model = ScriptedModel::new();
    model.plan = one_step_plan("Update package lists", "refresh the apt package index");

    let shell = Arc::new(ScriptedShell::new());
    let (report, coordinator) = run(model, shell.clone(), PolicyConfig::default(),
        "Update package lists").await;

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].status, StepStatus::Completed);

    let step_id = &report.steps[0].step_id;
    let tracker = coordinator.tracker();
    assert_eq!(tracker.attempt_count(step_id), 1, "one mutating command");
    assert_eq!(tracker.error_count(step_id), 0);
    assert!(shell.executed().contains(&"sudo apt update".to_string()));
    // Transport closed on the way out.
    assert_eq!(shell.connects.load(Ordering::SeqCst), 1);
    assert_eq!(shell.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forbidden_generated_plan_never_reaches_the_host() {
    let mut model = ScriptedModel::new();
    model.plan = one_step_plan("Wipe all data", "remove every file permanently");
    model.scratch = scratch_subtask("wipe", "rm -rf /");

    let shell = Arc::new(ScriptedShell::new());
    let (report, _) = run(model, shell.clone(), PolicyConfig::default(), "Wipe all data").await;

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert!(shell.executed().is_empty(), "no Execute calls at all");
}

#[tokio::test]
async fn autocorrection_recovers_permission_denied() {
    let mut model = ScriptedModel::new();
    model.plan = one_step_plan(
        "Clear the local archive cache",
        "run privileged cache maintenance",
    );
    model.scratch = scratch_subtask("clear cache", "apt-get clean");

    let shell = Arc::new(
        ScriptedShell::new().queue("apt-get clean", "", "E: Permission denied", 100),
    );
    let (report, coordinator) = run(
        model,
        shell.clone(),
        PolicyConfig::default(),
        "Clear the local archive cache",
    )
    .await;

    assert_eq!(report.status, TaskStatus::Completed);
    let step_id = &report.steps[0].step_id;
    let tracker = coordinator.tracker();
    assert_eq!(tracker.attempt_count(step_id), 2);
    assert_eq!(tracker.error_count(step_id), 1);
    assert_eq!(
        shell.executed(),
        vec!["apt-get clean", "sudo apt-get clean"]
    );

    let attempts = tracker.attempts(step_id);
    assert!(attempts[1].autocorrection_used);
    assert!(attempts[1].success);
}

#[tokio::test]
async fn escalation_ladder_notifies_then_revises() {
    // The command fails with an uncorrectable error; at T1=4 the planner
    // is notified once, at T1+1 a plan revision lands and the step's
    // budget resets; the revised command succeeds.
    let mut model = ScriptedModel::new();
    model.plan = one_step_plan("Rotate application logs", "rotate and compress app logs");
    model.scratch = scratch_subtask("rotate", "logrotate /etc/logrotate.d/app");
    model.revision = scratch_subtask("rotate with force", "logrotate --force /etc/app.conf");

    let shell = Arc::new(ScriptedShell::new().fail_always(
        "logrotate /etc/logrotate.d/app",
        "inscrutable failure",
        1,
    ));
    let (report, coordinator) = run(
        model,
        shell.clone(),
        PolicyConfig::default(),
        "Rotate application logs",
    )
    .await;

    assert_eq!(report.status, TaskStatus::Completed);

    let step_id = &report.steps[0].step_id;
    let escalation = coordinator.escalation();
    let requests = escalation.requests_for_step(step_id);

    let notifications: Vec<_> = requests
        .iter()
        .filter(|r| r.kind == EscalationType::PlannerNotification)
        .collect();
    assert_eq!(notifications.len(), 1, "cooldown blocks duplicates");
    assert_eq!(notifications[0].error_count, 4);
    assert_eq!(notifications[0].status, EscalationStatus::Pending);

    let revisions: Vec<_> = requests
        .iter()
        .filter(|r| r.kind == EscalationType::PlanRevision)
        .collect();
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].status, EscalationStatus::Resolved);

    // Scenario 5: revision resets the budget — a fresh attempt sequence,
    // no carryover of the old error count.
    let tracker = coordinator.tracker();
    assert_eq!(tracker.error_count(step_id), 0);
    let attempts = tracker.attempts(step_id);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].command, "logrotate --force /etc/app.conf");
    assert_eq!(report.steps[0].error_count, 0);
}

#[tokio::test]
async fn emergency_stop_cancels_the_task() {
    // T_human=6, T3=8. Revisions keep producing a forbidden command, so
    // the revision tier fails; with no human operator attached the run
    // continues until the emergency stop fires at 8 errors.
    let mut model = ScriptedModel::new();
    model.plan = format!(
        r#"{{"steps":[
            {{"title":"Rotate application logs","description":"rotate and compress app logs","priority":"high","estimated_duration":5,"dependencies":[]}},
            {{"title":"Compress old archives","description":"gzip rotated archives","priority":"low","estimated_duration":5,"dependencies":[0]}}
        ]}}"#
    );
    model.scratch = scratch_subtask("rotate", "logrotate /etc/logrotate.d/app");
    model.revision = scratch_subtask("wipe", "rm -rf /");

    let shell = Arc::new(ScriptedShell::new().fail_always(
        "logrotate /etc/logrotate.d/app",
        "inscrutable failure",
        1,
    ));
    let (report, coordinator) = run(
        model,
        shell.clone(),
        PolicyConfig::default(),
        "Rotate application logs",
    )
    .await;

    assert_eq!(report.status, TaskStatus::Cancelled);

    let step_id = &report.steps[0].step_id;
    let requests = coordinator.escalation().requests_for_step(step_id);
    assert!(requests
        .iter()
        .any(|r| r.kind == EscalationType::EmergencyStop));
    assert_eq!(coordinator.tracker().error_count(step_id), 8);

    // No further steps execute after the stop.
    assert_eq!(report.steps[1].status, StepStatus::Pending);
    assert!(!shell
        .executed()
        .iter()
        .any(|c| c.contains("gzip")));
    // The transport is closed on the cancellation path too.
    assert_eq!(shell.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acknowledged_human_escalation_pauses_the_step() {
    let mut model = ScriptedModel::new();
    model.plan = one_step_plan("Rotate application logs", "rotate and compress app logs");
    model.scratch = scratch_subtask("rotate", "logrotate /etc/logrotate.d/app");
    model.revision = scratch_subtask("wipe", "rm -rf /");

    let shell = Arc::new(ScriptedShell::new().fail_always(
        "logrotate /etc/logrotate.d/app",
        "inscrutable failure",
        1,
    ));

    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        test_config(&dir, PolicyConfig::default()),
        shell.clone(),
        Arc::new(model),
    );
    // An operator channel acknowledges human escalations.
    coordinator.escalation().register_handler(
        EscalationType::HumanEscalation,
        Box::new(|_request| Ok(())),
    );

    coordinator.initialize().await.unwrap();
    let report = coordinator
        .execute_task("Rotate application logs", None, false)
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    let step_id = &report.steps[0].step_id;
    let requests = coordinator.escalation().requests_for_step(step_id);
    let human: Vec<_> = requests
        .iter()
        .filter(|r| r.kind == EscalationType::HumanEscalation)
        .collect();
    assert_eq!(human.len(), 1);
    assert_eq!(human[0].status, EscalationStatus::InProgress);
    // Paused before the emergency-stop tier.
    assert!(coordinator.tracker().error_count(step_id) < 8);
}

#[tokio::test]
async fn dry_run_plans_and_records_without_executing() {
    let mut model = ScriptedModel::new();
    model.plan = one_step_plan("Update package lists", "refresh the apt package index");

    let shell = Arc::new(ScriptedShell::new());
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        test_config(&dir, PolicyConfig::default()),
        shell.clone(),
        Arc::new(model),
    );
    coordinator.initialize().await.unwrap();
    let report = coordinator
        .execute_task("Update package lists", None, true)
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Completed);
    assert!(report.dry_run);
    assert!(shell.executed().is_empty());
    // Recording continues in dry-run.
    assert_eq!(
        coordinator.tracker().attempt_count(&report.steps[0].step_id),
        1
    );
}

#[tokio::test]
async fn persisted_state_reflects_the_finished_task() {
    let mut model = ScriptedModel::new();
    model.plan = one_step_plan("Update package lists", "refresh the apt package index");

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, PolicyConfig::default());
    let state_path = config.state_path.clone();

    let coordinator = Coordinator::new(config, Arc::new(ScriptedShell::new()), Arc::new(model));
    coordinator.initialize().await.unwrap();
    let report = coordinator
        .execute_task("Update package lists", None, false)
        .await
        .unwrap();
    assert_eq!(report.status, TaskStatus::Completed);

    // A fresh manager loads the document the coordinator saved.
    let state = oversight::StateManager::new(state_path);
    assert!(state.load().unwrap());
    let task = state.get_state(oversight::StateChannel::Task).unwrap();
    assert_eq!(task["status"], serde_json::json!("completed"));
    assert_eq!(task["title"], serde_json::json!("Update package lists"));
}
