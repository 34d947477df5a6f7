//! The subtask agent: expands one step into validated command chains.
//!
//! When a step matches a template, the model only fills the template's
//! parameters; otherwise it proposes subtasks from scratch under a
//! strict JSON contract. Every admitted command passes the safety gate
//! first — a rejected command is replaced by a rule-based correction or
//! the whole generation fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use oversight::tracker::ErrorSummary;
use oversight::{AutocorrectionEngine, CommandValidator, Failure, Step, Subtask, ValidationContext};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::model::{CompletionRequest, ModelClient, ModelError};
use crate::templates::{MissingParameter, TemplateLibrary};

#[derive(Debug, thiserror::Error)]
pub enum SubtaskError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model response contains no JSON object")]
    NoJsonObject,

    #[error("subtask JSON is invalid: {0}")]
    InvalidJson(String),

    #[error("model produced no subtasks for step '{0}'")]
    EmptySubtasks(String),

    #[error(transparent)]
    Template(#[from] MissingParameter),

    #[error("command rejected by validator and not correctable: '{command}' ({errors:?})")]
    RejectedCommand {
        command: String,
        errors: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct SubtasksSpec {
    subtasks: Vec<SubtaskSpec>,
}

#[derive(Debug, Deserialize)]
struct SubtaskSpec {
    title: String,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    health_checks: Vec<String>,
    #[serde(default)]
    rollback_commands: Vec<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ParametersSpec {
    parameters: HashMap<String, String>,
}

/// LLM-backed subtask generator with a template fast path.
pub struct SubtaskAgent {
    model: Arc<dyn ModelClient>,
    validator: Arc<CommandValidator>,
    autocorrect: Arc<AutocorrectionEngine>,
    templates: TemplateLibrary,
    os_type: String,
    model_timeout: Duration,
    command_timeout: Duration,
}

impl SubtaskAgent {
    pub fn new(
        model: Arc<dyn ModelClient>,
        validator: Arc<CommandValidator>,
        autocorrect: Arc<AutocorrectionEngine>,
        os_type: impl Into<String>,
        model_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            model,
            validator,
            autocorrect,
            templates: TemplateLibrary::builtin(),
            os_type: os_type.into(),
            model_timeout,
            command_timeout,
        }
    }

    /// Expand a step into an ordered subtask list.
    pub async fn plan_subtasks(
        &self,
        task_id: &str,
        step: &Step,
    ) -> Result<Vec<Subtask>, SubtaskError> {
        let step_text = format!("{} {}", step.title, step.description);

        let mut subtasks = match self.templates.best_match(&step_text, &self.os_type) {
            Some(template) => {
                debug!(step_id = %step.id, template = %template.name, "template matched");
                let parameters = if template.parameters.is_empty() {
                    HashMap::new()
                } else {
                    self.fill_parameters(step, template.name.as_str(), &template.parameters)
                        .await?
                };
                let filled = template.instantiate(&parameters)?;
                vec![Subtask::new(step.id.clone(), filled.name)
                    .with_commands(filled.commands)
                    .with_health_checks(filled.health_checks)
                    .with_rollback(filled.rollback_commands)
                    .with_timeout(self.command_timeout)]
            }
            None => self.generate_from_scratch(step, None).await?,
        };

        for subtask in &mut subtasks {
            self.gate_subtask(task_id, subtask).await?;
        }

        info!(
            step_id = %step.id,
            subtasks = subtasks.len(),
            "subtasks planned"
        );
        Ok(subtasks)
    }

    /// Plan-revision path: regenerate the step's command structure given
    /// its error history. Templates are bypassed — the template already
    /// failed this step.
    pub async fn revise_step(
        &self,
        task_id: &str,
        step: &Step,
        errors: &ErrorSummary,
    ) -> Result<Vec<Subtask>, SubtaskError> {
        let mut subtasks = self.generate_from_scratch(step, Some(errors)).await?;
        for subtask in &mut subtasks {
            self.gate_subtask(task_id, subtask).await?;
        }
        info!(step_id = %step.id, subtasks = subtasks.len(), "step revised");
        Ok(subtasks)
    }

    async fn fill_parameters(
        &self,
        step: &Step,
        template_name: &str,
        parameters: &[String],
    ) -> Result<HashMap<String, String>, SubtaskError> {
        let prompt = format!(
            "For the server administration step below, provide values for the \
             listed parameters.\n\
             \n\
             STEP: {title}\n\
             DETAILS: {description}\n\
             TEMPLATE: {template_name}\n\
             PARAMETERS: {params}\n\
             \n\
             ANSWER FORMAT (strict JSON, nothing else):\n\
             {{ \"parameters\": {{ \"name\": \"value\" }} }}",
            title = step.title,
            description = step.description,
            params = parameters.join(", "),
        );
        let request = CompletionRequest::new(prompt)
            .with_system("You parameterize command templates. Strict JSON only.")
            .with_temperature(0.1)
            .with_timeout(self.model_timeout);

        let completion = self.model.complete(request).await?;
        let spec: ParametersSpec = parse_json(&completion.content)?;
        Ok(spec.parameters)
    }

    async fn generate_from_scratch(
        &self,
        step: &Step,
        errors: Option<&ErrorSummary>,
    ) -> Result<Vec<Subtask>, SubtaskError> {
        let mut prompt = format!(
            "Produce the shell commands for one step of a server administration \
             task on {os}.\n\
             \n\
             STEP: {title}\n\
             DETAILS: {description}\n\
             \n\
             RULES:\n\
             1. Group commands into one or more subtasks, executed in order.\n\
             2. Each subtask carries mutating `commands`, verification \
             `health_checks`, and `rollback_commands` run only on failure.\n\
             3. Prefer idempotent commands; never use destructive commands.\n\
             \n\
             ANSWER FORMAT (strict JSON, nothing else):\n\
             {{ \"subtasks\": [ {{ \"title\": \"...\", \"commands\": [\"...\"], \
             \"health_checks\": [\"...\"], \"rollback_commands\": [\"...\"], \
             \"timeout_seconds\": 30 }} ] }}",
            os = self.os_type,
            title = step.title,
            description = step.description,
        );

        if let Some(summary) = errors {
            prompt.push_str("\n\nPREVIOUS FAILURES (avoid repeating these):\n");
            for message in &summary.recent_errors {
                prompt.push_str(&format!("- {message}\n"));
            }
            prompt.push_str(
                "The previous command structure failed; propose a different approach.",
            );
        }

        let request = CompletionRequest::new(prompt)
            .with_system(
                "You write safe, idempotent Linux shell command plans. Strict JSON only.",
            )
            .with_temperature(0.2)
            .with_timeout(self.model_timeout);

        let completion = self.model.complete(request).await?;
        let spec: SubtasksSpec = parse_json(&completion.content)?;
        if spec.subtasks.is_empty() {
            return Err(SubtaskError::EmptySubtasks(step.title.clone()));
        }

        Ok(spec
            .subtasks
            .into_iter()
            .map(|s| {
                let timeout = s
                    .timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(self.command_timeout);
                Subtask::new(step.id.clone(), s.title)
                    .with_commands(s.commands)
                    .with_health_checks(s.health_checks)
                    .with_rollback(s.rollback_commands)
                    .with_timeout(timeout)
            })
            .collect())
    }

    /// Run every command group through the validator; replace rejected
    /// commands with rule-based corrections or fail the generation.
    async fn gate_subtask(&self, task_id: &str, subtask: &mut Subtask) -> Result<(), SubtaskError> {
        let ctx = ValidationContext {
            step_id: Some(subtask.step_id.clone()),
            task_id: Some(task_id.to_string()),
        };

        for group in [
            &mut subtask.commands,
            &mut subtask.health_checks,
            &mut subtask.rollback_commands,
        ] {
            for command in group.iter_mut() {
                let report = self.validator.validate(command, Some(&ctx));
                if report.valid {
                    continue;
                }

                let correction = {
                    let reasons = report.errors.join("; ");
                    let failure = Failure {
                        command: command.as_str(),
                        stderr: &reasons,
                        exit_code: None,
                    };
                    self.autocorrect.correct(&failure, false).await
                };
                match correction {
                    Some(correction)
                        if self.validator.validate(&correction.command, Some(&ctx)).valid =>
                    {
                        warn!(
                            rejected = %command,
                            replacement = %correction.command,
                            "generated command replaced by correction"
                        );
                        *command = correction.command;
                    }
                    _ => {
                        return Err(SubtaskError::RejectedCommand {
                            command: command.clone(),
                            errors: report.errors,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, SubtaskError> {
    let start = content.find('{').ok_or(SubtaskError::NoJsonObject)?;
    let end = content.rfind('}').ok_or(SubtaskError::NoJsonObject)?;
    if end < start {
        return Err(SubtaskError::NoJsonObject);
    }
    serde_json::from_str(&content[start..=end]).map_err(|e| SubtaskError::InvalidJson(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Completion;
    use async_trait::async_trait;
    use oversight::{EscalationLevel, PackageManager};

    struct CannedModel(String);

    #[async_trait]
    impl ModelClient for CannedModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ModelError> {
            Ok(Completion {
                content: self.0.clone(),
                model: "stub".into(),
                prompt_tokens: None,
                completion_tokens: None,
                duration: Duration::ZERO,
            })
        }
    }

    fn agent(model_json: &str) -> SubtaskAgent {
        SubtaskAgent::new(
            Arc::new(CannedModel(model_json.to_string())),
            Arc::new(CommandValidator::with_defaults()),
            Arc::new(AutocorrectionEngine::new(PackageManager::Apt)),
            "ubuntu",
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    fn step(title: &str, description: &str) -> Step {
        Step::new(title, description)
    }

    #[tokio::test]
    async fn template_path_parameterizes_install() {
        let agent = agent(r#"{"parameters": {"package_name": "nginx"}}"#);
        let step = step("Install nginx package", "install the nginx web server package");

        let subtasks = agent.plan_subtasks("task-1", &step).await.unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(
            subtasks[0].commands,
            vec!["sudo apt update", "sudo apt install -y nginx"]
        );
        assert_eq!(subtasks[0].health_checks, vec!["dpkg -s nginx"]);
        assert_eq!(subtasks[0].rollback_commands, vec!["sudo apt remove -y nginx"]);
        assert_eq!(subtasks[0].step_id, step.id);
    }

    #[tokio::test]
    async fn scratch_path_parses_model_subtasks() {
        let agent = agent(
            r#"{"subtasks": [{"title": "tune kernel", "commands": ["sysctl -w vm.swappiness=10"],
                "health_checks": ["sysctl vm.swappiness"], "rollback_commands": [],
                "timeout_seconds": 15}]}"#,
        );
        let step = step("Tune kernel swappiness", "lower swappiness for the database host");

        let subtasks = agent.plan_subtasks("task-1", &step).await.unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].timeout, Duration::from_secs(15));
        assert_eq!(subtasks[0].commands, vec!["sysctl -w vm.swappiness=10"]);
    }

    #[tokio::test]
    async fn forbidden_generated_command_fails_generation() {
        let agent = agent(
            r#"{"subtasks": [{"title": "wipe", "commands": ["rm -rf /"],
                "health_checks": [], "rollback_commands": []}]}"#,
        );
        let step = step("Free disk space aggressively", "remove every file on the system");

        let err = agent.plan_subtasks("task-1", &step).await.unwrap_err();
        assert!(matches!(err, SubtaskError::RejectedCommand { .. }));
    }

    #[tokio::test]
    async fn empty_generation_is_an_error() {
        let agent = agent(r#"{"subtasks": []}"#);
        let step = step("Do something unusual", "no template matches this text");
        assert!(matches!(
            agent.plan_subtasks("task-1", &step).await.unwrap_err(),
            SubtaskError::EmptySubtasks(_)
        ));
    }

    #[tokio::test]
    async fn revision_bypasses_templates() {
        // Step text matches the install template, but revision must go to
        // the model for a fresh structure.
        let agent = agent(
            r#"{"subtasks": [{"title": "install from backports",
                "commands": ["sudo apt install -y -t bookworm-backports nginx"],
                "health_checks": ["dpkg -s nginx"], "rollback_commands": []}]}"#,
        );
        let step = step("Install nginx package", "install the nginx web server package");
        let summary = ErrorSummary {
            step_id: step.id.clone(),
            error_count: 5,
            total_attempts: 5,
            success_rate: 0.0,
            escalation_level: EscalationLevel::PlannerNotification,
            error_patterns: Default::default(),
            last_error_timestamp: None,
            recent_errors: vec!["E: Unable to locate package nginx".to_string()],
        };

        let subtasks = agent.revise_step("task-1", &step, &summary).await.unwrap();
        assert_eq!(subtasks.len(), 1);
        assert!(subtasks[0].commands[0].contains("backports"));
    }
}
