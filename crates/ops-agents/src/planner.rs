//! The task agent: turns a free-text task into a validated, ordered
//! step graph.
//!
//! The model is asked for strict JSON with integer-index dependencies;
//! the agent trims surrounding noise, parses, resolves indices to step
//! ids in a second pass, validates the DAG, and topologically sorts with
//! priority tie-breaking. Planning never executes anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use oversight::{PolicyConfig, Priority, Step, Task};
use serde::Deserialize;
use tracing::{debug, info};

use crate::model::{CompletionRequest, ModelClient, ModelError};

/// Server facts, constraints, and tool inventory woven into the prompt.
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    pub server_info: HashMap<String, String>,
    pub constraints: Vec<String>,
    pub available_tools: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model response contains no JSON object")]
    NoJsonObject,

    #[error("plan JSON is invalid: {0}")]
    InvalidJson(String),

    #[error("plan contains no steps")]
    EmptyPlan,

    #[error("plan has {got} steps, maximum is {max}")]
    TooManySteps { got: usize, max: usize },

    #[error("step {step_index} depends on unknown step index {dependency}")]
    UnknownDependency {
        step_index: usize,
        dependency: usize,
    },

    #[error("step {step_index} depends on itself")]
    SelfDependency { step_index: usize },

    #[error("dependency graph contains a cycle")]
    CyclicDependencies,

    #[error("no step is free of dependencies; the plan cannot start")]
    NoRootStep,
}

#[derive(Debug, Deserialize)]
struct PlanSpec {
    steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    title: String,
    description: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default = "default_duration")]
    estimated_duration: u32,
    #[serde(default)]
    dependencies: Vec<usize>,
}

fn default_duration() -> u32 {
    5
}

/// LLM-backed planner.
pub struct TaskAgent {
    model: Arc<dyn ModelClient>,
    policy: PolicyConfig,
    model_timeout: Duration,
}

impl TaskAgent {
    pub fn new(model: Arc<dyn ModelClient>, policy: PolicyConfig, model_timeout: Duration) -> Self {
        Self {
            model,
            policy,
            model_timeout,
        }
    }

    pub async fn plan_task(
        &self,
        description: &str,
        context: Option<&PlanningContext>,
    ) -> Result<Task, PlanningError> {
        let prompt = self.build_prompt(description, context);
        let request = CompletionRequest::new(prompt)
            .with_system(
                "You are an expert at planning administrative tasks on Linux servers. \
                 Always answer with strict JSON, no commentary.",
            )
            .with_temperature(0.2)
            .with_timeout(self.model_timeout);

        let completion = self.model.complete(request).await?;
        debug!(
            model = %completion.model,
            chars = completion.content.len(),
            "plan response received"
        );

        let spec = parse_plan(&completion.content)?;
        let task = self.build_task(description, spec)?;
        info!(
            task_id = %task.id,
            steps = task.steps.len(),
            estimated_minutes = task.total_estimated_duration,
            "task planned"
        );
        Ok(task)
    }

    fn build_prompt(&self, description: &str, context: Option<&PlanningContext>) -> String {
        let mut prompt = format!(
            "Break the following server administration task into logical steps.\n\
             \n\
             TASK: {description}\n\
             \n\
             PLANNING REQUIREMENTS:\n\
             1. Use between 3 and {max} steps; each step must be concrete and executable.\n\
             2. Express dependencies between steps by INDEX (0, 1, 2, ...), never by title.\n\
             3. Estimate each step's duration in whole minutes.\n\
             4. Assign each step a priority from: low, medium, high, critical.\n\
             5. Prefer idempotent steps (safe to run twice).\n\
             \n\
             ANSWER FORMAT (strict JSON, nothing else):\n\
             {{\n\
             \x20 \"steps\": [\n\
             \x20   {{\n\
             \x20     \"title\": \"Step title\",\n\
             \x20     \"description\": \"What the step does and how\",\n\
             \x20     \"priority\": \"high\",\n\
             \x20     \"estimated_duration\": 15,\n\
             \x20     \"dependencies\": [0, 1]\n\
             \x20   }}\n\
             \x20 ]\n\
             }}\n",
            max = self.policy.max_steps
        );

        if let Some(ctx) = context {
            prompt.push_str("\nCONTEXT:\n");
            if !ctx.server_info.is_empty() {
                let mut info: Vec<_> = ctx
                    .server_info
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                info.sort();
                prompt.push_str(&format!("Server: {}\n", info.join(", ")));
            }
            if !ctx.constraints.is_empty() {
                prompt.push_str(&format!("Constraints: {}\n", ctx.constraints.join("; ")));
            }
            if !ctx.available_tools.is_empty() {
                prompt.push_str(&format!(
                    "Available tools: {}\n",
                    ctx.available_tools.join(", ")
                ));
            }
        }

        prompt
    }

    /// First pass creates steps with generated ids; the second rewrites
    /// integer dependencies into those ids; then validation and ordering.
    fn build_task(&self, description: &str, spec: PlanSpec) -> Result<Task, PlanningError> {
        let max = self.policy.max_steps as usize;
        if spec.steps.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }
        if spec.steps.len() > max {
            return Err(PlanningError::TooManySteps {
                got: spec.steps.len(),
                max,
            });
        }

        validate_dependencies(&spec)?;

        let mut task = Task::new(extract_title(description), description);

        let mut steps: Vec<Step> = spec
            .steps
            .iter()
            .map(|s| {
                let mut step = Step::new(s.title.clone(), s.description.clone())
                    .with_priority(s.priority)
                    .with_estimated_duration(s.estimated_duration);
                step.max_errors = self.policy.error_threshold_per_step;
                step
            })
            .collect();

        let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        for (step, spec_step) in steps.iter_mut().zip(&spec.steps) {
            step.depends_on = spec_step
                .dependencies
                .iter()
                .map(|&i| ids[i].clone())
                .collect();
        }

        let order = topological_order(&spec)?;
        task.execution_order = order.into_iter().map(|i| ids[i].clone()).collect();
        task.total_estimated_duration = steps.iter().map(|s| s.estimated_duration).sum();
        task.priority = steps
            .iter()
            .map(|s| s.priority)
            .max()
            .unwrap_or(Priority::Medium);
        task.steps = steps;
        Ok(task)
    }
}

fn extract_title(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or(description).trim();
    if first_line.chars().count() <= 60 {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(57).collect();
        format!("{truncated}...")
    }
}

/// Trim leading/trailing non-JSON text and parse. The core does not try
/// to repair malformed JSON beyond this.
fn parse_plan(content: &str) -> Result<PlanSpec, PlanningError> {
    let start = content.find('{').ok_or(PlanningError::NoJsonObject)?;
    let end = content.rfind('}').ok_or(PlanningError::NoJsonObject)?;
    if end < start {
        return Err(PlanningError::NoJsonObject);
    }
    serde_json::from_str(&content[start..=end])
        .map_err(|e| PlanningError::InvalidJson(e.to_string()))
}

fn validate_dependencies(spec: &PlanSpec) -> Result<(), PlanningError> {
    let len = spec.steps.len();
    let mut has_root = false;

    for (index, step) in spec.steps.iter().enumerate() {
        for &dep in &step.dependencies {
            if dep >= len {
                return Err(PlanningError::UnknownDependency {
                    step_index: index,
                    dependency: dep,
                });
            }
            if dep == index {
                return Err(PlanningError::SelfDependency { step_index: index });
            }
        }
        if step.dependencies.is_empty() {
            has_root = true;
        }
    }

    if !has_root {
        return Err(PlanningError::NoRootStep);
    }

    detect_cycles(spec)?;
    Ok(())
}

/// Tricolor depth-first search: white (unvisited), grey (on the current
/// path), black (finished). A grey→grey edge is a cycle.
fn detect_cycles(spec: &PlanSpec) -> Result<(), PlanningError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(node: usize, spec: &PlanSpec, marks: &mut [Mark]) -> bool {
        marks[node] = Mark::Grey;
        for &dep in &spec.steps[node].dependencies {
            match marks[dep] {
                Mark::Grey => return true,
                Mark::White => {
                    if visit(dep, spec, marks) {
                        return true;
                    }
                }
                Mark::Black => {}
            }
        }
        marks[node] = Mark::Black;
        false
    }

    let mut marks = vec![Mark::White; spec.steps.len()];
    for node in 0..spec.steps.len() {
        if marks[node] == Mark::White && visit(node, spec, &mut marks) {
            return Err(PlanningError::CyclicDependencies);
        }
    }
    Ok(())
}

/// Deterministic topological order: among ready steps pick the highest
/// priority, then the lowest insertion index.
fn topological_order(spec: &PlanSpec) -> Result<Vec<usize>, PlanningError> {
    let len = spec.steps.len();
    let mut remaining_deps: Vec<usize> = spec.steps.iter().map(|s| s.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); len];
    for (index, step) in spec.steps.iter().enumerate() {
        for &dep in &step.dependencies {
            dependents[dep].push(index);
        }
    }

    let mut placed = vec![false; len];
    let mut order = Vec::with_capacity(len);

    while order.len() < len {
        let next = (0..len)
            .filter(|&i| !placed[i] && remaining_deps[i] == 0)
            .max_by(|&a, &b| {
                spec.steps[a]
                    .priority
                    .cmp(&spec.steps[b].priority)
                    .then(b.cmp(&a))
            })
            .ok_or(PlanningError::CyclicDependencies)?;

        placed[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            remaining_deps[dependent] -= 1;
        }
    }

    Ok(order)
}
