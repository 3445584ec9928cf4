//! YAML schema types for workflow templates.
//!
//! A template defines a quality-gated document pipeline:
//!
//! ```yaml
//! name: "greenfield-fullstack"
//! description: "PRD → architecture → stories, each behind a gate"
//! version: "1.0"
//!
//! steps:
//!   - id: "prd"
//!     role: "pm"
//!     task: "create-prd"
//!     output_path: "docs/prd.md"
//!     quality_gate: "pm-checklist"
//!
//!   - id: "architecture"
//!     role: "architect"
//!     task: "create-architecture"
//!     output_path: "docs/architecture.md"
//!     dependencies: ["prd"]
//!     quality_gate: "architect-checklist"
//!     rework_target: "prd"
//!     condition:
//!       result: "${steps.prd.output}"
//! ```

use serde::{Deserialize, Serialize};

/// Branch condition attached to a step. Each field is independently
/// optional; all present conditions must hold for the step to run. The
/// dependency condition is the step's `dependencies` list itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepCondition {
    /// Run-context key that must be present and truthy.
    #[serde(default)]
    pub context: Option<String>,

    /// Expression over prior step outputs; supports
    /// `${steps.<id>.output}` references. Must resolve to a non-empty
    /// value other than "false".
    #[serde(default)]
    pub result: Option<String>,

    /// Deadline in seconds measured from run start. A lapsed deadline
    /// skips the step (with a timeout annotation), it never fails it.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl StepCondition {
    pub fn is_empty(&self) -> bool {
        self.context.is_none() && self.result.is_none() && self.deadline_secs.is_none()
    }
}

/// One step as written in a template file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id, unique within the template; used for dependency and
    /// output references.
    pub id: String,

    /// Abstract role identifier resolved through the agent registry
    /// (e.g. "pm", "architect", "qa").
    pub role: String,

    /// Task identifier handed to the resolved handler.
    pub task: String,

    /// Path-addressed destination for the step's artefact.
    pub output_path: String,

    /// Checklist id to evaluate the artefact against, if any.
    #[serde(default)]
    pub quality_gate: Option<String>,

    /// Ids of steps that must end `success` before this one runs. May
    /// only reference earlier steps.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Optional branch condition.
    #[serde(default)]
    pub condition: Option<StepCondition>,

    /// Step to re-execute when this step's gate fails. Without one, a
    /// gate failure halts the run.
    #[serde(default)]
    pub rework_target: Option<String>,

    /// Per-step override of the engine's retry budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Top-level template as parsed from YAML, prior to validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSource {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    pub steps: Vec<StepSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl TemplateSource {
    /// Parse a template source from a YAML string. Structural validation
    /// happens in [`crate::template::TemplateStore::load`].
    pub fn from_yaml(yaml: &str) -> Result<Self, crate::error::EngineError> {
        serde_yaml::from_str(yaml).map_err(|e| {
            crate::error::EngineError::MalformedTemplate(format!("YAML parse failure: {e}"))
        })
    }
}

/// A validated step: dependency and rework references resolved to indices.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: String,
    pub role: String,
    pub task: String,
    pub output_path: String,
    pub quality_gate: Option<String>,
    /// Indices into the template's step list; always earlier than this
    /// step's own index.
    pub dependencies: Vec<usize>,
    pub condition: Option<StepCondition>,
    pub rework_target: Option<usize>,
    pub max_attempts: Option<u32>,
}

/// An immutable, validated workflow template.
///
/// Invariant: every step's `dependencies` reference strictly earlier
/// indices, so template order is already a topological order.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowTemplate {
    pub(crate) fn new(
        name: String,
        description: Option<String>,
        version: String,
        steps: Vec<StepDefinition>,
    ) -> Self {
        Self {
            name,
            description,
            version,
            steps,
        }
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Indices of every step that transitively depends on `index`,
    /// including `index` itself. This is the reset set for a rework round.
    pub fn downstream_closure(&self, index: usize) -> Vec<usize> {
        let mut affected = vec![false; self.steps.len()];
        if index < self.steps.len() {
            affected[index] = true;
        }
        // Dependencies only point backward, so one forward pass suffices.
        for (i, step) in self.steps.iter().enumerate() {
            if step.dependencies.iter().any(|&d| affected[d]) {
                affected[i] = true;
            }
        }
        affected
            .iter()
            .enumerate()
            .filter_map(|(i, &hit)| hit.then_some(i))
            .collect()
    }
}
