//! Template loading and validation.
//!
//! `load` turns a [`TemplateSource`] into an immutable
//! [`WorkflowTemplate`], rejecting structural problems up front so a run
//! can never start against a malformed pipeline. `validate` reports
//! advisory issues without executing anything.

use std::collections::HashMap;
use std::path::Path;

use crate::error::EngineError;
use crate::template::schema::{StepDefinition, StepSpec, TemplateSource, WorkflowTemplate};

/// Advisory issue reported by [`TemplateStore::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateIssue {
    /// Step the issue belongs to, if any.
    pub step_id: Option<String>,
    pub message: String,
}

/// Loads and validates workflow templates from YAML sources.
///
/// Loaded templates are held as a read-only snapshot; nothing in the core
/// mutates them after load.
#[derive(Default)]
pub struct TemplateStore {
    templates: HashMap<String, WorkflowTemplate>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a parsed source and convert it into an immutable template.
    pub fn load(&mut self, source: TemplateSource) -> Result<&WorkflowTemplate, EngineError> {
        let template = Self::build(source)?;
        let name = template.name.clone();
        tracing::info!(
            template = %name,
            steps = template.steps().len(),
            "template loaded"
        );
        self.templates.insert(name.clone(), template);
        self.templates
            .get(&name)
            .ok_or_else(|| EngineError::Internal("template vanished after insert".into()))
    }

    /// Parse and load a template from a YAML string.
    pub fn load_yaml(&mut self, yaml: &str) -> Result<&WorkflowTemplate, EngineError> {
        let source = TemplateSource::from_yaml(yaml)?;
        self.load(source)
    }

    /// Parse and load a template from a file path.
    pub fn load_file(&mut self, path: &str) -> Result<&WorkflowTemplate, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::MalformedTemplate(format!("failed to read template '{}': {}", path, e))
        })?;
        self.load_yaml(&content)
    }

    /// Load every `*.yaml` / `*.yml` file in a directory. Returns the
    /// number of templates loaded; individual parse failures are logged
    /// and skipped.
    pub fn load_dir(&mut self, dir: &str) -> Result<usize, EngineError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::MalformedTemplate(format!("failed to read template dir '{}': {}", dir, e))
        })?;

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            match self.load_file(&path.to_string_lossy()) {
                Ok(_) => loaded += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping template: {}", e);
                }
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    pub fn all(&self) -> &HashMap<String, WorkflowTemplate> {
        &self.templates
    }

    /// Side-effect-free structural soundness report for a parsed source.
    /// Anything `load` would reject shows up here as an issue, together
    /// with advisories that do not block loading.
    pub fn validate(source: &TemplateSource) -> Vec<TemplateIssue> {
        let mut issues = Vec::new();

        if source.name.trim().is_empty() {
            issues.push(TemplateIssue {
                step_id: None,
                message: "template name is empty".into(),
            });
        }
        if source.steps.is_empty() {
            issues.push(TemplateIssue {
                step_id: None,
                message: "template has no steps".into(),
            });
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut output_paths: HashMap<&str, &str> = HashMap::new();

        for (i, step) in source.steps.iter().enumerate() {
            for (field, value) in [
                ("id", &step.id),
                ("role", &step.role),
                ("task", &step.task),
                ("output_path", &step.output_path),
            ] {
                if value.trim().is_empty() {
                    issues.push(TemplateIssue {
                        step_id: Some(step.id.clone()),
                        message: format!("step {} has an empty '{}' field", i, field),
                    });
                }
            }

            if seen.insert(step.id.as_str(), i).is_some() {
                issues.push(TemplateIssue {
                    step_id: Some(step.id.clone()),
                    message: format!("duplicate step id '{}'", step.id),
                });
            }

            for dep in &step.dependencies {
                match seen.get(dep.as_str()) {
                    Some(&dep_idx) if dep_idx < i => {}
                    _ => issues.push(TemplateIssue {
                        step_id: Some(step.id.clone()),
                        message: format!(
                            "dependency '{}' does not name an earlier step",
                            dep
                        ),
                    }),
                }
            }

            if let Some(target) = &step.rework_target {
                if !seen.contains_key(target.as_str()) && target != &step.id {
                    issues.push(TemplateIssue {
                        step_id: Some(step.id.clone()),
                        message: format!("rework target '{}' does not name an earlier step", target),
                    });
                }
            }

            // Advisory: two steps writing the same path shadow each other.
            if let Some(other) = output_paths.insert(step.output_path.as_str(), step.id.as_str()) {
                issues.push(TemplateIssue {
                    step_id: Some(step.id.clone()),
                    message: format!(
                        "output path '{}' is also written by step '{}'",
                        step.output_path, other
                    ),
                });
            }
        }

        issues
    }

    fn build(source: TemplateSource) -> Result<WorkflowTemplate, EngineError> {
        if source.name.trim().is_empty() {
            return Err(EngineError::MalformedTemplate(
                "template name is empty".into(),
            ));
        }
        if source.steps.is_empty() {
            return Err(EngineError::MalformedTemplate(format!(
                "template '{}' has no steps",
                source.name
            )));
        }

        let mut index_of: HashMap<String, usize> = HashMap::new();
        let mut steps: Vec<StepDefinition> = Vec::with_capacity(source.steps.len());

        for (i, spec) in source.steps.iter().enumerate() {
            Self::check_required_fields(&source.name, i, spec)?;

            if index_of.insert(spec.id.clone(), i).is_some() {
                return Err(EngineError::MalformedTemplate(format!(
                    "template '{}': duplicate step id '{}'",
                    source.name, spec.id
                )));
            }

            // Ids may only reference earlier steps. A forward (or self)
            // reference is reported as a dependency cycle because that is
            // what it is once the order is taken as authoritative.
            let mut dependencies = Vec::with_capacity(spec.dependencies.len());
            for dep in &spec.dependencies {
                let dep_idx = index_of.get(dep).copied().filter(|&d| d < i);
                match dep_idx {
                    Some(d) => dependencies.push(d),
                    None => {
                        return Err(EngineError::CyclicDependency(format!(
                            "template '{}': step '{}' depends on '{}', which is not an earlier step",
                            source.name, spec.id, dep
                        )));
                    }
                }
            }

            let rework_target = match &spec.rework_target {
                None => None,
                Some(target) => {
                    let target_idx = if target == &spec.id {
                        Some(i)
                    } else {
                        index_of.get(target).copied()
                    };
                    match target_idx {
                        Some(t) => Some(t),
                        None => {
                            return Err(EngineError::MalformedTemplate(format!(
                                "template '{}': step '{}' names unknown rework target '{}'",
                                source.name, spec.id, target
                            )));
                        }
                    }
                }
            };

            steps.push(StepDefinition {
                id: spec.id.clone(),
                role: spec.role.clone(),
                task: spec.task.clone(),
                output_path: spec.output_path.clone(),
                quality_gate: spec.quality_gate.clone(),
                dependencies,
                condition: spec.condition.clone().filter(|c| !c.is_empty()),
                rework_target,
                max_attempts: spec.max_attempts,
            });
        }

        Ok(WorkflowTemplate::new(
            source.name,
            source.description,
            source.version,
            steps,
        ))
    }

    fn check_required_fields(
        template: &str,
        index: usize,
        spec: &StepSpec,
    ) -> Result<(), EngineError> {
        for (field, value) in [
            ("id", &spec.id),
            ("role", &spec.role),
            ("task", &spec.task),
            ("output_path", &spec.output_path),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::MalformedTemplate(format!(
                    "template '{}': step {} is missing required field '{}'",
                    template, index, field
                )));
            }
        }
        Ok(())
    }
}

/// Convenience: load a single template file without keeping a store.
pub fn load_template_file(path: &Path) -> Result<WorkflowTemplate, EngineError> {
    let mut store = TemplateStore::new();
    let template = store.load_file(&path.to_string_lossy())?;
    Ok(template.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
name: "doc-pipeline"
steps:
  - id: "prd"
    role: "pm"
    task: "create-prd"
    output_path: "docs/prd.md"
  - id: "architecture"
    role: "architect"
    task: "create-architecture"
    output_path: "docs/architecture.md"
    dependencies: ["prd"]
    quality_gate: "architect-checklist"
    rework_target: "prd"
"#;

    #[test]
    fn loads_a_valid_template() {
        let mut store = TemplateStore::new();
        let tpl = store.load_yaml(BASIC).unwrap();
        assert_eq!(tpl.name, "doc-pipeline");
        assert_eq!(tpl.version, "1.0");
        assert_eq!(tpl.steps().len(), 2);
        assert_eq!(tpl.steps()[1].dependencies, vec![0]);
        assert_eq!(tpl.steps()[1].rework_target, Some(0));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let yaml = r#"
name: "broken"
steps:
  - id: "a"
    role: ""
    task: "t"
    output_path: "out.md"
"#;
        let mut store = TemplateStore::new();
        let err = store.load_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::MalformedTemplate(_)));
    }

    #[test]
    fn forward_dependency_is_rejected_as_cyclic() {
        let yaml = r#"
name: "forward"
steps:
  - id: "a"
    role: "pm"
    task: "t"
    output_path: "a.md"
    dependencies: ["b"]
  - id: "b"
    role: "pm"
    task: "t"
    output_path: "b.md"
"#;
        let mut store = TemplateStore::new();
        let err = store.load_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency(_)));
    }

    #[test]
    fn self_dependency_is_rejected_as_cyclic() {
        let yaml = r#"
name: "self-loop"
steps:
  - id: "a"
    role: "pm"
    task: "t"
    output_path: "a.md"
    dependencies: ["a"]
"#;
        let mut store = TemplateStore::new();
        let err = store.load_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency(_)));
    }

    #[test]
    fn duplicate_step_ids_are_malformed() {
        let yaml = r#"
name: "dupes"
steps:
  - id: "a"
    role: "pm"
    task: "t"
    output_path: "a.md"
  - id: "a"
    role: "qa"
    task: "t"
    output_path: "b.md"
"#;
        let mut store = TemplateStore::new();
        let err = store.load_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::MalformedTemplate(_)));
    }

    #[test]
    fn validate_reports_without_loading() {
        let yaml = r#"
name: ""
steps:
  - id: "a"
    role: "pm"
    task: "t"
    output_path: "same.md"
  - id: "b"
    role: "qa"
    task: "t"
    output_path: "same.md"
    dependencies: ["missing"]
"#;
        let source = TemplateSource::from_yaml(yaml).unwrap();
        let issues = TemplateStore::validate(&source);
        assert!(issues.iter().any(|i| i.message.contains("name is empty")));
        assert!(issues
            .iter()
            .any(|i| i.message.contains("dependency 'missing'")));
        assert!(issues.iter().any(|i| i.message.contains("output path")));
    }

    #[test]
    fn downstream_closure_resets_transitive_dependents() {
        let yaml = r#"
name: "chain"
steps:
  - id: "a"
    role: "pm"
    task: "t"
    output_path: "a.md"
  - id: "b"
    role: "pm"
    task: "t"
    output_path: "b.md"
    dependencies: ["a"]
  - id: "c"
    role: "pm"
    task: "t"
    output_path: "c.md"
    dependencies: ["b"]
  - id: "d"
    role: "pm"
    task: "t"
    output_path: "d.md"
"#;
        let mut store = TemplateStore::new();
        let tpl = store.load_yaml(yaml).unwrap();
        assert_eq!(tpl.downstream_closure(0), vec![0, 1, 2]);
        assert_eq!(tpl.downstream_closure(3), vec![3]);
    }
}
