//! Checklist definitions — named criteria with severity tags.
//!
//! ```yaml
//! id: "architect-checklist"
//! name: "Architecture review"
//! major_cap: 1
//! criteria:
//!   - id: "has-overview"
//!     description: "document opens with an overview"
//!     severity: blocker
//!     check:
//!       contains: "## Overview"
//!   - id: "mentions-deployment"
//!     severity: major
//!     check:
//!       matches: "(?i)deployment"
//!   - id: "substantial"
//!     severity: minor
//!     check:
//!       min_length: 500
//! ```
//!
//! Checks are deterministic content predicates, which is what makes gate
//! evaluation idempotent: the same artefact against the same checklist
//! always produces the same verdict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::CriterionSeverity;

/// Deterministic predicate over artefact content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CriterionCheck {
    /// Content must contain this literal substring.
    #[serde(rename = "contains")]
    Contains(String),

    /// Content must match this regular expression.
    #[serde(rename = "matches")]
    Matches(String),

    /// Content must be at least this many characters long.
    #[serde(rename = "min_length")]
    MinLength(usize),

    /// Content must be non-empty after trimming.
    #[serde(rename = "non_empty")]
    NonEmpty(bool),
}

impl CriterionCheck {
    fn is_met(&self, content: &str) -> bool {
        match self {
            Self::Contains(needle) => content.contains(needle),
            Self::Matches(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(content))
                .unwrap_or(false),
            Self::MinLength(min) => content.chars().count() >= *min,
            Self::NonEmpty(required) => !required || !content.trim().is_empty(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if let Self::Matches(pattern) = self {
            regex::Regex::new(pattern).map_err(|e| format!("bad regex '{}': {}", pattern, e))?;
        }
        Ok(())
    }
}

/// One named criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,

    /// Human-readable description carried into findings. Defaults to the id.
    #[serde(default)]
    pub description: String,

    pub severity: CriterionSeverity,

    /// Serialized as a single-key map (`contains: "..."`), not a YAML tag.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub check: CriterionCheck,
}

impl Criterion {
    pub fn is_met(&self, content: &str) -> bool {
        self.check.is_met(content)
    }
}

/// A named set of criteria evaluated as one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checklist {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Maximum unmet majors tolerated before the gate fails. Falls back
    /// to the engine default when absent.
    #[serde(default)]
    pub major_cap: Option<u32>,

    pub criteria: Vec<Criterion>,
}

impl Checklist {
    /// Parse and validate a checklist from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let mut checklist: Checklist = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::MalformedTemplate(format!("bad checklist: {e}")))?;

        if checklist.id.trim().is_empty() {
            return Err(EngineError::MalformedTemplate(
                "checklist id is empty".into(),
            ));
        }
        if checklist.criteria.is_empty() {
            return Err(EngineError::MalformedTemplate(format!(
                "checklist '{}' has no criteria",
                checklist.id
            )));
        }

        for criterion in &mut checklist.criteria {
            if criterion.description.trim().is_empty() {
                criterion.description = criterion.id.clone();
            }
            criterion.check.validate().map_err(|e| {
                EngineError::MalformedTemplate(format!(
                    "checklist '{}', criterion '{}': {}",
                    checklist.id, criterion.id, e
                ))
            })?;
        }

        Ok(checklist)
    }

    /// Load a checklist from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::MalformedTemplate(format!("failed to read checklist '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}

/// Keyed collection of checklists, loaded once and read-only afterwards.
#[derive(Default)]
pub struct ChecklistSet {
    checklists: HashMap<String, Checklist>,
}

impl ChecklistSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, checklist: Checklist) {
        self.checklists.insert(checklist.id.clone(), checklist);
    }

    pub fn get(&self, id: &str) -> Option<&Checklist> {
        self.checklists.get(id)
    }

    pub fn all(&self) -> &HashMap<String, Checklist> {
        &self.checklists
    }

    /// Load every `*.yaml` / `*.yml` in a directory. Parse failures are
    /// logged and skipped; returns how many loaded.
    pub fn load_dir(&mut self, dir: &str) -> Result<usize, EngineError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::MalformedTemplate(format!("failed to read checklist dir '{}': {}", dir, e))
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
            match Checklist::from_file(&path.to_string_lossy()) {
                Ok(checklist) => {
                    self.insert(checklist);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping checklist: {}", e);
                }
            }
        }
        Ok(loaded)
    }
}
