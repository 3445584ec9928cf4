//! Quality gate engine — declarative checklists over produced artefacts.
//!
//! A gate evaluates an artefact against a named checklist and yields a
//! PASS / CONCERNS / FAIL / WAIVED verdict. The derivation order is fixed
//! and is the load-bearing rule of the whole engine:
//!
//! 1. any unmet blocker criterion ⇒ FAIL, unwaivable;
//! 2. else unmet majors above the gate's major cap ⇒ FAIL;
//! 3. else any unmet major or minor criteria ⇒ CONCERNS;
//! 4. else ⇒ PASS.
//!
//! Evaluation is pure over (artefact content, checklist): re-evaluating
//! the same pair yields an identical verdict.

pub mod checklist;

pub use checklist::{Checklist, ChecklistSet, Criterion, CriterionCheck};

use crate::error::EngineError;
use crate::models::{Artefact, Finding, GateStatus, GateVerdict};
use crate::models::CriterionSeverity;

/// Evaluates artefacts against loaded checklists.
pub struct GateEngine {
    checklists: ChecklistSet,
    default_major_cap: u32,
}

impl GateEngine {
    pub fn new(checklists: ChecklistSet, default_major_cap: u32) -> Self {
        Self {
            checklists,
            default_major_cap,
        }
    }

    pub fn checklists(&self) -> &ChecklistSet {
        &self.checklists
    }

    /// Evaluate an artefact against the checklist with the given id.
    pub fn evaluate(
        &self,
        artefact: &Artefact,
        checklist_id: &str,
    ) -> Result<GateVerdict, EngineError> {
        let checklist = self
            .checklists
            .get(checklist_id)
            .ok_or_else(|| EngineError::NotFound(format!("checklist '{}'", checklist_id)))?;
        Ok(self.evaluate_against(artefact, checklist))
    }

    /// Evaluate an artefact against an explicit checklist.
    pub fn evaluate_against(&self, artefact: &Artefact, checklist: &Checklist) -> GateVerdict {
        let mut findings: Vec<Finding> = Vec::new();
        let mut unmet_blockers = 0u32;
        let mut unmet_majors = 0u32;
        let mut unmet_minors = 0u32;

        for criterion in &checklist.criteria {
            if criterion.is_met(&artefact.content) {
                continue;
            }
            match criterion.severity {
                CriterionSeverity::Blocker => unmet_blockers += 1,
                CriterionSeverity::Major => unmet_majors += 1,
                CriterionSeverity::Minor => unmet_minors += 1,
            }
            findings.push(Finding {
                criterion_id: criterion.id.clone(),
                description: criterion.description.clone(),
                severity: criterion.severity.into(),
            });
        }

        let major_cap = checklist.major_cap.unwrap_or(self.default_major_cap);

        let (status, blocker_unmet, rationale) = if unmet_blockers > 0 {
            (
                GateStatus::Fail,
                true,
                format!(
                    "{} blocker criterion(s) unmet; blockers are unwaivable",
                    unmet_blockers
                ),
            )
        } else if unmet_majors > major_cap {
            (
                GateStatus::Fail,
                false,
                format!(
                    "{} unmet major criterion(s) exceed the gate's cap of {}",
                    unmet_majors, major_cap
                ),
            )
        } else if unmet_majors > 0 || unmet_minors > 0 {
            (
                GateStatus::Concerns,
                false,
                format!(
                    "{} major and {} minor criterion(s) unmet, within the cap of {}",
                    unmet_majors, unmet_minors, major_cap
                ),
            )
        } else {
            (
                GateStatus::Pass,
                false,
                "all criteria met".to_string(),
            )
        };

        tracing::info!(
            checklist = %checklist.id,
            step = %artefact.step_id,
            status = status.as_str(),
            findings = findings.len(),
            "gate evaluated"
        );

        GateVerdict {
            checklist_id: checklist.id.clone(),
            status,
            findings,
            rationale,
            blocker_unmet,
            approver: None,
            waiver_rationale: None,
            created_at: chrono::Utc::now(),
        }
    }
}
