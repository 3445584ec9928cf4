//! Gate verdicts and findings.
//!
//! A verdict is never mutated after creation: waiving a `CONCERNS` verdict
//! produces a new `WAIVED` verdict carrying the approver identity and
//! rationale, and a rework evaluation produces a new verdict under the next
//! round.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Severity tier of a checklist criterion. Blockers are always unwaivable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionSeverity {
    Blocker,
    Major,
    Minor,
}

/// Severity of an individual finding attached to a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Critical,
    Major,
    Minor,
}

impl From<CriterionSeverity> for FindingSeverity {
    fn from(s: CriterionSeverity) -> Self {
        match s {
            CriterionSeverity::Blocker => FindingSeverity::Critical,
            CriterionSeverity::Major => FindingSeverity::Major,
            CriterionSeverity::Minor => FindingSeverity::Minor,
        }
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateStatus {
    Pass,
    Concerns,
    Fail,
    Waived,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Concerns => "CONCERNS",
            Self::Fail => "FAIL",
            Self::Waived => "WAIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(Self::Pass),
            "CONCERNS" => Some(Self::Concerns),
            "FAIL" => Some(Self::Fail),
            "WAIVED" => Some(Self::Waived),
            _ => None,
        }
    }
}

/// One unmet criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub criterion_id: String,
    pub description: String,
    pub severity: FindingSeverity,
}

/// Result of evaluating an artefact against a checklist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub checklist_id: String,
    pub status: GateStatus,
    pub findings: Vec<Finding>,
    pub rationale: String,
    /// True when the FAIL came from an unmet blocker; such a verdict can
    /// never be waived.
    pub blocker_unmet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiver_rationale: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GateVerdict {
    /// Convert a `CONCERNS` verdict into a new `WAIVED` verdict.
    ///
    /// Only `CONCERNS` is waivable; `FAIL` is rejected outright, with a
    /// sharper message when the failure came from a blocker.
    pub fn waive(&self, approver: &str, rationale: &str) -> Result<GateVerdict, EngineError> {
        match self.status {
            GateStatus::Concerns => Ok(GateVerdict {
                checklist_id: self.checklist_id.clone(),
                status: GateStatus::Waived,
                findings: self.findings.clone(),
                rationale: self.rationale.clone(),
                blocker_unmet: false,
                approver: Some(approver.to_string()),
                waiver_rationale: Some(rationale.to_string()),
                created_at: Utc::now(),
            }),
            GateStatus::Fail if self.blocker_unmet => Err(EngineError::Conflict(
                "cannot waive a FAIL caused by an unmet blocker criterion".to_string(),
            )),
            other => Err(EngineError::Conflict(format!(
                "only CONCERNS verdicts are waivable, this one is {}",
                other.as_str()
            ))),
        }
    }

    /// Whether the run may advance past the gated step.
    pub fn allows_advance(&self) -> bool {
        matches!(
            self.status,
            GateStatus::Pass | GateStatus::Concerns | GateStatus::Waived
        )
    }
}
