//! Mutable execution record for one instantiation of a template.
//!
//! Step statuses are monotonic within a rework round: the only backward
//! transitions are `failed → running` (retry) and `failed → skipped`
//! (waiver). A gate failure that routes to a rework target starts a *new*
//! round for the target and everything downstream of it; prior rounds are
//! superseded, never rewritten.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Halted,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Halted | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Halted => "halted",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "halted" => Some(Self::Halted),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Lifecycle of a single step within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// Whether `self → next` is a legal transition within one round.
    pub fn can_transition(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Success)
                | (Running, Failed)
                | (Failed, Running)
                | (Failed, Skipped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Why a step was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency ended `failed` or `skipped`.
    Dependency,
    /// The step's deadline lapsed before it could be scheduled.
    Timeout,
    /// A declared condition evaluated false.
    Condition,
    /// A failed gate verdict was explicitly waived.
    Waiver,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dependency => "dependency",
            Self::Timeout => "timeout",
            Self::Condition => "condition",
            Self::Waiver => "waiver",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dependency" => Some(Self::Dependency),
            "timeout" => Some(Self::Timeout),
            "condition" => Some(Self::Condition),
            "waiver" => Some(Self::Waiver),
            _ => None,
        }
    }
}

/// Per-step bookkeeping for the step's current round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub round: u32,
    pub status: StepStatus,
    /// Completed execution attempts. The first execution counts, so a
    /// step that succeeded on its third try has `attempts == 3` and
    /// [`StepRecord::retries`] `== 2`.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            round: 0,
            status: StepStatus::Pending,
            attempts: 0,
            skip_reason: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Retries taken beyond the first execution.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// Reset this record for a new rework round.
    fn begin_round(&mut self) {
        self.round += 1;
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.skip_reason = None;
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// One instantiation of a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub template_name: String,
    pub status: RunStatus,
    /// Free-form key/value context visible to conditions and handlers.
    pub context: HashMap<String, String>,
    /// Current-round record per step, in template order.
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(id: String, template_name: &str, step_ids: &[String]) -> Self {
        let now = Utc::now();
        Self {
            id,
            template_name: template_name.to_string(),
            status: RunStatus::Created,
            context: HashMap::new(),
            steps: step_ids.iter().map(|s| StepRecord::new(s)).collect(),
            halt_reason: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Transition a step, enforcing the monotonicity invariant.
    pub fn set_step_status(&mut self, step_id: &str, next: StepStatus) -> Result<(), EngineError> {
        let record = self
            .step_mut(step_id)
            .ok_or_else(|| EngineError::NotFound(format!("step '{}'", step_id)))?;

        if !record.status.can_transition(next) {
            return Err(EngineError::Conflict(format!(
                "illegal step transition for '{}': {} -> {}",
                step_id,
                record.status.as_str(),
                next.as_str()
            )));
        }

        match next {
            StepStatus::Running if record.started_at.is_none() => {
                record.started_at = Some(Utc::now());
            }
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped => {
                record.finished_at = Some(Utc::now());
            }
            _ => {}
        }
        record.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Start a new rework round for the given steps (target plus its
    /// downstream closure, computed by the coordinator).
    pub fn begin_rework_round(&mut self, step_ids: &[String]) {
        for record in self.steps.iter_mut() {
            if step_ids.iter().any(|id| id == &record.step_id) {
                record.begin_round();
            }
        }
        self.updated_at = Utc::now();
    }

    /// Crash recovery: a step left `running` by an interrupted process
    /// never committed, so it goes back to `pending` and re-executes.
    /// Committed terminal steps are untouched.
    pub fn reset_interrupted(&mut self) {
        for record in self.steps.iter_mut() {
            if record.status == StepStatus::Running {
                record.status = StepStatus::Pending;
                record.started_at = None;
            }
        }
        self.updated_at = Utc::now();
    }

    /// Fix-and-resume: after human intervention on a halted run, failed
    /// steps get a fresh attempt cycle. Steps skipped because a dependency
    /// failed were fallout of that failure and are reset too; skips with
    /// any other reason were genuine decisions and stand.
    pub fn reset_failed(&mut self) {
        for record in self.steps.iter_mut() {
            let dependency_fallout = record.status == StepStatus::Skipped
                && record.skip_reason == Some(SkipReason::Dependency);
            if record.status == StepStatus::Failed || dependency_fallout {
                record.status = StepStatus::Pending;
                record.attempts = 0;
                record.skip_reason = None;
                record.error = None;
                record.started_at = None;
                record.finished_at = None;
            }
        }
        self.updated_at = Utc::now();
    }

    /// A run completes when every step is terminal and none is `failed`.
    pub fn all_steps_settled(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Success | StepStatus::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(ids: &[&str]) -> WorkflowRun {
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        WorkflowRun::new("run-1".into(), "tpl", &ids)
    }

    #[test]
    fn forward_transitions_are_accepted() {
        let mut run = run_with(&["a"]);
        run.set_step_status("a", StepStatus::Running).unwrap();
        run.set_step_status("a", StepStatus::Success).unwrap();
        assert!(run.all_steps_settled());
    }

    #[test]
    fn success_never_goes_back_to_pending() {
        assert!(!StepStatus::Success.can_transition(StepStatus::Pending));
        assert!(!StepStatus::Success.can_transition(StepStatus::Running));
        assert!(!StepStatus::Skipped.can_transition(StepStatus::Pending));
    }

    #[test]
    fn only_failed_may_move_backward() {
        assert!(StepStatus::Failed.can_transition(StepStatus::Running));
        assert!(StepStatus::Failed.can_transition(StepStatus::Skipped));
        assert!(!StepStatus::Failed.can_transition(StepStatus::Pending));
    }

    #[test]
    fn illegal_transition_is_a_conflict() {
        let mut run = run_with(&["a"]);
        run.set_step_status("a", StepStatus::Running).unwrap();
        run.set_step_status("a", StepStatus::Success).unwrap();
        let err = run.set_step_status("a", StepStatus::Running).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn retries_exclude_the_first_execution() {
        let mut record = StepRecord::new("a");
        assert_eq!(record.retries(), 0);
        record.attempts = 1;
        assert_eq!(record.retries(), 0);
        record.attempts = 3;
        assert_eq!(record.retries(), 2);
    }

    #[test]
    fn rework_round_resets_status_and_bumps_round() {
        let mut run = run_with(&["a", "b"]);
        run.set_step_status("a", StepStatus::Running).unwrap();
        run.set_step_status("a", StepStatus::Success).unwrap();
        run.begin_rework_round(&["a".to_string()]);

        let a = run.step("a").unwrap();
        assert_eq!(a.round, 1);
        assert_eq!(a.status, StepStatus::Pending);
        assert_eq!(run.step("b").unwrap().round, 0);
    }
}
