//! Conditional evaluator — decides whether a step runs, skips, or waits.
//!
//! Four independently optional conditions gate a step: context, result,
//! time, and dependency. All present conditions must hold (logical AND);
//! an absent condition is vacuously true. A step whose dependencies did
//! not all end `success` is skipped without ever invoking its handler,
//! and a lapsed deadline skips (never fails) the step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{SkipReason, StepStatus, WorkflowRun};
use crate::template::{StepDefinition, WorkflowTemplate};

/// Verdict for one step at scheduling time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Run,
    Skip(SkipReason),
}

/// Stateless evaluator over the coordinator's clock.
#[derive(Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether a dependency-satisfied step should execute.
    ///
    /// The coordinator only calls this once every dependency is terminal;
    /// the dependency condition here distinguishes "all succeeded" from
    /// "some failed or skipped".
    pub fn evaluate(
        &self,
        template: &WorkflowTemplate,
        step: &StepDefinition,
        run: &WorkflowRun,
        prior_outputs: &HashMap<String, String>,
        run_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StepDecision {
        // Dependency condition: every listed dependency must be `success`.
        for &dep_index in &step.dependencies {
            let Some(dep) = template.step(dep_index) else {
                return StepDecision::Skip(SkipReason::Dependency);
            };
            let dep_status = run.step(&dep.id).map(|r| r.status);
            if dep_status != Some(StepStatus::Success) {
                return StepDecision::Skip(SkipReason::Dependency);
            }
        }

        let Some(condition) = &step.condition else {
            return StepDecision::Run;
        };

        // Time condition: deadline measured from run start on the
        // coordinator's clock. Checked at scheduling time only; an
        // in-flight retry loop is never cancelled by a lapsing deadline.
        if let Some(deadline_secs) = condition.deadline_secs {
            let elapsed = now.signed_duration_since(run_started_at);
            if elapsed.num_seconds() >= 0 && (elapsed.num_seconds() as u64) >= deadline_secs {
                return StepDecision::Skip(SkipReason::Timeout);
            }
        }

        // Context condition: named key must be present and truthy.
        if let Some(key) = &condition.context {
            let truthy = run
                .context
                .get(key)
                .map(|v| is_truthy(v))
                .unwrap_or(false);
            if !truthy {
                return StepDecision::Skip(SkipReason::Condition);
            }
        }

        // Result condition: expression over prior outputs must resolve
        // to a truthy value.
        if let Some(expr) = &condition.result {
            let resolved = resolve_output_refs(expr, prior_outputs);
            if !is_truthy(&resolved) {
                return StepDecision::Skip(SkipReason::Condition);
            }
        }

        StepDecision::Run
    }
}

fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && v != "false" && v != "0"
}

/// Replace `${steps.<id>.output}` references with the named step's
/// output. Unresolved references become empty (falsy) rather than being
/// left in place, so a condition on a missing output skips the step.
pub fn resolve_output_refs(expr: &str, prior_outputs: &HashMap<String, String>) -> String {
    let re = match regex::Regex::new(r"\$\{steps\.([^.}]+)\.output\}") {
        Ok(re) => re,
        Err(_) => return expr.to_string(),
    };
    re.replace_all(expr, |caps: &regex::Captures| {
        prior_outputs
            .get(&caps[1])
            .cloned()
            .unwrap_or_default()
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{TemplateStore, WorkflowTemplate};

    const TPL: &str = r#"
name: "cond"
steps:
  - id: "plan"
    role: "pm"
    task: "t"
    output_path: "plan.md"
  - id: "build"
    role: "dev"
    task: "t"
    output_path: "build.md"
    dependencies: ["plan"]
    condition:
      result: "${steps.plan.output}"
  - id: "review"
    role: "qa"
    task: "t"
    output_path: "review.md"
    condition:
      context: "review_requested"
      deadline_secs: 60
"#;

    fn setup() -> (WorkflowTemplate, WorkflowRun) {
        let mut store = TemplateStore::new();
        let tpl = store.load_yaml(TPL).unwrap().clone();
        let run = WorkflowRun::new("r1".into(), &tpl.name, &tpl.step_ids());
        (tpl, run)
    }

    #[test]
    fn absent_conditions_are_vacuously_true() {
        let (tpl, run) = setup();
        let eval = ConditionEvaluator::new();
        let now = Utc::now();
        let decision = eval.evaluate(&tpl, &tpl.steps()[0], &run, &HashMap::new(), now, now);
        assert_eq!(decision, StepDecision::Run);
    }

    #[test]
    fn failed_dependency_skips_without_running() {
        let (tpl, mut run) = setup();
        run.set_step_status("plan", StepStatus::Running).unwrap();
        run.set_step_status("plan", StepStatus::Failed).unwrap();

        let eval = ConditionEvaluator::new();
        let now = Utc::now();
        let decision = eval.evaluate(&tpl, &tpl.steps()[1], &run, &HashMap::new(), now, now);
        assert_eq!(decision, StepDecision::Skip(SkipReason::Dependency));
    }

    #[test]
    fn result_condition_tracks_prior_output() {
        let (tpl, mut run) = setup();
        run.set_step_status("plan", StepStatus::Running).unwrap();
        run.set_step_status("plan", StepStatus::Success).unwrap();

        let eval = ConditionEvaluator::new();
        let now = Utc::now();

        let empty = HashMap::new();
        let decision = eval.evaluate(&tpl, &tpl.steps()[1], &run, &empty, now, now);
        assert_eq!(decision, StepDecision::Skip(SkipReason::Condition));

        let mut outputs = HashMap::new();
        outputs.insert("plan".to_string(), "a plan".to_string());
        let decision = eval.evaluate(&tpl, &tpl.steps()[1], &run, &outputs, now, now);
        assert_eq!(decision, StepDecision::Run);
    }

    #[test]
    fn lapsed_deadline_skips_with_timeout_annotation() {
        let (tpl, mut run) = setup();
        run.context
            .insert("review_requested".to_string(), "yes".to_string());

        let eval = ConditionEvaluator::new();
        let started = Utc::now();
        let late = started + chrono::Duration::seconds(120);
        let decision = eval.evaluate(&tpl, &tpl.steps()[2], &run, &HashMap::new(), started, late);
        assert_eq!(decision, StepDecision::Skip(SkipReason::Timeout));

        let in_time = started + chrono::Duration::seconds(10);
        let decision =
            eval.evaluate(&tpl, &tpl.steps()[2], &run, &HashMap::new(), started, in_time);
        assert_eq!(decision, StepDecision::Run);
    }

    #[test]
    fn missing_context_key_is_falsy() {
        let (tpl, run) = setup();
        let eval = ConditionEvaluator::new();
        let now = Utc::now();
        let decision = eval.evaluate(&tpl, &tpl.steps()[2], &run, &HashMap::new(), now, now);
        assert_eq!(decision, StepDecision::Skip(SkipReason::Condition));
    }
}
