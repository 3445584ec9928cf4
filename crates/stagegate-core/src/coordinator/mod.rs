//! Workflow coordinator — drives a run through its step graph.
//!
//! Per step: evaluate conditions → resolve an agent → execute with retry
//! → evaluate the quality gate → advance, rework, or halt. The step graph
//! is a DAG (template order is a topological order), so every
//! dependency-satisfied step is scheduled, bounded by the configured
//! concurrency limit. Bookkeeping is in-memory and flushed to the run
//! store at each transition, which is what allows resuming a crashed
//! `running` run from its last committed step boundary.
//!
//! The coordinator itself is shareable (`&self` methods behind an `Arc`),
//! so many runs can execute simultaneously; cancellation is cooperative
//! and observed between steps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::conditions::{ConditionEvaluator, StepDecision};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, RunEventType};
use crate::gate::GateEngine;
use crate::models::{Artefact, RunStatus, SkipReason, StepStatus, WorkflowRun};
use crate::recovery::{execute_with_retry, RecoveryOutcome, RetryPolicy};
use crate::registry::{AgentHandle, AgentRegistry, StepContext};
use crate::sink::ArtefactSink;
use crate::store::{RunStore, VerdictStore};
use crate::template::WorkflowTemplate;

pub struct WorkflowCoordinator {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    gate_engine: Arc<GateEngine>,
    evaluator: ConditionEvaluator,
    run_store: RunStore,
    verdict_store: VerdictStore,
    event_bus: EventBus,
    sink: Arc<dyn ArtefactSink>,
    abort_flags: tokio::sync::RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl WorkflowCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        registry: Arc<AgentRegistry>,
        gate_engine: Arc<GateEngine>,
        run_store: RunStore,
        verdict_store: VerdictStore,
        event_bus: EventBus,
        sink: Arc<dyn ArtefactSink>,
    ) -> Self {
        Self {
            config,
            registry,
            gate_engine,
            evaluator: ConditionEvaluator::new(),
            run_store,
            verdict_store,
            event_bus,
            sink,
            abort_flags: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn run_store(&self) -> &RunStore {
        &self.run_store
    }

    pub fn verdict_store(&self) -> &VerdictStore {
        &self.verdict_store
    }

    /// Start a new run of the template and drive it to a terminal state.
    pub async fn start(
        &self,
        template: &WorkflowTemplate,
        context: HashMap<String, String>,
    ) -> Result<WorkflowRun, EngineError> {
        self.start_with_id(template, &Uuid::new_v4().to_string(), context)
            .await
    }

    /// Start a run under a caller-chosen id (useful when the embedder
    /// needs the id before the run finishes, e.g. to cancel it).
    pub async fn start_with_id(
        &self,
        template: &WorkflowTemplate,
        run_id: &str,
        context: HashMap<String, String>,
    ) -> Result<WorkflowRun, EngineError> {
        let mut run = WorkflowRun::new(run_id.to_string(), &template.name, &template.step_ids());
        run.context = context;
        self.run_store.save(&run).await?;
        self.drive(template, run, HashMap::new()).await
    }

    /// Resume a run that was interrupted (`running` at crash time) or
    /// halted for review.
    ///
    /// Committed `success` steps are not re-executed. A step that was
    /// `running` at crash time is reset to `pending` and re-executed
    /// (at-least-once for the interrupted step only); failed steps and
    /// their dependency-skip fallout get a fresh attempt cycle.
    pub async fn resume(
        &self,
        template: &WorkflowTemplate,
        run_id: &str,
    ) -> Result<WorkflowRun, EngineError> {
        let mut run = self
            .run_store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run '{}'", run_id)))?;

        // Halted runs are fix-and-resume; only completed and aborted runs
        // are closed for good.
        if matches!(run.status, RunStatus::Completed | RunStatus::Aborted) {
            return Err(EngineError::Conflict(format!(
                "run '{}' is already {}",
                run_id,
                run.status.as_str()
            )));
        }

        run.reset_interrupted();
        run.reset_failed();
        run.halt_reason = None;

        let artefacts = self.run_store.latest_artefacts(run_id).await?;
        let outputs: HashMap<String, String> = artefacts
            .into_iter()
            .map(|(step_id, a)| (step_id, a.content))
            .collect();

        self.event_bus.emit_now(
            RunEventType::RunResumed,
            run_id,
            None,
            serde_json::json!({ "template": run.template_name }),
        );
        self.drive(template, run, outputs).await
    }

    /// Request cooperative cancellation of a run. Observed between steps;
    /// already-produced artefacts are preserved.
    pub async fn request_abort(&self, run_id: &str) {
        self.abort_flag(run_id).await.store(true, Ordering::SeqCst);
    }

    /// Waive a step's latest CONCERNS verdict, appending a WAIVED verdict
    /// with the approver identity and rationale.
    pub async fn waive_gate(
        &self,
        run_id: &str,
        step_id: &str,
        approver: &str,
        rationale: &str,
    ) -> Result<(), EngineError> {
        let record = self
            .verdict_store
            .latest_for_step(run_id, step_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("no verdict for step '{}' in run '{}'", step_id, run_id))
            })?;
        let waived = record.verdict.waive(approver, rationale)?;
        self.verdict_store
            .append(run_id, step_id, record.round, &waived)
            .await?;
        Ok(())
    }

    /// External intervention on a halted run: mark a `failed` step as
    /// `skipped` so a subsequent resume can move past it. This is the one
    /// sanctioned `failed → skipped` transition.
    pub async fn override_failed_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<(), EngineError> {
        let mut run = self
            .run_store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run '{}'", run_id)))?;
        run.set_step_status(step_id, StepStatus::Skipped)?;
        if let Some(record) = run.step_mut(step_id) {
            record.skip_reason = Some(SkipReason::Waiver);
        }
        self.run_store.save(&run).await?;
        Ok(())
    }

    async fn abort_flag(&self, run_id: &str) -> Arc<AtomicBool> {
        if let Some(flag) = self.abort_flags.read().await.get(run_id) {
            return flag.clone();
        }
        let mut flags = self.abort_flags.write().await;
        flags
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Drive a run until it reaches a terminal state.
    async fn drive(
        &self,
        template: &WorkflowTemplate,
        mut run: WorkflowRun,
        mut outputs: HashMap<String, String>,
    ) -> Result<WorkflowRun, EngineError> {
        let abort = self.abort_flag(&run.id).await;
        let base_policy = RetryPolicy::from_config(&self.config);

        run.status = RunStatus::Running;
        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        let run_started_at = run.started_at.unwrap_or_else(Utc::now);
        self.run_store.save(&run).await?;
        self.event_bus.emit_now(
            RunEventType::RunStarted,
            &run.id,
            None,
            serde_json::json!({ "template": template.name }),
        );
        tracing::info!(run = %run.id, template = %template.name, "run started");

        let mut halted: Option<String> = None;
        let mut rework_rounds_used: u32 = 0;

        'sched: loop {
            if abort.load(Ordering::SeqCst) {
                return self.finish_aborted(run).await;
            }

            if let Some(reason) = halted.clone() {
                self.cascade_dependency_skips(template, &mut run).await?;
                return self.finish_halted(run, reason).await;
            }

            let ready = self.ready_steps(template, &run);
            if ready.is_empty() {
                break 'sched;
            }

            // Condition gating; steps that pass join the wave up to the
            // concurrency limit, the rest stay pending for a later wave.
            let mut wave: Vec<usize> = Vec::new();
            let mut skipped_any = false;
            let now = Utc::now();
            for index in ready {
                let step = match template.step(index) {
                    Some(s) => s,
                    None => continue,
                };
                match self
                    .evaluator
                    .evaluate(template, step, &run, &outputs, run_started_at, now)
                {
                    StepDecision::Skip(reason) => {
                        self.mark_skipped(&mut run, &step.id, reason).await?;
                        skipped_any = true;
                    }
                    StepDecision::Run => {
                        if wave.len() < self.config.concurrency_limit.max(1) {
                            wave.push(index);
                        }
                    }
                }
            }

            if wave.is_empty() {
                if skipped_any {
                    continue 'sched;
                }
                break 'sched;
            }

            // Launch the wave.
            let mut join_set: JoinSet<(usize, Arc<AgentHandle>, RecoveryOutcome, std::time::Duration)> =
                JoinSet::new();
            for &index in &wave {
                let step = match template.step(index) {
                    Some(s) => s.clone(),
                    None => continue,
                };

                let handle = match self.registry.resolve(&step.role).await {
                    Ok(h) => h,
                    Err(e) => {
                        // Configuration error: fatal to this step, no retry.
                        self.mark_running(&mut run, &step.id).await?;
                        self.mark_failed(&mut run, &step.id, &e.to_string()).await?;
                        halted = Some(format!("step '{}': {}", step.id, e));
                        continue;
                    }
                };

                self.mark_running(&mut run, &step.id).await?;

                let round = run.step(&step.id).map(|r| r.round).unwrap_or(0);
                let ctx = StepContext {
                    run_id: run.id.clone(),
                    step_id: step.id.clone(),
                    task: step.task.clone(),
                    output_path: step.output_path.clone(),
                    round,
                    attempt: 1,
                    variables: run.context.clone(),
                    prior_outputs: outputs.clone(),
                };
                let policy = match step.max_attempts {
                    Some(n) => base_policy.clone().with_max_attempts(n),
                    None => base_policy.clone(),
                };
                let task_handle = handle.clone();
                join_set.spawn(async move {
                    let started = Instant::now();
                    let outcome =
                        execute_with_retry(task_handle.handler(), &ctx, &policy).await;
                    (index, task_handle, outcome, started.elapsed())
                });
            }

            // Collect wave results; gates are evaluated afterwards so a
            // rework cannot reset a step that is still in flight.
            let mut produced: Vec<(usize, Artefact)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let (index, handle, outcome, latency) = joined
                    .map_err(|e| EngineError::Internal(format!("step task panicked: {e}")))?;
                let step = match template.step(index) {
                    Some(s) => s,
                    None => continue,
                };

                match outcome {
                    RecoveryOutcome::Success { output, attempts } => {
                        self.registry.record_outcome(&handle, true, latency);
                        if let Some(record) = run.step_mut(&step.id) {
                            record.attempts = attempts;
                        }
                        let round = run.step(&step.id).map(|r| r.round).unwrap_or(0);
                        let artefact =
                            Artefact::new(&step.id, round, &step.output_path, output.content);
                        self.sink.publish(&artefact).await?;
                        self.run_store.save_artefact(&run.id, &artefact).await?;
                        outputs.insert(step.id.clone(), artefact.content.clone());

                        run.set_step_status(&step.id, StepStatus::Success)?;
                        self.run_store.save(&run).await?;
                        self.event_bus.emit_now(
                            RunEventType::StepSucceeded,
                            &run.id,
                            Some(&step.id),
                            serde_json::json!({ "attempts": attempts, "round": round }),
                        );
                        produced.push((index, artefact));
                    }
                    RecoveryOutcome::HaltedForReview { attempts, errors } => {
                        self.registry.record_outcome(&handle, false, latency);
                        let error = errors.last().cloned().unwrap_or_default();
                        if let Some(record) = run.step_mut(&step.id) {
                            record.attempts = attempts;
                        }
                        self.mark_failed(&mut run, &step.id, &error).await?;
                        halted = Some(format!(
                            "step '{}' exhausted {} attempt(s); last error: {}",
                            step.id, attempts, error
                        ));
                    }
                    RecoveryOutcome::Fatal { error, attempts } => {
                        self.registry.record_outcome(&handle, false, latency);
                        if let Some(record) = run.step_mut(&step.id) {
                            record.attempts = attempts;
                        }
                        self.mark_failed(&mut run, &step.id, &error).await?;
                        halted = Some(format!("step '{}' failed fatally: {}", step.id, error));
                    }
                }
            }

            // Gate evaluation, in wave order. Every produced artefact gets
            // its verdict recorded before any routing decision is applied,
            // so one step's rework cannot leave a sibling unevaluated.
            let mut gate_failures: Vec<(usize, String, Vec<String>)> = Vec::new();
            for (index, artefact) in produced {
                let step = match template.step(index) {
                    Some(s) => s,
                    None => continue,
                };
                let Some(gate_id) = &step.quality_gate else {
                    continue;
                };

                let verdict = match self.gate_engine.evaluate(&artefact, gate_id) {
                    Ok(v) => v,
                    Err(e) => {
                        halted = Some(format!("step '{}': {}", step.id, e));
                        continue;
                    }
                };
                self.verdict_store
                    .append(&run.id, &step.id, artefact.round, &verdict)
                    .await?;
                self.event_bus.emit_now(
                    RunEventType::GateEvaluated,
                    &run.id,
                    Some(&step.id),
                    serde_json::json!({
                        "checklist": verdict.checklist_id,
                        "status": verdict.status.as_str(),
                        "findings": verdict.findings.len(),
                    }),
                );

                if verdict.allows_advance() {
                    continue;
                }

                let unmet: Vec<String> = verdict
                    .findings
                    .iter()
                    .map(|f| f.criterion_id.clone())
                    .collect();
                gate_failures.push((index, gate_id.clone(), unmet));
            }

            // Route the failures. A failure with no rework path halts the
            // run, and a halt wins over any rework in the same wave.
            let mut reworks: Vec<(usize, usize, String, Vec<String>)> = Vec::new();
            for (index, gate_id, unmet) in gate_failures {
                let step = match template.step(index) {
                    Some(s) => s,
                    None => continue,
                };
                match step.rework_target {
                    Some(target) if rework_rounds_used < self.config.max_rework_rounds => {
                        rework_rounds_used += 1;
                        reworks.push((index, target, gate_id, unmet));
                    }
                    Some(_) => {
                        if halted.is_none() {
                            halted = Some(format!(
                                "step '{}' gate '{}' failed after {} rework round(s); unmet: {}",
                                step.id,
                                gate_id,
                                rework_rounds_used,
                                unmet.join(", ")
                            ));
                        }
                    }
                    None => {
                        if halted.is_none() {
                            halted = Some(format!(
                                "step '{}' gate '{}' failed with no rework target; unmet: {}",
                                step.id,
                                gate_id,
                                unmet.join(", ")
                            ));
                        }
                    }
                }
            }

            if halted.is_none() && !reworks.is_empty() {
                // Reset each rework target, the gated step, and everything
                // downstream of either.
                let mut reset: Vec<usize> = Vec::new();
                for (index, target, _, _) in &reworks {
                    for idx in template
                        .downstream_closure(*target)
                        .into_iter()
                        .chain(template.downstream_closure(*index))
                    {
                        if !reset.contains(&idx) {
                            reset.push(idx);
                        }
                    }
                }
                let reset_ids: Vec<String> = reset
                    .iter()
                    .filter_map(|&i| template.step(i).map(|s| s.id.clone()))
                    .collect();
                for id in &reset_ids {
                    outputs.remove(id);
                }
                run.begin_rework_round(&reset_ids);
                self.run_store.save(&run).await?;
                for (index, target, _, unmet) in &reworks {
                    let step_id = template.step(*index).map(|s| s.id.as_str()).unwrap_or("");
                    self.event_bus.emit_now(
                        RunEventType::ReworkTriggered,
                        &run.id,
                        Some(step_id),
                        serde_json::json!({
                            "target": template.step(*target).map(|s| s.id.clone()),
                            "round": rework_rounds_used,
                            "unmet": unmet,
                        }),
                    );
                    tracing::warn!(
                        run = %run.id,
                        step = %step_id,
                        round = rework_rounds_used,
                        "gate failed, routing to rework target"
                    );
                }
            }
        }

        if abort.load(Ordering::SeqCst) {
            return self.finish_aborted(run).await;
        }
        if let Some(reason) = halted {
            self.cascade_dependency_skips(template, &mut run).await?;
            return self.finish_halted(run, reason).await;
        }
        if run.all_steps_settled() {
            self.finish_completed(run).await
        } else {
            let reason = run
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .map(|s| format!("step '{}' failed", s.step_id))
                .unwrap_or_else(|| "run blocked without runnable steps".to_string());
            self.finish_halted(run, reason).await
        }
    }

    /// Steps whose record is `pending` and whose dependencies are all
    /// terminal.
    fn ready_steps(&self, template: &WorkflowTemplate, run: &WorkflowRun) -> Vec<usize> {
        template
            .steps()
            .iter()
            .enumerate()
            .filter(|(_, step)| {
                run.step(&step.id)
                    .map(|r| r.status == StepStatus::Pending)
                    .unwrap_or(false)
            })
            .filter(|(_, step)| {
                step.dependencies.iter().all(|&dep| {
                    template
                        .step(dep)
                        .and_then(|d| run.step(&d.id))
                        .map(|r| r.status.is_terminal())
                        .unwrap_or(false)
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// After a halt, dependents of failed/skipped steps still cascade to
    /// `skipped` so the halt diagnostics show the full blast radius.
    /// Unrelated pending steps stay pending for a later resume.
    async fn cascade_dependency_skips(
        &self,
        template: &WorkflowTemplate,
        run: &mut WorkflowRun,
    ) -> Result<(), EngineError> {
        loop {
            let mut changed = false;
            for index in self.ready_steps(template, run) {
                let Some(step) = template.step(index) else {
                    continue;
                };
                let blocked = step.dependencies.iter().any(|&dep| {
                    template
                        .step(dep)
                        .and_then(|d| run.step(&d.id))
                        .map(|r| matches!(r.status, StepStatus::Failed | StepStatus::Skipped))
                        .unwrap_or(false)
                });
                if blocked {
                    self.mark_skipped(run, &step.id, SkipReason::Dependency)
                        .await?;
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    async fn mark_running(&self, run: &mut WorkflowRun, step_id: &str) -> Result<(), EngineError> {
        run.set_step_status(step_id, StepStatus::Running)?;
        self.run_store.save(run).await?;
        self.event_bus.emit_now(
            RunEventType::StepStarted,
            &run.id,
            Some(step_id),
            serde_json::json!({}),
        );
        Ok(())
    }

    async fn mark_failed(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        run.set_step_status(step_id, StepStatus::Failed)?;
        if let Some(record) = run.step_mut(step_id) {
            record.error = Some(error.to_string());
        }
        self.run_store.save(run).await?;
        self.event_bus.emit_now(
            RunEventType::StepFailed,
            &run.id,
            Some(step_id),
            serde_json::json!({ "error": error }),
        );
        Ok(())
    }

    async fn mark_skipped(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        reason: SkipReason,
    ) -> Result<(), EngineError> {
        run.set_step_status(step_id, StepStatus::Skipped)?;
        if let Some(record) = run.step_mut(step_id) {
            record.skip_reason = Some(reason);
        }
        self.run_store.save(run).await?;
        self.event_bus.emit_now(
            RunEventType::StepSkipped,
            &run.id,
            Some(step_id),
            serde_json::json!({ "reason": reason.as_str() }),
        );
        Ok(())
    }

    async fn finish_completed(&self, mut run: WorkflowRun) -> Result<WorkflowRun, EngineError> {
        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        self.run_store.save(&run).await?;
        self.event_bus.emit_now(
            RunEventType::RunCompleted,
            &run.id,
            None,
            serde_json::json!({}),
        );
        tracing::info!(run = %run.id, "run completed");
        self.clear_abort_flag(&run.id).await;
        Ok(run)
    }

    async fn finish_halted(
        &self,
        mut run: WorkflowRun,
        reason: String,
    ) -> Result<WorkflowRun, EngineError> {
        run.status = RunStatus::Halted;
        run.halt_reason = Some(reason.clone());
        run.finished_at = Some(Utc::now());
        self.run_store.save(&run).await?;
        self.event_bus.emit_now(
            RunEventType::RunHalted,
            &run.id,
            None,
            serde_json::json!({ "reason": reason }),
        );
        tracing::warn!(run = %run.id, reason = %reason, "run halted for review");
        self.clear_abort_flag(&run.id).await;
        Ok(run)
    }

    async fn finish_aborted(&self, mut run: WorkflowRun) -> Result<WorkflowRun, EngineError> {
        run.status = RunStatus::Aborted;
        run.finished_at = Some(Utc::now());
        self.run_store.save(&run).await?;
        self.event_bus.emit_now(
            RunEventType::RunAborted,
            &run.id,
            None,
            serde_json::json!({}),
        );
        tracing::warn!(run = %run.id, "run aborted");
        self.clear_abort_flag(&run.id).await;
        Ok(run)
    }

    async fn clear_abort_flag(&self, run_id: &str) {
        self.abort_flags.write().await.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::db::Database;
    use crate::gate::{Checklist, ChecklistSet};
    use crate::models::GateStatus;
    use crate::recovery::StepFailure;
    use crate::registry::{HandlerOutput, StepHandler};
    use crate::sink::MemorySink;
    use crate::template::TemplateStore;

    /// Plays back a per-step queue of responses; once the queue is empty
    /// (or for unscripted steps) it succeeds with a default artefact body.
    struct ScriptedHandler {
        script: Mutex<HashMap<String, VecDeque<Result<String, StepFailure>>>>,
    }

    impl ScriptedHandler {
        fn always_ok() -> Arc<Self> {
            Self::with(vec![])
        }

        fn with(entries: Vec<(&str, Vec<Result<String, StepFailure>>)>) -> Arc<Self> {
            let script = entries
                .into_iter()
                .map(|(id, queue)| (id.to_string(), queue.into_iter().collect()))
                .collect();
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl StepHandler for ScriptedHandler {
        async fn execute(&self, ctx: StepContext) -> Result<HandlerOutput, StepFailure> {
            let next = self
                .script
                .lock()
                .unwrap()
                .get_mut(&ctx.step_id)
                .and_then(|queue| queue.pop_front());
            match next {
                Some(result) => result.map(|content| HandlerOutput { content }),
                None => Ok(HandlerOutput {
                    content: format!("{} artefact round {}", ctx.step_id, ctx.round),
                }),
            }
        }
    }

    struct Rig {
        coordinator: Arc<WorkflowCoordinator>,
        registry: Arc<AgentRegistry>,
        sink: Arc<MemorySink>,
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_multiplier: 2.0,
            backoff_ceiling_ms: 4,
            concurrency_limit: 4,
            max_rework_rounds: 3,
            default_major_cap: 0,
        }
    }

    fn rig() -> Rig {
        rig_with(fast_config(), ChecklistSet::new())
    }

    fn rig_with(config: EngineConfig, checklists: ChecklistSet) -> Rig {
        let db = Database::open_in_memory().unwrap();
        let registry = Arc::new(AgentRegistry::new());
        let sink = Arc::new(MemorySink::new());
        let coordinator = Arc::new(WorkflowCoordinator::new(
            config,
            registry.clone(),
            Arc::new(GateEngine::new(checklists, 0)),
            RunStore::new(db.clone()),
            VerdictStore::new(db),
            EventBus::new(),
            sink.clone(),
        ));
        Rig {
            coordinator,
            registry,
            sink,
        }
    }

    fn template(yaml: &str) -> WorkflowTemplate {
        TemplateStore::new().load_yaml(yaml).unwrap().clone()
    }

    fn gated_checklists(yaml: &str) -> ChecklistSet {
        let mut set = ChecklistSet::new();
        set.insert(Checklist::from_yaml(yaml).unwrap());
        set
    }

    const PIPELINE: &str = r#"
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
  - id: "story"
    role: "sm"
    task: "create-story"
    output_path: "docs/story.md"
    dependencies: ["architecture"]
"#;

    #[tokio::test]
    async fn linear_pipeline_runs_to_completion() {
        let rig = rig();
        let handler = ScriptedHandler::always_ok();
        for (id, role) in [("pm-1", "pm"), ("arch-1", "architect"), ("sm-1", "sm")] {
            rig.registry.register(id, &[role], handler.clone()).await;
        }

        let tpl = template(PIPELINE);
        let run = rig
            .coordinator
            .start(&tpl, HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(rig.sink.len(), 3);
        assert!(rig.sink.get("docs/story.md").is_some());

        let stored = rig.coordinator.run_store().get(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }

    const FAN_OUT: &str = r#"
name: "fan-out"
steps:
  - id: "prd"
    role: "pm"
    task: "create-prd"
    output_path: "docs/prd.md"
  - id: "ux"
    role: "designer"
    task: "sketch-flows"
    output_path: "docs/ux.md"
  - id: "spike"
    role: "architect"
    task: "tech-spike"
    output_path: "docs/spike.md"
"#;

    #[tokio::test]
    async fn independent_steps_all_run_and_the_run_completes() {
        let rig = rig();
        let handler = ScriptedHandler::always_ok();
        for (id, role) in [("pm-1", "pm"), ("ux-1", "designer"), ("arch-1", "architect")] {
            rig.registry.register(id, &[role], handler.clone()).await;
        }

        let run = rig
            .coordinator
            .start(&template(FAN_OUT), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(rig.sink.len(), 3);
        assert!(rig.sink.get("docs/ux.md").is_some());
    }

    /// Counts overlapping executions so the wave bound is observable.
    struct GaugeHandler {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl StepHandler for GaugeHandler {
        async fn execute(&self, ctx: StepContext) -> Result<HandlerOutput, StepFailure> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(HandlerOutput {
                content: format!("{} artefact", ctx.step_id),
            })
        }
    }

    #[tokio::test]
    async fn wave_size_respects_the_concurrency_limit() {
        let mut config = fast_config();
        config.concurrency_limit = 2;
        let rig = rig_with(config, ChecklistSet::new());
        let handler = Arc::new(GaugeHandler {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        for (id, role) in [("pm-1", "pm"), ("ux-1", "designer"), ("arch-1", "architect")] {
            rig.registry.register(id, &[role], handler.clone()).await;
        }

        let run = rig
            .coordinator
            .start(&template(FAN_OUT), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(rig.sink.len(), 3);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_failure_halts_and_skips_dependents() {
        let rig = rig();
        let handler = ScriptedHandler::with(vec![(
            "prd",
            vec![Err(StepFailure::Fatal("cannot express requirement".into()))],
        )]);
        for role in ["pm", "architect", "sm"] {
            rig.registry
                .register(&format!("{role}-1"), &[role], handler.clone())
                .await;
        }

        let run = rig
            .coordinator
            .start(&template(PIPELINE), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Halted);
        assert!(run.halt_reason.as_deref().unwrap().contains("prd"));
        assert_eq!(run.step("prd").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("architecture").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            run.step("architecture").unwrap().skip_reason,
            Some(SkipReason::Dependency)
        );
        assert_eq!(run.step("story").unwrap().status, StepStatus::Skipped);
        assert!(rig.sink.is_empty());
    }

    #[tokio::test]
    async fn false_condition_skips_the_branch_and_the_run_completes() {
        let yaml = r#"
name: "optional-review"
steps:
  - id: "draft"
    role: "writer"
    task: "draft"
    output_path: "draft.md"
  - id: "review"
    role: "qa"
    task: "review"
    output_path: "review.md"
    condition:
      context: "review_requested"
"#;
        let rig = rig();
        let handler = ScriptedHandler::always_ok();
        rig.registry.register("w", &["writer"], handler.clone()).await;
        rig.registry.register("q", &["qa"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step("review").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            run.step("review").unwrap().skip_reason,
            Some(SkipReason::Condition)
        );
        assert_eq!(rig.sink.len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_the_budget() {
        let yaml = r#"
name: "retry"
steps:
  - id: "flaky"
    role: "dev"
    task: "build"
    output_path: "out.md"
"#;
        let rig = rig();
        let handler = ScriptedHandler::with(vec![(
            "flaky",
            vec![
                Err(StepFailure::Transient("rate limited".into())),
                Err(StepFailure::Transient("rate limited".into())),
                Ok("built".into()),
            ],
        )]);
        rig.registry.register("dev-1", &["dev"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step("flaky").unwrap().attempts, 3);
        assert_eq!(rig.sink.get("out.md").as_deref(), Some("built"));
    }

    #[tokio::test]
    async fn retry_exhaustion_halts_for_review() {
        let yaml = r#"
name: "exhaust"
steps:
  - id: "flaky"
    role: "dev"
    task: "build"
    output_path: "out.md"
    max_attempts: 2
"#;
        let rig = rig();
        let handler = ScriptedHandler::with(vec![(
            "flaky",
            vec![
                Err(StepFailure::Transient("boom".into())),
                Err(StepFailure::Transient("boom".into())),
                Ok("never reached".into()),
            ],
        )]);
        rig.registry.register("dev-1", &["dev"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Halted);
        assert!(run.halt_reason.as_deref().unwrap().contains("exhausted"));
        assert_eq!(run.step("flaky").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("flaky").unwrap().attempts, 2);
    }

    const DOD_CHECKLIST: &str = r###"
id: "dod"
name: "Definition of done"
criteria:
  - id: "has-done-section"
    severity: blocker
    check:
      contains: "## Done"
"###;

    #[tokio::test]
    async fn gate_fail_routes_to_the_rework_target_and_then_passes() {
        let yaml = r#"
name: "gated"
steps:
  - id: "story"
    role: "sm"
    task: "create-story"
    output_path: "story.md"
    quality_gate: "dod"
    rework_target: "story"
"#;
        let rig = rig_with(fast_config(), gated_checklists(DOD_CHECKLIST));
        let handler = ScriptedHandler::with(vec![(
            "story",
            vec![
                Ok("draft without the section".into()),
                Ok("## Done\nall criteria addressed".into()),
            ],
        )]);
        rig.registry.register("sm-1", &["sm"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step("story").unwrap().round, 1);
        assert!(rig.sink.get("story.md").unwrap().contains("## Done"));

        let verdicts = rig.coordinator.verdict_store().list_for_run(&run.id).await.unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].verdict.status, GateStatus::Fail);
        assert_eq!(verdicts[0].round, 0);
        assert_eq!(verdicts[1].verdict.status, GateStatus::Pass);
        assert_eq!(verdicts[1].round, 1);
    }

    #[tokio::test]
    async fn gate_fail_without_a_rework_target_halts() {
        let yaml = r#"
name: "gated"
steps:
  - id: "story"
    role: "sm"
    task: "create-story"
    output_path: "story.md"
    quality_gate: "dod"
"#;
        let rig = rig_with(fast_config(), gated_checklists(DOD_CHECKLIST));
        let handler =
            ScriptedHandler::with(vec![("story", vec![Ok("missing the section".into())])]);
        rig.registry.register("sm-1", &["sm"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Halted);
        let reason = run.halt_reason.as_deref().unwrap();
        assert!(reason.contains("dod"));
        assert!(reason.contains("has-done-section"));
        // The artefact survives the halt for the reviewer to look at.
        assert!(rig.sink.get("story.md").is_some());
    }

    #[tokio::test]
    async fn every_gate_in_a_wave_is_evaluated_before_routing() {
        // Two independent gated steps in one wave. "story" fails its gate
        // but has a rework path; "audit" fails with no rework target. The
        // run must halt for "audit", and its verdict must be on record
        // even though "story" asked for rework first.
        let yaml = r#"
name: "sibling-gates"
steps:
  - id: "story"
    role: "sm"
    task: "create-story"
    output_path: "story.md"
    quality_gate: "dod"
    rework_target: "story"
  - id: "audit"
    role: "qa"
    task: "security-audit"
    output_path: "audit.md"
    quality_gate: "sec"
"#;
        let sec_checklist = r#"
id: "sec"
name: "Security review"
criteria:
  - id: "has-threat-model"
    severity: blocker
    check:
      contains: "threat model"
"#;
        let mut checklists = gated_checklists(DOD_CHECKLIST);
        checklists.insert(Checklist::from_yaml(sec_checklist).unwrap());
        let rig = rig_with(fast_config(), checklists);
        let handler = ScriptedHandler::with(vec![
            ("story", vec![Ok("draft without the section".into())]),
            ("audit", vec![Ok("no threats considered".into())]),
        ]);
        rig.registry.register("sm-1", &["sm"], handler.clone()).await;
        rig.registry.register("qa-1", &["qa"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Halted);
        assert!(run.halt_reason.as_deref().unwrap().contains("sec"));
        // "story" never got its rework round; the halt wins.
        assert_eq!(run.step("story").unwrap().round, 0);

        let verdicts = rig.coordinator.verdict_store().list_for_run(&run.id).await.unwrap();
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts
            .iter()
            .any(|v| v.step_id == "audit" && v.verdict.status == GateStatus::Fail));
        assert!(verdicts
            .iter()
            .any(|v| v.step_id == "story" && v.verdict.status == GateStatus::Fail));
    }

    #[tokio::test]
    async fn rework_budget_exhaustion_halts() {
        let yaml = r#"
name: "gated"
steps:
  - id: "story"
    role: "sm"
    task: "create-story"
    output_path: "story.md"
    quality_gate: "dod"
    rework_target: "story"
"#;
        let mut config = fast_config();
        config.max_rework_rounds = 1;
        let rig = rig_with(config, gated_checklists(DOD_CHECKLIST));
        // Never produces the required section.
        let handler = ScriptedHandler::with(vec![(
            "story",
            vec![Ok("still bad".into()), Ok("still bad".into())],
        )]);
        rig.registry.register("sm-1", &["sm"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Halted);
        assert!(run.halt_reason.as_deref().unwrap().contains("rework"));

        let verdicts = rig.coordinator.verdict_store().list_for_run(&run.id).await.unwrap();
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|v| v.verdict.status == GateStatus::Fail));
    }

    #[tokio::test]
    async fn concerns_allows_advance_and_can_be_waived_afterwards() {
        let checklist = r###"
id: "soft"
name: "Soft gate"
major_cap: 1
criteria:
  - id: "wants-tests"
    severity: major
    check:
      contains: "## Tests"
"###;
        let yaml = r#"
name: "gated"
steps:
  - id: "story"
    role: "sm"
    task: "create-story"
    output_path: "story.md"
    quality_gate: "soft"
"#;
        let rig = rig_with(fast_config(), gated_checklists(checklist));
        let handler = ScriptedHandler::with(vec![("story", vec![Ok("no test plan yet".into())])]);
        rig.registry.register("sm-1", &["sm"], handler).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        // One unmet major within the cap: CONCERNS, run advances.
        assert_eq!(run.status, RunStatus::Completed);

        rig.coordinator
            .waive_gate(&run.id, "story", "qa-lead", "tests tracked in a follow-up")
            .await
            .unwrap();

        let latest = rig
            .coordinator
            .verdict_store()
            .latest_for_step(&run.id, "story")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.verdict.status, GateStatus::Waived);
        assert_eq!(latest.verdict.approver.as_deref(), Some("qa-lead"));
    }

    #[tokio::test]
    async fn unresolvable_role_fails_the_step_and_halts() {
        let rig = rig();
        // Only one of the three roles is covered.
        rig.registry
            .register("pm-1", &["pm"], ScriptedHandler::always_ok())
            .await;

        let run = rig
            .coordinator
            .start(&template(PIPELINE), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Halted);
        assert_eq!(run.step("architecture").unwrap().status, StepStatus::Failed);
        assert!(run
            .halt_reason
            .as_deref()
            .unwrap()
            .contains("architect"));
    }

    /// Completes its step, then asks the coordinator to abort the run it
    /// is part of; the abort is observed before the next step schedules.
    struct AbortingHandler {
        coordinator: Mutex<Option<Arc<WorkflowCoordinator>>>,
    }

    #[async_trait]
    impl StepHandler for AbortingHandler {
        async fn execute(&self, ctx: StepContext) -> Result<HandlerOutput, StepFailure> {
            let coordinator = self.coordinator.lock().unwrap().clone();
            if let Some(coordinator) = coordinator {
                coordinator.request_abort(&ctx.run_id).await;
            }
            Ok(HandlerOutput {
                content: format!("{} done", ctx.step_id),
            })
        }
    }

    #[tokio::test]
    async fn abort_is_observed_between_steps_and_keeps_artefacts() {
        let yaml = r#"
name: "cancellable"
steps:
  - id: "first"
    role: "dev"
    task: "t"
    output_path: "first.md"
  - id: "second"
    role: "dev"
    task: "t"
    output_path: "second.md"
    dependencies: ["first"]
"#;
        let rig = rig();
        let aborter = Arc::new(AbortingHandler {
            coordinator: Mutex::new(Some(rig.coordinator.clone())),
        });
        rig.registry.register("dev-1", &["dev"], aborter).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.step("first").unwrap().status, StepStatus::Success);
        assert_eq!(run.step("second").unwrap().status, StepStatus::Pending);
        assert_eq!(rig.sink.get("first.md").as_deref(), Some("first done"));
        assert!(rig.sink.get("second.md").is_none());
    }

    #[tokio::test]
    async fn resume_reexecutes_only_the_interrupted_step() {
        let yaml = r#"
name: "resumable"
steps:
  - id: "prd"
    role: "pm"
    task: "t"
    output_path: "prd.md"
  - id: "arch"
    role: "architect"
    task: "t"
    output_path: "arch.md"
    dependencies: ["prd"]
"#;
        let rig = rig();
        // If the already-committed step were re-executed it would fail
        // the run, which the final assertion would catch.
        let handler = ScriptedHandler::with(vec![(
            "prd",
            vec![Err(StepFailure::Fatal("must not re-run".into()))],
        )]);
        rig.registry.register("pm-1", &["pm"], handler.clone()).await;
        rig.registry.register("arch-1", &["architect"], handler).await;

        // A crash left prd committed and arch in flight.
        let tpl = template(yaml);
        let mut interrupted = WorkflowRun::new("run-x".into(), &tpl.name, &tpl.step_ids());
        interrupted.status = RunStatus::Running;
        interrupted.started_at = Some(Utc::now());
        interrupted.set_step_status("prd", StepStatus::Running).unwrap();
        interrupted.set_step_status("prd", StepStatus::Success).unwrap();
        interrupted.set_step_status("arch", StepStatus::Running).unwrap();
        rig.coordinator.run_store().save(&interrupted).await.unwrap();
        rig.coordinator
            .run_store()
            .save_artefact("run-x", &Artefact::new("prd", 0, "prd.md", "the prd".into()))
            .await
            .unwrap();

        let resumed = rig.coordinator.resume(&tpl, "run-x").await.unwrap();

        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.step("prd").unwrap().status, StepStatus::Success);
        assert_eq!(resumed.step("arch").unwrap().status, StepStatus::Success);
        // Only the interrupted step went through the sink again.
        assert!(rig.sink.get("prd.md").is_none());
        assert!(rig.sink.get("arch.md").is_some());
    }

    #[tokio::test]
    async fn resume_retries_the_failed_step_of_a_halted_run() {
        let yaml = r#"
name: "halt-then-fix"
steps:
  - id: "build"
    role: "dev"
    task: "t"
    output_path: "build.md"
  - id: "verify"
    role: "qa"
    task: "t"
    output_path: "verify.md"
    dependencies: ["build"]
"#;
        let rig = rig();
        let handler = ScriptedHandler::with(vec![(
            "build",
            vec![Err(StepFailure::Fatal("missing credential".into())), Ok("built".into())],
        )]);
        rig.registry.register("dev-1", &["dev"], handler.clone()).await;
        rig.registry.register("qa-1", &["qa"], handler).await;

        let tpl = template(yaml);
        let halted = rig.coordinator.start(&tpl, HashMap::new()).await.unwrap();
        assert_eq!(halted.status, RunStatus::Halted);
        assert_eq!(halted.step("verify").unwrap().status, StepStatus::Skipped);

        let resumed = rig.coordinator.resume(&tpl, &halted.id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.step("build").unwrap().status, StepStatus::Success);
        assert_eq!(resumed.step("verify").unwrap().status, StepStatus::Success);
        assert!(resumed.halt_reason.is_none());
    }

    #[tokio::test]
    async fn overriding_a_failed_step_lets_resume_finish_the_run() {
        let yaml = r#"
name: "override"
steps:
  - id: "build"
    role: "dev"
    task: "t"
    output_path: "build.md"
  - id: "verify"
    role: "qa"
    task: "t"
    output_path: "verify.md"
    dependencies: ["build"]
"#;
        let rig = rig();
        let handler = ScriptedHandler::with(vec![(
            "build",
            vec![
                Err(StepFailure::Fatal("broken".into())),
                Err(StepFailure::Fatal("still broken".into())),
            ],
        )]);
        rig.registry.register("dev-1", &["dev"], handler.clone()).await;
        rig.registry.register("qa-1", &["qa"], handler).await;

        let tpl = template(yaml);
        let halted = rig.coordinator.start(&tpl, HashMap::new()).await.unwrap();
        assert_eq!(halted.status, RunStatus::Halted);

        rig.coordinator
            .override_failed_step(&halted.id, "build")
            .await
            .unwrap();

        let resumed = rig.coordinator.resume(&tpl, &halted.id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.step("build").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            resumed.step("build").unwrap().skip_reason,
            Some(SkipReason::Waiver)
        );
        // verify could not run without its dependency's output.
        assert_eq!(resumed.step("verify").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn resuming_a_completed_run_is_a_conflict() {
        let yaml = r#"
name: "once"
steps:
  - id: "a"
    role: "dev"
    task: "t"
    output_path: "a.md"
"#;
        let rig = rig();
        rig.registry
            .register("dev-1", &["dev"], ScriptedHandler::always_ok())
            .await;

        let tpl = template(yaml);
        let run = rig.coordinator.start(&tpl, HashMap::new()).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let err = rig.coordinator.resume(&tpl, &run.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn prior_outputs_are_visible_to_later_steps() {
        struct EchoPrior;

        #[async_trait]
        impl StepHandler for EchoPrior {
            async fn execute(&self, ctx: StepContext) -> Result<HandlerOutput, StepFailure> {
                if ctx.step_id == "second" {
                    let first = ctx.prior_outputs.get("first").cloned().unwrap_or_default();
                    Ok(HandlerOutput {
                        content: format!("saw: {first}"),
                    })
                } else {
                    Ok(HandlerOutput {
                        content: "alpha".into(),
                    })
                }
            }
        }

        let yaml = r#"
name: "chained"
steps:
  - id: "first"
    role: "dev"
    task: "t"
    output_path: "first.md"
  - id: "second"
    role: "dev"
    task: "t"
    output_path: "second.md"
    dependencies: ["first"]
"#;
        let rig = rig();
        rig.registry.register("dev-1", &["dev"], Arc::new(EchoPrior)).await;

        let run = rig
            .coordinator
            .start(&template(yaml), HashMap::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(rig.sink.get("second.md").as_deref(), Some("saw: alpha"));
    }
}
