//! Persistence for workflow runs, step records, and artefacts.
//!
//! The coordinator flushes through this store at every transition, so a
//! `running` run in the database always reflects the last committed step
//! boundary. Step records and artefacts are written per (step, round);
//! rework appends a new round, it never rewrites an old one.

use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;

use std::collections::HashMap;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{
    Artefact, RunStatus, SkipReason, StepRecord, StepStatus, WorkflowRun,
};

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert the run row and the current-round row of every step.
    pub async fn save(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        let run = run.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO runs (id, template_name, status, context, halt_reason, \
                     started_at, finished_at, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(id) DO UPDATE SET \
                       status=excluded.status, context=excluded.context, \
                       halt_reason=excluded.halt_reason, started_at=excluded.started_at, \
                       finished_at=excluded.finished_at, updated_at=excluded.updated_at",
                    rusqlite::params![
                        run.id,
                        run.template_name,
                        run.status.as_str(),
                        serde_json::to_string(&run.context).unwrap_or_else(|_| "{}".into()),
                        run.halt_reason,
                        run.started_at.map(|t| t.timestamp_millis()),
                        run.finished_at.map(|t| t.timestamp_millis()),
                        run.created_at.timestamp_millis(),
                        run.updated_at.timestamp_millis(),
                    ],
                )?;

                for (position, step) in run.steps.iter().enumerate() {
                    conn.execute(
                        "INSERT OR REPLACE INTO step_records \
                         (run_id, step_id, position, round, status, attempts, skip_reason, \
                          error, started_at, finished_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        rusqlite::params![
                            run.id,
                            step.step_id,
                            position as i64,
                            step.round,
                            step.status.as_str(),
                            step.attempts,
                            step.skip_reason.map(|r| r.as_str()),
                            step.error,
                            step.started_at.map(|t| t.timestamp_millis()),
                            step.finished_at.map(|t| t.timestamp_millis()),
                        ],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Load a run with each step's latest-round record, in template order.
    pub async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, EngineError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let run = conn
                    .query_row(
                        "SELECT id, template_name, status, context, halt_reason, \
                         started_at, finished_at, created_at, updated_at \
                         FROM runs WHERE id = ?1",
                        rusqlite::params![id],
                        |row| Ok(row_to_run(row)),
                    )
                    .optional()?;

                let Some(mut run) = run else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    "SELECT step_id, round, status, attempts, skip_reason, error, \
                     started_at, finished_at \
                     FROM step_records s WHERE run_id = ?1 \
                     AND round = (SELECT MAX(round) FROM step_records \
                                  WHERE run_id = s.run_id AND step_id = s.step_id) \
                     ORDER BY position ASC",
                )?;
                let records = stmt
                    .query_map(rusqlite::params![run.id], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                run.steps = records;

                Ok(Some(run))
            })
            .await
    }

    /// Ids of every run persisted as `running` — candidates for resume
    /// after a process crash.
    pub async fn list_resumable(&self) -> Result<Vec<String>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM runs WHERE status = 'running' ORDER BY updated_at ASC",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Persist an artefact (immutable; one row per step and round).
    pub async fn save_artefact(&self, run_id: &str, artefact: &Artefact) -> Result<(), EngineError> {
        let run_id = run_id.to_string();
        let a = artefact.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO artefacts \
                     (run_id, step_id, round, output_path, content, content_hash, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        run_id,
                        a.step_id,
                        a.round,
                        a.output_path,
                        a.content,
                        a.content_hash,
                        a.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Latest-round artefact per step, keyed by step id. Used to rebuild
    /// prior outputs when resuming an interrupted run.
    pub async fn latest_artefacts(
        &self,
        run_id: &str,
    ) -> Result<HashMap<String, Artefact>, EngineError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT step_id, round, output_path, content, content_hash, created_at \
                     FROM artefacts a WHERE run_id = ?1 \
                     AND round = (SELECT MAX(round) FROM artefacts \
                                  WHERE run_id = a.run_id AND step_id = a.step_id)",
                )?;
                let artefacts = stmt
                    .query_map(rusqlite::params![run_id], |row| Ok(row_to_artefact(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(artefacts
                    .into_iter()
                    .map(|a| (a.step_id.clone(), a))
                    .collect())
            })
            .await
    }
}

fn to_dt(ms: Option<i64>) -> Option<chrono::DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> WorkflowRun {
    let context_json: String = row.get(3).unwrap_or_else(|_| "{}".to_string());
    WorkflowRun {
        id: row.get(0).unwrap_or_default(),
        template_name: row.get(1).unwrap_or_default(),
        status: RunStatus::parse(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(RunStatus::Created),
        context: serde_json::from_str(&context_json).unwrap_or_default(),
        steps: Vec::new(),
        halt_reason: row.get(4).unwrap_or(None),
        started_at: to_dt(row.get(5).unwrap_or(None)),
        finished_at: to_dt(row.get(6).unwrap_or(None)),
        created_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(8).ok()).unwrap_or_else(Utc::now),
    }
}

fn row_to_step(row: &rusqlite::Row<'_>) -> StepRecord {
    StepRecord {
        step_id: row.get(0).unwrap_or_default(),
        round: row.get(1).unwrap_or(0),
        status: StepStatus::parse(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(StepStatus::Pending),
        attempts: row.get(3).unwrap_or(0),
        skip_reason: row
            .get::<_, Option<String>>(4)
            .unwrap_or(None)
            .and_then(|s| SkipReason::parse(&s)),
        error: row.get(5).unwrap_or(None),
        started_at: to_dt(row.get(6).unwrap_or(None)),
        finished_at: to_dt(row.get(7).unwrap_or(None)),
    }
}

fn row_to_artefact(row: &rusqlite::Row<'_>) -> Artefact {
    Artefact {
        step_id: row.get(0).unwrap_or_default(),
        round: row.get(1).unwrap_or(0),
        output_path: row.get(2).unwrap_or_default(),
        content: row.get(3).unwrap_or_default(),
        content_hash: row.get(4).unwrap_or_default(),
        created_at: to_dt(row.get(5).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RunStore {
        RunStore::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn save_and_reload_round_trips_step_order_and_status() {
        let store = store();
        let mut run = WorkflowRun::new(
            "run-1".into(),
            "tpl",
            &["prd".to_string(), "arch".to_string(), "story".to_string()],
        );
        run.status = RunStatus::Running;
        run.set_step_status("prd", StepStatus::Running).unwrap();
        run.set_step_status("prd", StepStatus::Success).unwrap();
        run.step_mut("prd").unwrap().attempts = 2;

        store.save(&run).await.unwrap();

        let loaded = store.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        let ids: Vec<_> = loaded.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["prd", "arch", "story"]);
        assert_eq!(loaded.step("prd").unwrap().status, StepStatus::Success);
        assert_eq!(loaded.step("prd").unwrap().attempts, 2);
        assert_eq!(loaded.step("arch").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn reload_returns_the_latest_round_per_step() {
        let store = store();
        let mut run = WorkflowRun::new("run-2".into(), "tpl", &["a".to_string()]);
        run.status = RunStatus::Running;
        run.set_step_status("a", StepStatus::Running).unwrap();
        run.set_step_status("a", StepStatus::Success).unwrap();
        store.save(&run).await.unwrap();

        run.begin_rework_round(&["a".to_string()]);
        store.save(&run).await.unwrap();

        let loaded = store.get("run-2").await.unwrap().unwrap();
        assert_eq!(loaded.step("a").unwrap().round, 1);
        assert_eq!(loaded.step("a").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn resumable_lists_only_running_runs() {
        let store = store();
        let mut running = WorkflowRun::new("r-running".into(), "tpl", &["a".to_string()]);
        running.status = RunStatus::Running;
        store.save(&running).await.unwrap();

        let mut done = WorkflowRun::new("r-done".into(), "tpl", &["a".to_string()]);
        done.status = RunStatus::Completed;
        store.save(&done).await.unwrap();

        assert_eq!(store.list_resumable().await.unwrap(), vec!["r-running"]);
    }

    #[tokio::test]
    async fn latest_artefacts_pick_the_highest_round() {
        let store = store();
        let run = WorkflowRun::new("r-3".into(), "tpl", &["a".to_string()]);
        store.save(&run).await.unwrap();

        store
            .save_artefact("r-3", &Artefact::new("a", 0, "a.md", "v1".into()))
            .await
            .unwrap();
        store
            .save_artefact("r-3", &Artefact::new("a", 1, "a.md", "v2".into()))
            .await
            .unwrap();

        let latest = store.latest_artefacts("r-3").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest.get("a").unwrap().content, "v2");
    }

    #[tokio::test]
    async fn missing_run_is_none() {
        assert!(store().get("nope").await.unwrap().is_none());
    }
}
