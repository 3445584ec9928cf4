//! Append-only persistence for gate verdicts.
//!
//! Verdicts are never updated in place: a rework evaluation appends a new
//! row under the next round, and a waiver appends a new WAIVED row next
//! to the CONCERNS row it supersedes.

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{Finding, GateStatus, GateVerdict};

/// A persisted verdict with its position in the run.
#[derive(Debug, Clone)]
pub struct VerdictRecord {
    pub id: String,
    pub step_id: String,
    pub round: u32,
    pub verdict: GateVerdict,
}

#[derive(Clone)]
pub struct VerdictStore {
    db: Database,
}

impl VerdictStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        run_id: &str,
        step_id: &str,
        round: u32,
        verdict: &GateVerdict,
    ) -> Result<String, EngineError> {
        let id = Uuid::new_v4().to_string();
        let row_id = id.clone();
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        let v = verdict.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO gate_verdicts \
                     (id, run_id, step_id, round, checklist_id, status, rationale, \
                      findings, blocker_unmet, approver, waiver_rationale, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    rusqlite::params![
                        row_id,
                        run_id,
                        step_id,
                        round,
                        v.checklist_id,
                        v.status.as_str(),
                        v.rationale,
                        serde_json::to_string(&v.findings).unwrap_or_else(|_| "[]".into()),
                        v.blocker_unmet,
                        v.approver,
                        v.waiver_rationale,
                        v.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// All verdicts for a run, oldest first.
    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<VerdictRecord>, EngineError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, step_id, round, checklist_id, status, rationale, findings, \
                     blocker_unmet, approver, waiver_rationale, created_at \
                     FROM gate_verdicts WHERE run_id = ?1 ORDER BY rowid ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id], |row| Ok(row_to_record(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// The most recent verdict for a step, if any.
    pub async fn latest_for_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<VerdictRecord>, EngineError> {
        let all = self.list_for_run(run_id).await?;
        Ok(all.into_iter().rev().find(|r| r.step_id == step_id))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> VerdictRecord {
    let findings_json: String = row.get(6).unwrap_or_else(|_| "[]".to_string());
    let findings: Vec<Finding> = serde_json::from_str(&findings_json).unwrap_or_default();
    let status = GateStatus::parse(&row.get::<_, String>(4).unwrap_or_default())
        .unwrap_or(GateStatus::Fail);
    VerdictRecord {
        id: row.get(0).unwrap_or_default(),
        step_id: row.get(1).unwrap_or_default(),
        round: row.get(2).unwrap_or(0),
        verdict: GateVerdict {
            checklist_id: row.get(3).unwrap_or_default(),
            status,
            findings,
            rationale: row.get(5).unwrap_or_default(),
            blocker_unmet: row.get(7).unwrap_or(false),
            approver: row.get(8).unwrap_or(None),
            waiver_rationale: row.get(9).unwrap_or(None),
            created_at: row
                .get::<_, Option<i64>>(10)
                .ok()
                .flatten()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now),
        },
    }
}
