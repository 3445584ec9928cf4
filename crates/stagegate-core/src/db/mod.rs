//! SQLite persistence layer for workflow runs.
//!
//! Uses rusqlite with WAL mode so coordinator bookkeeping writes never block
//! readers. All database operations go through `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime; the stores flush at every step
//! transition, which is what makes crash resume from the last committed step
//! boundary possible.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id              TEXT PRIMARY KEY,
                    template_name   TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'created',
                    context         TEXT NOT NULL DEFAULT '{}',
                    halt_reason     TEXT,
                    started_at      INTEGER,
                    finished_at     INTEGER,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS step_records (
                    run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    position        INTEGER NOT NULL DEFAULT 0,
                    round           INTEGER NOT NULL DEFAULT 0,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    skip_reason     TEXT,
                    error           TEXT,
                    started_at      INTEGER,
                    finished_at     INTEGER,
                    PRIMARY KEY (run_id, step_id, round)
                );
                CREATE INDEX IF NOT EXISTS idx_step_records_run ON step_records(run_id);

                CREATE TABLE IF NOT EXISTS artefacts (
                    run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    round           INTEGER NOT NULL DEFAULT 0,
                    output_path     TEXT NOT NULL,
                    content         TEXT NOT NULL,
                    content_hash    TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    PRIMARY KEY (run_id, step_id, round)
                );

                CREATE TABLE IF NOT EXISTS gate_verdicts (
                    id              TEXT PRIMARY KEY,
                    run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    round           INTEGER NOT NULL DEFAULT 0,
                    checklist_id    TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    rationale       TEXT NOT NULL DEFAULT '',
                    findings        TEXT NOT NULL DEFAULT '[]',
                    blocker_unmet   INTEGER NOT NULL DEFAULT 0,
                    approver        TEXT,
                    waiver_rationale TEXT,
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_gate_verdicts_run ON gate_verdicts(run_id);
                ",
            )
        })
    }
}
