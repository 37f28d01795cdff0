use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::app::error::AppError;
use crate::app::models::RunStatus;
use crate::app::screen::{Screen, ScreenTracker, Transition};

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     CREATE TABLE IF NOT EXISTS runs (
       run_id TEXT PRIMARY KEY,
       app_package TEXT NOT NULL,
       started_at TEXT NOT NULL,
       ended_at TEXT,
       status TEXT,
       steps INTEGER NOT NULL DEFAULT 0
     );
     CREATE TABLE IF NOT EXISTS screens (
       run_id TEXT NOT NULL,
       screen_id INTEGER NOT NULL,
       fingerprint TEXT NOT NULL,
       xml_hash TEXT NOT NULL,
       visual_hash TEXT NOT NULL,
       screenshot_path TEXT,
       first_seen TEXT NOT NULL,
       last_seen TEXT NOT NULL,
       visit_count INTEGER NOT NULL,
       PRIMARY KEY (run_id, screen_id)
     );
     CREATE TABLE IF NOT EXISTS transitions (
       id INTEGER PRIMARY KEY AUTOINCREMENT,
       run_id TEXT NOT NULL,
       step INTEGER NOT NULL,
       from_fingerprint TEXT NOT NULL,
       action TEXT NOT NULL,
       to_fingerprint TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_transitions_run ON transitions(run_id);
    ";

/// Persisted screen graph, one row set per run.
pub struct CrawlStore {
    connection: Connection,
    trace_id: String,
}

impl CrawlStore {
    pub fn open(path: &Path, trace_id: &str) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create {}: {err}", parent.display()), trace_id)
            })?;
        }
        let connection = Connection::open(path)
            .map_err(|err| AppError::system(format!("Failed to open crawl database: {err}"), trace_id))?;
        Self::with_connection(connection, trace_id)
    }

    pub fn open_in_memory(trace_id: &str) -> Result<Self, AppError> {
        let connection = Connection::open_in_memory()
            .map_err(|err| AppError::system(format!("Failed to open crawl database: {err}"), trace_id))?;
        Self::with_connection(connection, trace_id)
    }

    fn with_connection(connection: Connection, trace_id: &str) -> Result<Self, AppError> {
        connection
            .execute_batch(SCHEMA)
            .map_err(|err| AppError::system(format!("Failed to initialize crawl database: {err}"), trace_id))?;
        Ok(Self {
            connection,
            trace_id: trace_id.to_string(),
        })
    }

    fn failed(&self, what: &str, err: rusqlite::Error) -> AppError {
        AppError::system(format!("Failed to {what}: {err}"), &self.trace_id)
    }

    pub fn begin_run(&self, run_id: &str, app_package: &str) -> Result<(), AppError> {
        self.connection
            .execute(
                "INSERT OR REPLACE INTO runs (run_id, app_package, started_at) VALUES (?1, ?2, ?3)",
                params![run_id, app_package, Utc::now().to_rfc3339()],
            )
            .map_err(|err| self.failed("record run start", err))?;
        Ok(())
    }

    pub fn upsert_screen(&self, run_id: &str, screen: &Screen) -> Result<(), AppError> {
        let screenshot = screen
            .screenshot_path
            .as_ref()
            .map(|path| path.display().to_string());
        self.connection
            .execute(
                "INSERT INTO screens (run_id, screen_id, fingerprint, xml_hash, visual_hash,
                   screenshot_path, first_seen, last_seen, visit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(run_id, screen_id) DO UPDATE SET
                   last_seen = excluded.last_seen,
                   visit_count = excluded.visit_count",
                params![
                    run_id,
                    screen.id,
                    &screen.fingerprint,
                    &screen.xml_hash,
                    &screen.visual_hash,
                    screenshot,
                    screen.first_seen.to_rfc3339(),
                    screen.last_seen.to_rfc3339(),
                    screen.visit_count,
                ],
            )
            .map_err(|err| self.failed("store screen", err))?;
        Ok(())
    }

    pub fn insert_transition(&self, run_id: &str, step: u32, transition: &Transition) -> Result<(), AppError> {
        self.connection
            .execute(
                "INSERT INTO transitions (run_id, step, from_fingerprint, action, to_fingerprint)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, step, &transition.from, &transition.action, &transition.to],
            )
            .map_err(|err| self.failed("store transition", err))?;
        Ok(())
    }

    /// Final snapshot of every screen's counters.
    pub fn save_screens(&mut self, run_id: &str, tracker: &ScreenTracker) -> Result<(), AppError> {
        let tx = self
            .connection
            .transaction()
            .map_err(|err| AppError::system(format!("Failed to begin transaction: {err}"), &self.trace_id))?;
        {
            let mut stmt = tx
                .prepare(
                    "UPDATE screens SET last_seen = ?3, visit_count = ?4
                     WHERE run_id = ?1 AND screen_id = ?2",
                )
                .map_err(|err| AppError::system(format!("Failed to prepare screen update: {err}"), &self.trace_id))?;
            for screen in tracker.screens() {
                stmt.execute(params![run_id, screen.id, screen.last_seen.to_rfc3339(), screen.visit_count])
                    .map_err(|err| AppError::system(format!("Failed to update screen: {err}"), &self.trace_id))?;
            }
        }
        tx.commit()
            .map_err(|err| AppError::system(format!("Failed to commit screens: {err}"), &self.trace_id))?;
        Ok(())
    }

    pub fn finish_run(&self, run_id: &str, status: RunStatus, steps: u32) -> Result<(), AppError> {
        self.connection
            .execute(
                "UPDATE runs SET ended_at = ?2, status = ?3, steps = ?4 WHERE run_id = ?1",
                params![run_id, Utc::now().to_rfc3339(), status.as_str(), steps],
            )
            .map_err(|err| self.failed("record run end", err))?;
        Ok(())
    }

    pub fn run_status(&self, run_id: &str) -> Result<Option<String>, AppError> {
        self.connection
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
            .map_err(|err| self.failed("read run", err))
    }

    pub fn screen_count(&self, run_id: &str) -> Result<u32, AppError> {
        self.count("SELECT COUNT(*) FROM screens WHERE run_id = ?1", run_id)
    }

    pub fn transition_count(&self, run_id: &str) -> Result<u32, AppError> {
        self.count("SELECT COUNT(*) FROM transitions WHERE run_id = ?1", run_id)
    }

    fn count(&self, sql: &str, run_id: &str) -> Result<u32, AppError> {
        self.connection
            .query_row(sql, params![run_id], |row| row.get(0))
            .map_err(|err| self.failed("count rows", err))
    }

    pub fn visit_count(&self, run_id: &str, fingerprint: &str) -> Result<Option<u32>, AppError> {
        self.connection
            .query_row(
                "SELECT visit_count FROM screens WHERE run_id = ?1 AND fingerprint = ?2",
                params![run_id, fingerprint],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.failed("read screen", err))
    }
}
