use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Async-safe handle to the vigil database.
///
/// Wraps `VigilDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<VigilDb>>,
}

impl DbHandle {
    pub fn new(db: VigilDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&VigilDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used where blocking is
    /// acceptable: startup initialization and tests. Must NOT be called
    /// from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, VigilDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct VigilDb {
    conn: Connection,
}

impl VigilDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    tool TEXT NOT NULL,
                    scope_id TEXT,
                    target TEXT NOT NULL,
                    params TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    exit_code INTEGER,
                    error TEXT,
                    timeout_secs INTEGER NOT NULL DEFAULT 300,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    size_bytes INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(run_id, name)
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    target TEXT NOT NULL,
                    objective TEXT NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'created',
                    current_phase INTEGER NOT NULL DEFAULT 0,
                    progress INTEGER NOT NULL DEFAULT 0,
                    risk_score INTEGER NOT NULL DEFAULT 0,
                    max_steps INTEGER NOT NULL DEFAULT 6,
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    error TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    phase INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    error TEXT,
                    impact TEXT,
                    remediation TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    UNIQUE(session_id, phase)
                );

                CREATE TABLE IF NOT EXISTS findings (
                    id TEXT PRIMARY KEY,
                    run_id TEXT REFERENCES runs(id) ON DELETE CASCADE,
                    session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
                    phase INTEGER,
                    severity TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    evidence TEXT NOT NULL DEFAULT '',
                    remediation TEXT NOT NULL DEFAULT '',
                    exploitation TEXT NOT NULL DEFAULT '',
                    verification TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'queued',
                    enqueued_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tools (
                    id TEXT PRIMARY KEY,
                    slug TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    manifest TEXT
                );

                CREATE TABLE IF NOT EXISTS scopes (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    cidrs TEXT NOT NULL DEFAULT '[]',
                    host_patterns TEXT NOT NULL DEFAULT '[]',
                    active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'user'
                );

                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    actor TEXT NOT NULL,
                    action TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    detail TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);
                CREATE INDEX IF NOT EXISTS idx_findings_run ON findings(run_id);
                CREATE INDEX IF NOT EXISTS idx_findings_session ON findings(session_id);
                CREATE INDEX IF NOT EXISTS idx_steps_session ON steps(session_id);
                CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Run CRUD ──────────────────────────────────────────────────────

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (id, user_id, tool, scope_id, target, params, status,
                                   exit_code, error, timeout_secs, created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run.id,
                    run.user_id,
                    run.tool,
                    run.scope_id,
                    run.target,
                    run.params.to_string(),
                    run.status.as_str(),
                    run.exit_code,
                    run.error,
                    run.timeout_secs as i64,
                    run.created_at,
                    run.started_at,
                    run.completed_at,
                ],
            )
            .context("Failed to insert run")?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, tool, scope_id, target, params, status, exit_code,
                        error, timeout_secs, created_at, started_at, completed_at
                 FROM runs WHERE id = ?1",
            )
            .context("Failed to prepare get_run")?;
        let row = stmt
            .query_row(params![id], map_run_row)
            .optional()
            .context("Failed to query run")?;
        Ok(row)
    }

    pub fn list_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, tool, scope_id, target, params, status, exit_code,
                        error, timeout_secs, created_at, started_at, completed_at
                 FROM runs ORDER BY created_at DESC, id",
            )
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map([], map_run_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?);
        }
        Ok(runs)
    }

    /// Atomically transition a run, stamping the timestamp that belongs to
    /// the new status. The guard clause refuses to overwrite a terminal
    /// status; returns false when the guard rejected the transition.
    pub fn transition_run(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<&str>,
        exit_code: Option<i32>,
    ) -> Result<bool> {
        let ts = now_ts();
        let changed = match status {
            RunStatus::Running => self
                .conn
                .execute(
                    "UPDATE runs SET status = 'running', started_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![ts, id],
                )
                .context("Failed to transition run to running")?,
            RunStatus::Pending => 0,
            terminal => self
                .conn
                .execute(
                    "UPDATE runs SET status = ?1, completed_at = ?2,
                            error = COALESCE(?3, error), exit_code = COALESCE(?4, exit_code)
                     WHERE id = ?5 AND status IN ('pending', 'running')",
                    params![terminal.as_str(), ts, error, exit_code, id],
                )
                .context("Failed to transition run to terminal status")?,
        };
        Ok(changed > 0)
    }

    pub fn delete_run(&self, id: &str) -> Result<bool> {
        // Jobs carry no FK (the queue outlives failed inserts), so clear
        // them explicitly inside the same transaction as the run row.
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin delete_run transaction")?;
        let result = (|| -> Result<bool> {
            self.conn
                .execute("DELETE FROM jobs WHERE run_id = ?1", params![id])?;
            let changed = self
                .conn
                .execute("DELETE FROM runs WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })();
        match result {
            Ok(changed) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(changed)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e).context("Failed to delete run")
            }
        }
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Create or update a named artifact, recomputing its size.
    pub fn upsert_artifact(&self, run_id: &str, name: &str, content: &str) -> Result<Artifact> {
        let ts = now_ts();
        self.conn
            .execute(
                "INSERT INTO artifacts (run_id, name, content, size_bytes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(run_id, name) DO UPDATE SET
                     content = excluded.content,
                     size_bytes = excluded.size_bytes,
                     updated_at = excluded.updated_at",
                params![run_id, name, content, content.len() as i64, ts],
            )
            .context("Failed to upsert artifact")?;
        self.get_artifact(run_id, name)?
            .context("Artifact not found after upsert")
    }

    pub fn get_artifact(&self, run_id: &str, name: &str) -> Result<Option<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, name, content, size_bytes, created_at, updated_at
                 FROM artifacts WHERE run_id = ?1 AND name = ?2",
            )
            .context("Failed to prepare get_artifact")?;
        let row = stmt
            .query_row(params![run_id, name], map_artifact_row)
            .optional()
            .context("Failed to query artifact")?;
        Ok(row)
    }

    pub fn list_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, name, content, size_bytes, created_at, updated_at
                 FROM artifacts WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![run_id], map_artifact_row)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?);
        }
        Ok(artifacts)
    }

    // ── Findings ──────────────────────────────────────────────────────

    pub fn insert_finding(&self, finding: &Finding) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO findings (id, run_id, session_id, phase, severity, title,
                                       description, evidence, remediation, exploitation,
                                       verification, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    finding.id,
                    finding.run_id,
                    finding.session_id,
                    finding.phase,
                    finding.severity.as_str(),
                    finding.title,
                    finding.description,
                    finding.evidence,
                    finding.remediation,
                    finding.exploitation,
                    finding.verification,
                    finding.created_at,
                ],
            )
            .context("Failed to insert finding")?;
        Ok(())
    }

    pub fn list_findings_for_run(&self, run_id: &str) -> Result<Vec<Finding>> {
        self.list_findings("run_id", run_id)
    }

    pub fn list_findings_for_session(&self, session_id: &str) -> Result<Vec<Finding>> {
        self.list_findings("session_id", session_id)
    }

    fn list_findings(&self, column: &str, id: &str) -> Result<Vec<Finding>> {
        let sql = format!(
            "SELECT id, run_id, session_id, phase, severity, title, description, evidence,
                    remediation, exploitation, verification, created_at
             FROM findings WHERE {} = ?1 ORDER BY created_at, id",
            column
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_findings")?;
        let rows = stmt
            .query_map(params![id], map_finding_row)
            .context("Failed to query findings")?;
        let mut findings = Vec::new();
        for row in rows {
            findings.push(row.context("Failed to read finding row")?);
        }
        Ok(findings)
    }

    pub fn delete_finding(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM findings WHERE id = ?1", params![id])
            .context("Failed to delete finding")?;
        Ok(changed > 0)
    }

    // ── Job queue ─────────────────────────────────────────────────────

    pub fn enqueue_job(&self, run_id: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO jobs (run_id, state, enqueued_at) VALUES (?1, 'queued', ?2)",
                params![run_id, now_ts()],
            )
            .context("Failed to enqueue job")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claim the oldest queued job. FIFO by insertion id.
    pub fn claim_next_job(&self) -> Result<Option<(i64, String)>> {
        let next: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, run_id FROM jobs WHERE state = 'queued' ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query next job")?;
        if let Some((id, _)) = &next {
            self.conn
                .execute(
                    "UPDATE jobs SET state = 'claimed' WHERE id = ?1",
                    params![id],
                )
                .context("Failed to claim job")?;
        }
        Ok(next)
    }

    /// Best-effort removal of a not-yet-started job for a run.
    pub fn remove_queued_job(&self, run_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE run_id = ?1 AND state = 'queued'",
                params![run_id],
            )
            .context("Failed to remove queued job")?;
        Ok(changed > 0)
    }

    pub fn finish_job(&self, job_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![job_id])
            .context("Failed to finish job")?;
        Ok(())
    }

    pub fn queued_job_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM jobs WHERE state = 'queued'", [], |r| {
                r.get(0)
            })
            .context("Failed to count queued jobs")
    }

    // ── Sessions + steps ──────────────────────────────────────────────

    /// Insert a session together with its fixed set of steps, atomically.
    pub fn insert_session_with_steps(
        &self,
        session: &WorkflowSession,
        step_names: &[&str],
    ) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin session insert transaction")?;
        let result = (|| -> Result<()> {
            self.conn.execute(
                "INSERT INTO sessions (id, user_id, target, objective, name, status,
                                       current_phase, progress, risk_score, max_steps, run_id,
                                       error, created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    session.id,
                    session.user_id,
                    session.target,
                    session.objective.as_str(),
                    session.name,
                    session.status.as_str(),
                    session.current_phase,
                    session.progress,
                    session.risk_score,
                    session.max_steps,
                    session.run_id,
                    session.error,
                    session.created_at,
                    session.started_at,
                    session.completed_at,
                ],
            )?;
            for (i, name) in step_names.iter().enumerate() {
                self.conn.execute(
                    "INSERT INTO steps (session_id, phase, name, status)
                     VALUES (?1, ?2, ?3, 'pending')",
                    params![session.id, (i + 1) as i64, name],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e).context("Failed to insert session with steps")
            }
        }
    }

    pub fn get_session(&self, id: &str) -> Result<Option<WorkflowSession>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, target, objective, name, status, current_phase, progress,
                        risk_score, max_steps, run_id, error, created_at, started_at, completed_at
                 FROM sessions WHERE id = ?1",
            )
            .context("Failed to prepare get_session")?;
        let row = stmt
            .query_row(params![id], map_session_row)
            .optional()
            .context("Failed to query session")?;
        Ok(row)
    }

    pub fn list_sessions(&self) -> Result<Vec<WorkflowSession>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, target, objective, name, status, current_phase, progress,
                        risk_score, max_steps, run_id, error, created_at, started_at, completed_at
                 FROM sessions ORDER BY created_at DESC, id",
            )
            .context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map([], map_session_row)
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.context("Failed to read session row")?);
        }
        Ok(sessions)
    }

    /// Atomic single-flight claim: move this session from created to
    /// running only when no other session is running. A single conditional
    /// UPDATE, so the check and the claim cannot interleave.
    pub fn claim_session_slot(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'created'
                   AND NOT EXISTS (SELECT 1 FROM sessions WHERE status = 'running')",
                params![now_ts(), id],
            )
            .context("Failed to claim session slot")?;
        Ok(changed > 0)
    }

    pub fn running_session_count(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = 'running'",
                [],
                |r| r.get(0),
            )
            .context("Failed to count running sessions")
    }

    /// 1-based rank of this session among created sessions ordered by
    /// creation time. A queue position, not a guarantee.
    pub fn created_session_rank(&self, id: &str) -> Result<i64> {
        let rank: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sessions
                 WHERE status = 'created'
                   AND (created_at, id) <= (SELECT created_at, id FROM sessions WHERE id = ?1)",
                params![id],
                |r| r.get(0),
            )
            .context("Failed to rank created session")?;
        Ok(rank)
    }

    pub fn oldest_created_session(&self) -> Result<Option<WorkflowSession>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, target, objective, name, status, current_phase, progress,
                        risk_score, max_steps, run_id, error, created_at, started_at, completed_at
                 FROM sessions WHERE status = 'created' ORDER BY created_at, id LIMIT 1",
            )
            .context("Failed to prepare oldest_created_session")?;
        let row = stmt
            .query_row([], map_session_row)
            .optional()
            .context("Failed to query oldest created session")?;
        Ok(row)
    }

    /// Guarded terminal transition for a session. Returns false when the
    /// session was already terminal.
    pub fn finish_session(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET status = ?1, completed_at = ?2, error = COALESCE(?3, error)
                 WHERE id = ?4 AND status IN ('created', 'running', 'paused')",
                params![status.as_str(), now_ts(), error, id],
            )
            .context("Failed to finish session")?;
        Ok(changed > 0)
    }

    pub fn update_session_progress(
        &self,
        id: &str,
        current_phase: i32,
        progress: i32,
        risk_score: i32,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET current_phase = ?1, progress = ?2, risk_score = ?3
                 WHERE id = ?4",
                params![current_phase, progress, risk_score, id],
            )
            .context("Failed to update session progress")?;
        Ok(())
    }

    pub fn list_steps(&self, session_id: &str) -> Result<Vec<Step>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, phase, name, status, error, impact, remediation,
                        started_at, completed_at
                 FROM steps WHERE session_id = ?1 ORDER BY phase",
            )
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![session_id], map_step_row)
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step row")?);
        }
        Ok(steps)
    }

    /// Mark one step running; only a pending step can start.
    pub fn start_step(&self, session_id: &str, phase: i32) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE steps SET status = 'running', started_at = ?1
                 WHERE session_id = ?2 AND phase = ?3 AND status = 'pending'",
                params![now_ts(), session_id, phase],
            )
            .context("Failed to start step")?;
        Ok(changed > 0)
    }

    /// Record a step's outcome. Only forward transitions out of running
    /// (or pending, when a step fails before it starts) are accepted.
    pub fn complete_step(
        &self,
        session_id: &str,
        phase: i32,
        status: StepStatus,
        error: Option<&str>,
        impact: Option<&str>,
        remediation: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE steps SET status = ?1, completed_at = ?2, error = ?3,
                        impact = COALESCE(?4, impact), remediation = COALESCE(?5, remediation)
                 WHERE session_id = ?6 AND phase = ?7 AND status IN ('pending', 'running')",
                params![
                    status.as_str(),
                    now_ts(),
                    error,
                    impact,
                    remediation,
                    session_id,
                    phase
                ],
            )
            .context("Failed to complete step")?;
        Ok(changed > 0)
    }

    /// Cancellation sweep: every step that has not finished is skipped.
    pub fn skip_active_steps(&self, session_id: &str) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE steps SET status = 'skipped', completed_at = ?1
                 WHERE session_id = ?2 AND status IN ('pending', 'running')",
                params![now_ts(), session_id],
            )
            .context("Failed to skip active steps")?;
        Ok(changed)
    }

    /// Remove a session and everything hanging off it - findings, steps,
    /// the bound run with its artifacts and findings - in one transaction
    /// so no orphan rows remain even under mid-operation failure.
    pub fn delete_session_cascade(&self, id: &str) -> Result<bool> {
        let session = match self.get_session(id)? {
            Some(s) => s,
            None => return Ok(false),
        };
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin session delete transaction")?;
        let result = (|| -> Result<()> {
            self.conn
                .execute("DELETE FROM jobs WHERE run_id = ?1", params![session.run_id])?;
            self.conn
                .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            self.conn
                .execute("DELETE FROM runs WHERE id = ?1", params![session.run_id])?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(true)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e).context("Failed to delete session")
            }
        }
    }

    // ── Catalog records (seeded externally, read here) ────────────────

    pub fn get_tool(&self, slug_or_id: &str) -> Result<Option<Tool>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, slug, name, enabled, manifest FROM tools
                 WHERE slug = ?1 OR id = ?1",
            )
            .context("Failed to prepare get_tool")?;
        let row = stmt
            .query_row(params![slug_or_id], |row| {
                let manifest: Option<String> = row.get(4)?;
                Ok(Tool {
                    id: row.get(0)?,
                    slug: row.get(1)?,
                    name: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                    manifest: manifest.and_then(|m| serde_json::from_str(&m).ok()),
                })
            })
            .optional()
            .context("Failed to query tool")?;
        Ok(row)
    }

    pub fn get_scope(&self, id: &str) -> Result<Option<Scope>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, cidrs, host_patterns, active FROM scopes WHERE id = ?1")
            .context("Failed to prepare get_scope")?;
        let row = stmt
            .query_row(params![id], |row| {
                let cidrs: String = row.get(2)?;
                let hosts: String = row.get(3)?;
                Ok(Scope {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    cidrs: serde_json::from_str(&cidrs).unwrap_or_default(),
                    host_patterns: serde_json::from_str(&hosts).unwrap_or_default(),
                    active: row.get::<_, i64>(4)? != 0,
                })
            })
            .optional()
            .context("Failed to query scope")?;
        Ok(row)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, role FROM users WHERE id = ?1")
            .context("Failed to prepare get_user")?;
        let row = stmt
            .query_row(params![id], |row| {
                let role: String = row.get(2)?;
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    role: Role::from_str(&role).unwrap_or(Role::User),
                })
            })
            .optional()
            .context("Failed to query user")?;
        Ok(row)
    }

    pub fn seed_tool(&self, tool: &Tool) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO tools (id, slug, name, enabled, manifest)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tool.id,
                    tool.slug,
                    tool.name,
                    tool.enabled as i64,
                    tool.manifest.as_ref().map(|m| m.to_string()),
                ],
            )
            .context("Failed to seed tool")?;
        Ok(())
    }

    pub fn seed_scope(&self, scope: &Scope) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO scopes (id, name, cidrs, host_patterns, active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    scope.id,
                    scope.name,
                    serde_json::to_string(&scope.cidrs)?,
                    serde_json::to_string(&scope.host_patterns)?,
                    scope.active as i64,
                ],
            )
            .context("Failed to seed scope")?;
        Ok(())
    }

    pub fn seed_user(&self, user: &User) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO users (id, name, role) VALUES (?1, ?2, ?3)",
                params![user.id, user.name, user.role.as_str()],
            )
            .context("Failed to seed user")?;
        Ok(())
    }

    // ── Audit log ─────────────────────────────────────────────────────

    pub fn insert_audit(
        &self,
        actor: &str,
        action: &str,
        subject: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO audit_log (actor, action, subject, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![actor, action, subject, detail, now_ts()],
            )
            .context("Failed to insert audit record")?;
        Ok(())
    }

    /// Row-count helper used by cascade-deletion tests.
    pub fn count_rows_referencing_session(&self, session_id: &str, run_id: &str) -> Result<i64> {
        let steps: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE session_id = ?1",
            params![session_id],
            |r| r.get(0),
        )?;
        let findings: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM findings WHERE session_id = ?1 OR run_id = ?2",
            params![session_id, run_id],
            |r| r.get(0),
        )?;
        let runs: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(steps + findings + runs)
    }
}

// ── Row mappers ───────────────────────────────────────────────────────

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let params_text: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Run {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tool: row.get(2)?,
        scope_id: row.get(3)?,
        target: row.get(4)?,
        params: serde_json::from_str(&params_text).unwrap_or(serde_json::Value::Null),
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Pending),
        exit_code: row.get(7)?,
        error: row.get(8)?,
        timeout_secs: row.get::<_, i64>(9)? as u64,
        created_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

fn map_artifact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: row.get(0)?,
        run_id: row.get(1)?,
        name: row.get(2)?,
        content: row.get(3)?,
        size_bytes: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_finding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Finding> {
    let severity: String = row.get(4)?;
    Ok(Finding {
        id: row.get(0)?,
        run_id: row.get(1)?,
        session_id: row.get(2)?,
        phase: row.get(3)?,
        severity: Severity::from_str(&severity).unwrap_or(Severity::Info),
        title: row.get(5)?,
        description: row.get(6)?,
        evidence: row.get(7)?,
        remediation: row.get(8)?,
        exploitation: row.get(9)?,
        verification: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowSession> {
    let objective: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(WorkflowSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        target: row.get(2)?,
        objective: Objective::from_str(&objective).unwrap_or(Objective::Quick),
        name: row.get(4)?,
        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Created),
        current_phase: row.get(6)?,
        progress: row.get(7)?,
        risk_score: row.get(8)?,
        max_steps: row.get(9)?,
        run_id: row.get(10)?,
        error: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

fn map_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Step> {
    let status: String = row.get(4)?;
    Ok(Step {
        id: row.get(0)?,
        session_id: row.get(1)?,
        phase: row.get(2)?,
        name: row.get(3)?,
        status: StepStatus::from_str(&status).unwrap_or(StepStatus::Pending),
        error: row.get(5)?,
        impact: row.get(6)?,
        remediation: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}
