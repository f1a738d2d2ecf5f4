//! Run state store: the single source of truth for run status and dedup.
//!
//! Admission (`create_if_absent`) and status changes (`transition`) are
//! conditional writes, so concurrent duplicate webhook deliveries collapse
//! into one run and a stale worker can never overwrite a newer status.
//! Terminal rows are immutable: the transition table in `models` has no
//! successor for a terminal state, and the conditional `UPDATE` refuses
//! everything else.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StoreError;
use crate::models::{
    AnalysisDepth, CostSummary, FindingsSummary, Run, RunIdentity, RunStatus, ToolInvocation,
    ToolStatus,
};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Optional fields written together with a status transition. Summary
/// fields are only ever set on the way into a terminal state, where they
/// freeze.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub duration_ms: Option<i64>,
    pub findings_summary: Option<FindingsSummary>,
    pub cost_summary: Option<CostSummary>,
    pub artifact_root: Option<String>,
    pub error: Option<String>,
    pub partial: Option<bool>,
}

/// One tool invocation result ready to be recorded against a run.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub tool_name: String,
    pub input_digest: String,
    pub status: ToolStatus,
    pub output_ref: Option<String>,
    pub error_detail: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl StoreHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&RunDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Other(anyhow!("Store task panicked: {}", e)))?
    }
}

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) the SQLite database at the given path and run
    /// migrations. The parent directory is created if missing.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("Failed to set pragmas")?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    owner_repo TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    commit_sha TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    run_type TEXT NOT NULL DEFAULT 'fast',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    duration_ms INTEGER,
                    findings_summary TEXT,
                    cost_summary TEXT,
                    artifact_root TEXT,
                    error TEXT,
                    partial INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (owner_repo, pr_number, commit_sha)
                );

                CREATE TABLE IF NOT EXISTS tool_invocations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_repo TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    commit_sha TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    input_digest TEXT NOT NULL,
                    status TEXT NOT NULL,
                    output_ref TEXT,
                    error_detail TEXT,
                    duration_ms INTEGER,
                    created_at TEXT NOT NULL,
                    UNIQUE(owner_repo, pr_number, commit_sha, tool_name, input_digest)
                );

                CREATE TABLE IF NOT EXISTS pr_heads (
                    owner_repo TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    head_sha TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (owner_repo, pr_number)
                );

                CREATE INDEX IF NOT EXISTS idx_runs_pr ON runs(owner_repo, pr_number);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_invocations_run
                    ON tool_invocations(owner_repo, pr_number, commit_sha);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Run admission and transitions ─────────────────────────────────

    /// Atomic admission: insert a pending run unless a row already exists
    /// for the identity. Returns the stored run and whether this call
    /// created it. Duplicate webhook deliveries land here concurrently and
    /// exactly one of them observes `created = true`.
    pub fn create_if_absent(
        &self,
        identity: &RunIdentity,
        run_type: AnalysisDepth,
    ) -> Result<(Run, bool), StoreError> {
        let now = now_rfc3339();
        let inserted = self.conn.execute(
            "INSERT INTO runs (owner_repo, pr_number, commit_sha, status, run_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)
             ON CONFLICT(owner_repo, pr_number, commit_sha) DO NOTHING",
            params![
                identity.owner_repo,
                identity.pr_number,
                identity.commit_sha,
                run_type.as_str(),
                now
            ],
        )?;
        let run = self.get(identity)?;
        Ok((run, inserted > 0))
    }

    /// Optimistic-concurrency status change: succeeds only when the stored
    /// status still equals `from`. A zero-row update means someone else got
    /// there first (or the run vanished), reported as `TransitionConflict`
    /// (or `RunNotFound`). Non-monotonic pairs are rejected before touching
    /// the database.
    pub fn transition(
        &self,
        identity: &RunIdentity,
        from: RunStatus,
        to: RunStatus,
        update: &RunUpdate,
    ) -> Result<Run, StoreError> {
        if !from.can_transition_to(&to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let findings_json = update
            .findings_summary
            .as_ref()
            .map(|f| serde_json::to_string(f).context("Failed to serialize findings summary"))
            .transpose()?;
        let cost_json = update
            .cost_summary
            .as_ref()
            .map(|c| serde_json::to_string(c).context("Failed to serialize cost summary"))
            .transpose()?;

        let changed = self.conn.execute(
            "UPDATE runs SET
                status = ?1,
                updated_at = ?2,
                duration_ms = COALESCE(?3, duration_ms),
                findings_summary = COALESCE(?4, findings_summary),
                cost_summary = COALESCE(?5, cost_summary),
                artifact_root = COALESCE(?6, artifact_root),
                error = COALESCE(?7, error),
                partial = COALESCE(?8, partial)
             WHERE owner_repo = ?9 AND pr_number = ?10 AND commit_sha = ?11 AND status = ?12",
            params![
                to.as_str(),
                now_rfc3339(),
                update.duration_ms,
                findings_json,
                cost_json,
                update.artifact_root,
                update.error,
                update.partial.map(|p| p as i64),
                identity.owner_repo,
                identity.pr_number,
                identity.commit_sha,
                from.as_str(),
            ],
        )?;

        if changed == 0 {
            return match self.find(identity)? {
                Some(run) => Err(StoreError::TransitionConflict {
                    identity: identity.clone(),
                    expected: from,
                    actual: run.status,
                }),
                None => Err(StoreError::RunNotFound {
                    identity: identity.clone(),
                }),
            };
        }
        self.get(identity)
    }

    pub fn get(&self, identity: &RunIdentity) -> Result<Run, StoreError> {
        self.find(identity)?.ok_or_else(|| StoreError::RunNotFound {
            identity: identity.clone(),
        })
    }

    pub fn find(&self, identity: &RunIdentity) -> Result<Option<Run>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_repo, pr_number, commit_sha, status, run_type, created_at, updated_at,
                    duration_ms, findings_summary, cost_summary, artifact_root, error, partial
             FROM runs
             WHERE owner_repo = ?1 AND pr_number = ?2 AND commit_sha = ?3",
        )?;
        let row = stmt
            .query_row(
                params![identity.owner_repo, identity.pr_number, identity.commit_sha],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    /// Runs newest first, optionally filtered to one PR.
    pub fn list_runs(
        &self,
        filter: Option<(String, i64)>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let rows: Vec<RunRow> = match &filter {
            Some((owner_repo, pr_number)) => {
                let mut stmt = self.conn.prepare(
                    "SELECT owner_repo, pr_number, commit_sha, status, run_type, created_at,
                            updated_at, duration_ms, findings_summary, cost_summary,
                            artifact_root, error, partial
                     FROM runs
                     WHERE owner_repo = ?1 AND pr_number = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT ?3",
                )?;
                let collected = stmt
                    .query_map(params![owner_repo, pr_number, limit as i64], RunRow::from_row)?
                    .collect::<Result<_, _>>()?;
                collected
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT owner_repo, pr_number, commit_sha, status, run_type, created_at,
                            updated_at, duration_ms, findings_summary, cost_summary,
                            artifact_root, error, partial
                     FROM runs
                     ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                )?;
                let collected = stmt
                    .query_map(params![limit as i64], RunRow::from_row)?
                    .collect::<Result<_, _>>()?;
                collected
            }
        };
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Force every non-terminal run last touched before `cutoff` to
    /// `timed_out`. Used by the startup sweep and the watchdog fallback so
    /// no run stays open past its deadline plus grace.
    pub fn reclaim_overdue(&self, cutoff: &str) -> Result<Vec<Run>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_repo, pr_number, commit_sha, status FROM runs
             WHERE status IN ('pending', 'running_fast', 'running_deep') AND updated_at < ?1",
        )?;
        let overdue: Vec<(RunIdentity, RunStatus)> = stmt
            .query_map(params![cutoff], |row| {
                Ok((
                    RunIdentity::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ),
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(identity, status)| {
                let status = RunStatus::from_str(&status)
                    .map_err(|e| StoreError::Other(anyhow!("Corrupt run status: {}", e)))?;
                Ok::<_, StoreError>((identity, status))
            })
            .collect::<Result<_, _>>()?;

        let update = RunUpdate {
            error: Some("Run exceeded its deadline and was reclaimed".to_string()),
            ..Default::default()
        };
        let mut reclaimed = Vec::new();
        for (identity, status) in overdue {
            match self.transition(&identity, status, RunStatus::TimedOut, &update) {
                Ok(run) => reclaimed.push(run),
                // Raced by a worker that advanced it in the meantime.
                Err(StoreError::TransitionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    // ── Tool invocations ──────────────────────────────────────────────

    /// Record (or overwrite, on re-run of the same identity) the outcome of
    /// a tool invocation.
    pub fn record_invocation(
        &self,
        identity: &RunIdentity,
        record: &InvocationRecord,
    ) -> Result<ToolInvocation, StoreError> {
        self.conn.execute(
            "INSERT INTO tool_invocations
                (owner_repo, pr_number, commit_sha, tool_name, input_digest, status,
                 output_ref, error_detail, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(owner_repo, pr_number, commit_sha, tool_name, input_digest)
             DO UPDATE SET status = excluded.status,
                           output_ref = excluded.output_ref,
                           error_detail = excluded.error_detail,
                           duration_ms = excluded.duration_ms,
                           created_at = excluded.created_at",
            params![
                identity.owner_repo,
                identity.pr_number,
                identity.commit_sha,
                record.tool_name,
                record.input_digest,
                record.status.as_str(),
                record.output_ref,
                record.error_detail,
                record.duration_ms,
                now_rfc3339(),
            ],
        )?;
        self.find_invocation(identity, &record.tool_name, &record.input_digest)?
            .ok_or_else(|| StoreError::Other(anyhow!("Invocation not found after insert")))
    }

    pub fn find_invocation(
        &self,
        identity: &RunIdentity,
        tool_name: &str,
        input_digest: &str,
    ) -> Result<Option<ToolInvocation>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_repo, pr_number, commit_sha, tool_name, input_digest, status,
                    output_ref, error_detail, duration_ms, created_at
             FROM tool_invocations
             WHERE owner_repo = ?1 AND pr_number = ?2 AND commit_sha = ?3
               AND tool_name = ?4 AND input_digest = ?5",
        )?;
        let row = stmt
            .query_row(
                params![
                    identity.owner_repo,
                    identity.pr_number,
                    identity.commit_sha,
                    tool_name,
                    input_digest
                ],
                InvocationRow::from_row,
            )
            .optional()?;
        row.map(InvocationRow::into_invocation).transpose()
    }

    /// Cached successful outcome for an identical invocation within the
    /// same run attempt, if any. The digest is identity-scoped, so this
    /// never serves a result recorded for a different commit.
    pub fn cached_invocation(
        &self,
        identity: &RunIdentity,
        tool_name: &str,
        input_digest: &str,
    ) -> Result<Option<ToolInvocation>, StoreError> {
        Ok(self
            .find_invocation(identity, tool_name, input_digest)?
            .filter(|inv| inv.status == ToolStatus::Success))
    }

    pub fn invocations_for_run(
        &self,
        identity: &RunIdentity,
    ) -> Result<Vec<ToolInvocation>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_repo, pr_number, commit_sha, tool_name, input_digest, status,
                    output_ref, error_detail, duration_ms, created_at
             FROM tool_invocations
             WHERE owner_repo = ?1 AND pr_number = ?2 AND commit_sha = ?3
             ORDER BY id",
        )?;
        let rows: Vec<InvocationRow> = stmt
            .query_map(
                params![identity.owner_repo, identity.pr_number, identity.commit_sha],
                InvocationRow::from_row,
            )?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(InvocationRow::into_invocation).collect()
    }

    // ── PR heads ──────────────────────────────────────────────────────

    /// Record the newest commit seen for a PR. Last writer wins; the
    /// triggering event is the authority on the PR's current head.
    pub fn record_pr_head(
        &self,
        owner_repo: &str,
        pr_number: i64,
        head_sha: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO pr_heads (owner_repo, pr_number, head_sha, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_repo, pr_number)
             DO UPDATE SET head_sha = excluded.head_sha, updated_at = excluded.updated_at",
            params![owner_repo, pr_number, head_sha, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn pr_head(&self, owner_repo: &str, pr_number: i64) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT head_sha FROM pr_heads WHERE owner_repo = ?1 AND pr_number = ?2")?;
        Ok(stmt
            .query_row(params![owner_repo, pr_number], |row| row.get(0))
            .optional()?)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

struct RunRow {
    owner_repo: String,
    pr_number: i64,
    commit_sha: String,
    status: String,
    run_type: String,
    created_at: String,
    updated_at: String,
    duration_ms: Option<i64>,
    findings_summary: Option<String>,
    cost_summary: Option<String>,
    artifact_root: Option<String>,
    error: Option<String>,
    partial: i64,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            owner_repo: row.get(0)?,
            pr_number: row.get(1)?,
            commit_sha: row.get(2)?,
            status: row.get(3)?,
            run_type: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            duration_ms: row.get(7)?,
            findings_summary: row.get(8)?,
            cost_summary: row.get(9)?,
            artifact_root: row.get(10)?,
            error: row.get(11)?,
            partial: row.get(12)?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| StoreError::Other(anyhow!("Corrupt run status: {}", e)))?;
        let run_type = AnalysisDepth::from_str(&self.run_type)
            .map_err(|e| StoreError::Other(anyhow!("Corrupt run type: {}", e)))?;
        let findings_summary = self
            .findings_summary
            .as_deref()
            .map(|s| serde_json::from_str(s).context("Failed to parse findings summary"))
            .transpose()?;
        let cost_summary = self
            .cost_summary
            .as_deref()
            .map(|s| serde_json::from_str(s).context("Failed to parse cost summary"))
            .transpose()?;
        Ok(Run {
            owner_repo: self.owner_repo,
            pr_number: self.pr_number,
            commit_sha: self.commit_sha,
            status,
            run_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
            duration_ms: self.duration_ms,
            findings_summary,
            cost_summary,
            artifact_root: self.artifact_root,
            error: self.error,
            partial: self.partial != 0,
        })
    }
}

struct InvocationRow {
    id: i64,
    owner_repo: String,
    pr_number: i64,
    commit_sha: String,
    tool_name: String,
    input_digest: String,
    status: String,
    output_ref: Option<String>,
    error_detail: Option<String>,
    duration_ms: Option<i64>,
    created_at: String,
}

impl InvocationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            owner_repo: row.get(1)?,
            pr_number: row.get(2)?,
            commit_sha: row.get(3)?,
            tool_name: row.get(4)?,
            input_digest: row.get(5)?,
            status: row.get(6)?,
            output_ref: row.get(7)?,
            error_detail: row.get(8)?,
            duration_ms: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_invocation(self) -> Result<ToolInvocation, StoreError> {
        let status = ToolStatus::from_str(&self.status)
            .map_err(|e| StoreError::Other(anyhow!("Corrupt tool status: {}", e)))?;
        Ok(ToolInvocation {
            id: self.id,
            owner_repo: self.owner_repo,
            pr_number: self.pr_number,
            commit_sha: self.commit_sha,
            tool_name: self.tool_name,
            input_digest: self.input_digest,
            status,
            output_ref: self.output_ref,
            error_detail: self.error_detail,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Confidence;

    fn identity() -> RunIdentity {
        RunIdentity::new("acme/payments", 42, "aaa111bbb222")
    }

    fn db() -> RunDb {
        RunDb::new_in_memory().unwrap()
    }

    #[test]
    fn test_create_if_absent_collapses_duplicates() {
        let db = db();
        let (first, created) = db.create_if_absent(&identity(), AnalysisDepth::Fast).unwrap();
        assert!(created);
        assert_eq!(first.status, RunStatus::Pending);
        assert_eq!(first.run_type, AnalysisDepth::Fast);

        let (second, created) = db.create_if_absent(&identity(), AnalysisDepth::Deep).unwrap();
        assert!(!created);
        // the duplicate sees the original row, not its own run_type
        assert_eq!(second.run_type, AnalysisDepth::Fast);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_transition_happy_path_updates_timestamp() {
        let db = db();
        let (run, _) = db.create_if_absent(&identity(), AnalysisDepth::Fast).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let updated = db
            .transition(
                &identity(),
                RunStatus::Pending,
                RunStatus::RunningFast,
                &RunUpdate::default(),
            )
            .unwrap();
        assert_eq!(updated.status, RunStatus::RunningFast);
        assert!(updated.updated_at > run.updated_at);
    }

    #[test]
    fn test_transition_conflict_reports_actual_status() {
        let db = db();
        db.create_if_absent(&identity(), AnalysisDepth::Fast).unwrap();
        db.transition(
            &identity(),
            RunStatus::Pending,
            RunStatus::RunningFast,
            &RunUpdate::default(),
        )
        .unwrap();

        // a stale worker still believes the run is pending
        let err = db
            .transition(
                &identity(),
                RunStatus::Pending,
                RunStatus::RunningFast,
                &RunUpdate::default(),
            )
            .unwrap_err();
        match err {
            StoreError::TransitionConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, RunStatus::Pending);
                assert_eq!(actual, RunStatus::RunningFast);
            }
            other => panic!("Expected TransitionConflict, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let db = db();
        db.create_if_absent(&identity(), AnalysisDepth::Fast).unwrap();
        db.transition(
            &identity(),
            RunStatus::Pending,
            RunStatus::RunningFast,
            &RunUpdate::default(),
        )
        .unwrap();
        db.transition(
            &identity(),
            RunStatus::RunningFast,
            RunStatus::Completed,
            &RunUpdate::default(),
        )
        .unwrap();

        // no pair out of a terminal state is in the transition table
        let err = db
            .transition(
                &identity(),
                RunStatus::Completed,
                RunStatus::Failed,
                &RunUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // and a stale worker trying a formerly-valid pair hits the
        // conditional write instead
        let err = db
            .transition(
                &identity(),
                RunStatus::RunningFast,
                RunStatus::Failed,
                &RunUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::TransitionConflict { .. }));
    }

    #[test]
    fn test_terminal_transition_freezes_summaries() {
        let db = db();
        db.create_if_absent(&identity(), AnalysisDepth::Fast).unwrap();
        db.transition(
            &identity(),
            RunStatus::Pending,
            RunStatus::RunningFast,
            &RunUpdate::default(),
        )
        .unwrap();

        let update = RunUpdate {
            duration_ms: Some(1234),
            findings_summary: Some(FindingsSummary {
                high: 1,
                medium: 2,
                low: 3,
            }),
            cost_summary: Some(CostSummary {
                monthly_delta_usd: 41.5,
                confidence: Confidence::Medium,
            }),
            artifact_root: Some("acme/payments/42/aaa111bbb222".to_string()),
            error: None,
            partial: Some(true),
        };
        let run = db
            .transition(&identity(), RunStatus::RunningFast, RunStatus::Completed, &update)
            .unwrap();
        assert_eq!(run.duration_ms, Some(1234));
        assert_eq!(run.findings_summary.as_ref().unwrap().total(), 6);
        assert_eq!(run.cost_summary.as_ref().unwrap().monthly_delta_usd, 41.5);
        assert!(run.partial);

        let fetched = db.get(&identity()).unwrap();
        assert_eq!(fetched.findings_summary, run.findings_summary);
        assert_eq!(fetched.cost_summary, run.cost_summary);
    }

    #[test]
    fn test_get_missing_run_is_not_found() {
        let db = db();
        let err = db.get(&identity()).unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound { .. }));
        assert!(db.find(&identity()).unwrap().is_none());
    }

    #[test]
    fn test_list_runs_newest_first_with_filter() {
        let db = db();
        let a = RunIdentity::new("acme/payments", 42, "sha-a");
        let b = RunIdentity::new("acme/payments", 42, "sha-b");
        let other = RunIdentity::new("acme/web", 7, "sha-c");
        db.create_if_absent(&a, AnalysisDepth::Fast).unwrap();
        db.create_if_absent(&b, AnalysisDepth::Deep).unwrap();
        db.create_if_absent(&other, AnalysisDepth::Fast).unwrap();

        let all = db.list_runs(None, 10).unwrap();
        assert_eq!(all.len(), 3);

        let filtered = db
            .list_runs(Some(("acme/payments".to_string(), 42)), 10)
            .unwrap();
        assert_eq!(filtered.len(), 2);
        // newest insert first
        assert_eq!(filtered[0].commit_sha, "sha-b");
    }

    #[test]
    fn test_invocation_record_and_cache() {
        let db = db();
        db.create_if_absent(&identity(), AnalysisDepth::Fast).unwrap();

        let failed = InvocationRecord {
            tool_name: "security-scan".to_string(),
            input_digest: "d1".to_string(),
            status: ToolStatus::Failed,
            output_ref: None,
            error_detail: Some("boom".to_string()),
            duration_ms: Some(10),
        };
        db.record_invocation(&identity(), &failed).unwrap();
        // failures are never served from cache
        assert!(db.cached_invocation(&identity(), "security-scan", "d1").unwrap().is_none());

        let success = InvocationRecord {
            status: ToolStatus::Success,
            output_ref: Some("acme/payments/42/aaa111bbb222/security-scan.json".to_string()),
            error_detail: None,
            ..failed
        };
        let stored = db.record_invocation(&identity(), &success).unwrap();
        assert_eq!(stored.status, ToolStatus::Success);

        let cached = db
            .cached_invocation(&identity(), "security-scan", "d1")
            .unwrap()
            .expect("success should be cached");
        assert_eq!(cached.id, stored.id);

        let all = db.invocations_for_run(&identity()).unwrap();
        assert_eq!(all.len(), 1, "upsert must not duplicate rows");
    }

    #[test]
    fn test_pr_head_upsert() {
        let db = db();
        assert!(db.pr_head("acme/payments", 42).unwrap().is_none());
        db.record_pr_head("acme/payments", 42, "aaa").unwrap();
        assert_eq!(db.pr_head("acme/payments", 42).unwrap().as_deref(), Some("aaa"));
        db.record_pr_head("acme/payments", 42, "bbb").unwrap();
        assert_eq!(db.pr_head("acme/payments", 42).unwrap().as_deref(), Some("bbb"));
    }

    #[test]
    fn test_reclaim_overdue_times_out_stale_runs() {
        let db = db();
        db.create_if_absent(&identity(), AnalysisDepth::Deep).unwrap();
        db.transition(
            &identity(),
            RunStatus::Pending,
            RunStatus::RunningFast,
            &RunUpdate::default(),
        )
        .unwrap();

        // nothing is overdue against a cutoff in the past
        let cutoff = "2000-01-01T00:00:00.000Z";
        assert!(db.reclaim_overdue(cutoff).unwrap().is_empty());

        // everything is overdue against a cutoff in the future
        let cutoff = "2999-01-01T00:00:00.000Z";
        let reclaimed = db.reclaim_overdue(cutoff).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, RunStatus::TimedOut);
        assert!(reclaimed[0].error.as_deref().unwrap().contains("reclaimed"));

        // reclaim is idempotent: terminal rows are skipped
        assert!(db.reclaim_overdue(cutoff).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_handle_runs_on_blocking_pool() {
        let handle = StoreHandle::new(RunDb::new_in_memory().unwrap());
        let id = identity();
        let (run, created) = handle
            .call(move |db| db.create_if_absent(&id, AnalysisDepth::Fast))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(run.status, RunStatus::Pending);

        let id = identity();
        let run = handle
            .call(move |db| {
                db.transition(&id, RunStatus::Pending, RunStatus::RunningFast, &RunUpdate::default())
            })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::RunningFast);
    }

    #[test]
    fn test_new_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let db = RunDb::new(&path).unwrap();
        db.create_if_absent(&identity(), AnalysisDepth::Fast).unwrap();
        assert!(path.exists());
    }
}
