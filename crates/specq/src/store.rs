//! Durable state store: changes, tasks, votes, and the run log.
//!
//! SQLite is the reference backend (see `rusqlite`). File-backed
//! databases run in WAL journal mode; `:memory:` databases (used by
//! tests) do not need it. The store is the single source of truth —
//! the pipeline loop keeps no cache across cycles.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use specq_types::{LogEvent, Risk, Status, Task, VerificationStrategy, VoteResult, WorkItem};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS work_items (
    id TEXT PRIMARY KEY,
    change_dir TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    deps TEXT NOT NULL,
    priority INTEGER NOT NULL,
    risk TEXT NOT NULL,
    executor_type TEXT NOT NULL,
    executor_model TEXT NOT NULL,
    executor_max_turns INTEGER NOT NULL,
    executor_tools TEXT NOT NULL,
    verification_strategy TEXT,
    voters TEXT NOT NULL,
    max_retries INTEGER NOT NULL,
    max_duration_sec INTEGER NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    compiled_brief TEXT NOT NULL,
    error_message TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    work_item_id TEXT NOT NULL,
    id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    files_changed TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    execution_output TEXT NOT NULL,
    turns_used INTEGER NOT NULL,
    tokens_in INTEGER NOT NULL,
    tokens_out INTEGER NOT NULL,
    duration_sec REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (work_item_id, id)
);

CREATE TABLE IF NOT EXISTS vote_results (
    work_item_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    voter TEXT NOT NULL,
    verdict TEXT NOT NULL,
    confidence REAL NOT NULL,
    findings TEXT NOT NULL,
    summary TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vote_results_attempt ON vote_results (work_item_id, attempt);

CREATE TABLE IF NOT EXISTS run_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id TEXT NOT NULL,
    event TEXT NOT NULL,
    detail TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// Durable store backed by one SQLite connection.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if absent) a file-backed store with WAL enabled.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and one-shot commands.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to initialize store schema")
    }

    /// Idempotent upsert of a change and its tasks. Replaces the
    /// change row and the full task set in one transaction.
    pub fn upsert_work_item(&mut self, item: &WorkItem) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute(
            "INSERT INTO work_items (
                id, change_dir, title, description, deps, priority, risk,
                executor_type, executor_model, executor_max_turns, executor_tools,
                verification_strategy, voters, max_retries, max_duration_sec,
                status, retry_count, compiled_brief, error_message, created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
            ON CONFLICT(id) DO UPDATE SET
                change_dir=excluded.change_dir,
                title=excluded.title,
                description=excluded.description,
                deps=excluded.deps,
                priority=excluded.priority,
                risk=excluded.risk,
                executor_type=excluded.executor_type,
                executor_model=excluded.executor_model,
                executor_max_turns=excluded.executor_max_turns,
                executor_tools=excluded.executor_tools,
                verification_strategy=excluded.verification_strategy,
                voters=excluded.voters,
                max_retries=excluded.max_retries,
                max_duration_sec=excluded.max_duration_sec,
                status=excluded.status,
                retry_count=excluded.retry_count,
                compiled_brief=excluded.compiled_brief,
                error_message=excluded.error_message,
                updated_at=excluded.updated_at",
            params![
                item.id,
                item.change_dir,
                item.title,
                item.description,
                serde_json::to_string(&item.deps)?,
                item.priority,
                risk_to_str(item.risk),
                item.executor_type,
                item.executor_model,
                item.executor_max_turns,
                serde_json::to_string(&item.executor_tools)?,
                item.verification_strategy.map(strategy_to_str),
                serde_json::to_string(&item.voters)?,
                item.max_retries,
                item.max_duration_sec as i64,
                status_to_str(item.status),
                item.retry_count,
                item.compiled_brief,
                item.error_message,
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
            ],
        )?;

        tx.execute("DELETE FROM tasks WHERE work_item_id = ?1", params![item.id])?;
        for (seq, task) in item.tasks.iter().enumerate() {
            tx.execute(
                "INSERT INTO tasks (
                    work_item_id, id, seq, title, description, status, files_changed,
                    commit_hash, execution_output, turns_used, tokens_in, tokens_out,
                    duration_sec, created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    item.id,
                    task.id,
                    seq as i64,
                    task.title,
                    task.description,
                    status_to_str(task.status),
                    serde_json::to_string(&task.files_changed)?,
                    task.commit_hash,
                    task.execution_output,
                    task.turns_used,
                    task.tokens_in,
                    task.tokens_out,
                    task.duration_sec,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit().context("failed to commit work item upsert")
    }

    /// Load one change by id, with its tasks in source order.
    pub fn load_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, change_dir, title, description, deps, priority, risk,
                executor_type, executor_model, executor_max_turns, executor_tools,
                verification_strategy, voters, max_retries, max_duration_sec,
                status, retry_count, compiled_brief, error_message, created_at, updated_at
             FROM work_items WHERE id = ?1",
        )?;
        let item = stmt
            .query_row(params![id], row_to_work_item)
            .optional()
            .context("failed to load work item")?;

        let Some(mut item) = item else { return Ok(None) };
        item.tasks = self.load_tasks(id)?;
        item.vote_results = self.latest_votes(id, item.retry_count + 1)?;
        Ok(Some(item))
    }

    /// Load every change known to the store, sorted by id.
    pub fn load_all(&self) -> Result<Vec<WorkItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, change_dir, title, description, deps, priority, risk,
                executor_type, executor_model, executor_max_turns, executor_tools,
                verification_strategy, voters, max_retries, max_duration_sec,
                status, retry_count, compiled_brief, error_message, created_at, updated_at
             FROM work_items ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_work_item)?;
        let mut items = Vec::new();
        for row in rows {
            let mut item = row?;
            item.tasks = self.load_tasks(&item.id)?;
            item.vote_results = self.latest_votes(&item.id, item.retry_count + 1)?;
            items.push(item);
        }
        Ok(items)
    }

    fn load_tasks(&self, work_item_id: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, status, files_changed, commit_hash,
                execution_output, turns_used, tokens_in, tokens_out, duration_sec,
                created_at, updated_at
             FROM tasks WHERE work_item_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![work_item_id], |row| {
            Ok(Task {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                status: str_to_status(&row.get::<_, String>(3)?),
                files_changed: json_col(row, 4)?,
                commit_hash: row.get(5)?,
                execution_output: row.get(6)?,
                turns_used: row.get(7)?,
                tokens_in: row.get::<_, i64>(8)? as u64,
                tokens_out: row.get::<_, i64>(9)? as u64,
                duration_sec: row.get(10)?,
                created_at: parse_dt(row.get::<_, String>(11)?),
                updated_at: parse_dt(row.get::<_, String>(12)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to load tasks")
    }

    /// Persist one attempt's vote results for a change, replacing any
    /// previously-recorded votes for that same attempt.
    pub fn record_votes(&mut self, change_id: &str, attempt: u32, votes: &[VoteResult]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM vote_results WHERE work_item_id = ?1 AND attempt = ?2",
            params![change_id, attempt],
        )?;
        for vote in votes {
            tx.execute(
                "INSERT INTO vote_results (work_item_id, attempt, voter, verdict, confidence, findings, summary)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    change_id,
                    attempt,
                    vote.voter,
                    verdict_to_str(vote.verdict),
                    vote.confidence,
                    serde_json::to_string(&vote.findings)?,
                    vote.summary,
                ],
            )?;
        }
        tx.commit().context("failed to record votes")
    }

    /// Load the vote results recorded for one attempt.
    pub fn votes_for_attempt(&self, change_id: &str, attempt: u32) -> Result<Vec<VoteResult>> {
        self.latest_votes(change_id, attempt)
    }

    fn latest_votes(&self, change_id: &str, attempt: u32) -> Result<Vec<VoteResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT voter, verdict, confidence, findings, summary
             FROM vote_results WHERE work_item_id = ?1 AND attempt = ?2",
        )?;
        let rows = stmt.query_map(params![change_id, attempt], |row| {
            Ok(VoteResult {
                voter: row.get(0)?,
                verdict: str_to_verdict(&row.get::<_, String>(1)?),
                confidence: row.get(2)?,
                findings: json_col(row, 3)?,
                summary: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to load votes")
    }

    /// Append one entry to the run log.
    pub fn append_log(&mut self, event: &LogEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_log (change_id, event, detail, created_at) VALUES (?1,?2,?3,?4)",
                params![
                    event.change_id,
                    event.event,
                    serde_json::to_string(&event.detail)?,
                    event.created_at.to_rfc3339(),
                ],
            )
            .context("failed to append log event")?;
        Ok(())
    }

    /// Load the run log for one change, in append order.
    pub fn log_for(&self, change_id: &str) -> Result<Vec<LogEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT change_id, event, detail, created_at FROM run_log WHERE change_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![change_id], |row| {
            Ok(LogEvent {
                change_id: row.get(0)?,
                event: row.get(1)?,
                detail: json_col(row, 2)?,
                created_at: parse_dt(row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to load run log")
    }
}

fn row_to_work_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        change_dir: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        deps: json_col(row, 4)?,
        priority: row.get(5)?,
        risk: str_to_risk(&row.get::<_, String>(6)?),
        executor_type: row.get(7)?,
        executor_model: row.get(8)?,
        executor_max_turns: row.get(9)?,
        executor_tools: json_col(row, 10)?,
        verification_strategy: row
            .get::<_, Option<String>>(11)?
            .map(|s| str_to_strategy(&s)),
        voters: json_col(row, 12)?,
        max_retries: row.get(13)?,
        max_duration_sec: row.get::<_, i64>(14)? as u64,
        status: str_to_status(&row.get::<_, String>(15)?),
        tasks: Vec::new(),
        retry_count: row.get(16)?,
        vote_results: Vec::new(),
        compiled_brief: row.get(17)?,
        error_message: row.get(18)?,
        created_at: parse_dt(row.get::<_, String>(19)?),
        updated_at: parse_dt(row.get::<_, String>(20)?),
    })
}

fn json_col<T: serde::de::DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_dt(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn status_to_str(s: Status) -> &'static str {
    match s {
        Status::Pending => "pending",
        Status::Blocked => "blocked",
        Status::Ready => "ready",
        Status::Compiling => "compiling",
        Status::Running => "running",
        Status::Verifying => "verifying",
        Status::NeedsReview => "needs_review",
        Status::Accepted => "accepted",
        Status::Rejected => "rejected",
        Status::Failed => "failed",
        Status::Skipped => "skipped",
    }
}

fn str_to_status(s: &str) -> Status {
    match s {
        "blocked" => Status::Blocked,
        "ready" => Status::Ready,
        "compiling" => Status::Compiling,
        "running" => Status::Running,
        "verifying" => Status::Verifying,
        "needs_review" => Status::NeedsReview,
        "accepted" => Status::Accepted,
        "rejected" => Status::Rejected,
        "failed" => Status::Failed,
        "skipped" => Status::Skipped,
        _ => Status::Pending,
    }
}

fn risk_to_str(r: Risk) -> &'static str {
    match r {
        Risk::Low => "low",
        Risk::Medium => "medium",
        Risk::High => "high",
    }
}

fn str_to_risk(s: &str) -> Risk {
    match s {
        "low" => Risk::Low,
        "high" => Risk::High,
        _ => Risk::Medium,
    }
}

fn strategy_to_str(s: VerificationStrategy) -> &'static str {
    match s {
        VerificationStrategy::Skip => "skip",
        VerificationStrategy::Majority => "majority",
        VerificationStrategy::Unanimous => "unanimous",
    }
}

fn str_to_strategy(s: &str) -> VerificationStrategy {
    match s {
        "skip" => VerificationStrategy::Skip,
        "unanimous" => VerificationStrategy::Unanimous,
        _ => VerificationStrategy::Majority,
    }
}

fn verdict_to_str(v: specq_types::Verdict) -> &'static str {
    match v {
        specq_types::Verdict::Pass => "pass",
        specq_types::Verdict::Fail => "fail",
        specq_types::Verdict::Error => "error",
    }
}

fn str_to_verdict(s: &str) -> specq_types::Verdict {
    match s {
        "pass" => specq_types::Verdict::Pass,
        "fail" => specq_types::Verdict::Fail,
        _ => specq_types::Verdict::Error,
    }
}
