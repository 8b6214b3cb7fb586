//! Session Store
//!
//! Durable record of every research task (root or child), its position in
//! the task tree, and its status. Backed by SQLite in WAL mode so status
//! polling and list views never block behind an in-flight writer, and a
//! crash between appending and applying loses no committed update.
//!
//! Discipline: one writer per row (the orchestrator task driving that
//! session, plus the detacher's liveness reconciliation), any number of
//! concurrent readers. All mutation goes through transactional updates.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ResearchError, Result};

/// Lifecycle status of a research session.
///
/// Transitions are monotonic: each status may only move to one with a
/// strictly higher rank, and terminal statuses never change again.
/// `FanningOut`/`AwaitingChildren` are skipped when a task finds no gaps
/// or has hit the depth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Init,
    Streaming,
    AnalyzingGaps,
    FanningOut,
    AwaitingChildren,
    Synthesizing,
    Done,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Streaming => "streaming",
            Self::AnalyzingGaps => "analyzing_gaps",
            Self::FanningOut => "fanning_out",
            Self::AwaitingChildren => "awaiting_children",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "streaming" => Some(Self::Streaming),
            "analyzing_gaps" => Some(Self::AnalyzingGaps),
            "fanning_out" => Some(Self::FanningOut),
            "awaiting_children" => Some(Self::AwaitingChildren),
            "synthesizing" => Some(Self::Synthesizing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Position in the state machine's partial order.
    fn rank(&self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Streaming => 1,
            Self::AnalyzingGaps => 2,
            Self::FanningOut => 3,
            Self::AwaitingChildren => 4,
            Self::Synthesizing => 5,
            Self::Done | Self::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(&self, next: Status) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One research task's durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    /// Remote service's opaque session token, set after the first
    /// successful call.
    pub interaction_id: Option<String>,
    /// Null for roots.
    pub parent_id: Option<i64>,
    /// Root = 0, child = parent.depth + 1.
    pub depth: u32,
    pub status: Status,
    pub prompt: String,
    /// Set at most once, on the transition into a terminal status.
    pub report: Option<String>,
    /// Set when status is `Failed`.
    pub failure_reason: Option<String>,
    /// OS process id, headless executions only.
    pub pid: Option<i32>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Session enriched with its parent's status, for list views.
#[derive(Debug, Clone)]
pub struct ListedSession {
    pub session: Session,
    pub parent_status: Option<Status>,
}

/// Filter for `SessionStore::list`.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<Status>,
    pub roots_only: bool,
    pub limit: Option<usize>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    /// SELECT statements issued by `list`. Guards against the per-row
    /// parent-lookup pattern creeping back in.
    list_selects: AtomicU64,
}

/// Cloneable handle to the session database. Injected explicitly into
/// every component that needs it.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    /// Open or create the session database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                list_selects: AtomicU64::new(0),
            }),
        };
        store.init_schema()?;

        info!("Session store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                list_selects: AtomicU64::new(0),
            }),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.inner.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                interaction_id TEXT,
                parent_id INTEGER REFERENCES sessions(id) ON DELETE CASCADE,
                depth INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'init',
                prompt TEXT NOT NULL,
                report TEXT,
                failure_reason TEXT,
                pid INTEGER,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_interaction ON sessions(interaction_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);
            "#,
        )?;
        Ok(())
    }

    fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
        let status_text: String = row.get("status")?;
        Ok(Session {
            id: row.get("id")?,
            interaction_id: row.get("interaction_id")?,
            parent_id: row.get("parent_id")?,
            depth: row.get("depth")?,
            status: Status::parse(&status_text).unwrap_or(Status::Failed),
            prompt: row.get("prompt")?,
            report: row.get("report")?,
            failure_reason: row.get("failure_reason")?,
            pid: row.get("pid")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Create a session row. Validates the parent reference and the depth
    /// invariant (child depth is exactly parent depth + 1, roots are 0).
    pub fn create(&self, prompt: &str, parent_id: Option<i64>, depth: u32) -> Result<i64> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;

        match parent_id {
            Some(pid) => {
                let parent_depth: Option<u32> = tx
                    .query_row("SELECT depth FROM sessions WHERE id = ?1", params![pid], |r| {
                        r.get(0)
                    })
                    .optional()?;
                let parent_depth = parent_depth.ok_or_else(|| {
                    ResearchError::Validation(format!("parent session {} does not exist", pid))
                })?;
                if depth != parent_depth + 1 {
                    return Err(ResearchError::Validation(format!(
                        "child depth must be {} (parent depth + 1), got {}",
                        parent_depth + 1,
                        depth
                    )));
                }
            }
            None => {
                if depth != 0 {
                    return Err(ResearchError::Validation(format!(
                        "root session must have depth 0, got {}",
                        depth
                    )));
                }
            }
        }

        let now = Utc::now().timestamp();
        tx.execute(
            "INSERT INTO sessions (parent_id, depth, status, prompt, created_at, updated_at)
             VALUES (?1, ?2, 'init', ?3, ?4, ?4)",
            params![parent_id, depth, prompt, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!("Created session {} (parent={:?}, depth={})", id, parent_id, depth);
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<Session> {
        let conn = self.inner.conn.lock();
        conn.query_row("SELECT * FROM sessions WHERE id = ?1", params![id], Self::row_to_session)
            .optional()?
            .ok_or(ResearchError::NotFound(id))
    }

    /// Advance a session's status. Fails with `InvalidTransition` for any
    /// non-monotonic move; a report is only accepted on the transition
    /// into a terminal status, and only once.
    pub fn update_status(&self, id: i64, new_status: Status, report: Option<&str>) -> Result<()> {
        if report.is_some() && !new_status.is_terminal() {
            return Err(ResearchError::Validation(
                "report may only be written on a terminal transition".into(),
            ));
        }

        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;

        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, report FROM sessions WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (status_text, existing_report) = current.ok_or(ResearchError::NotFound(id))?;
        let current_status = Status::parse(&status_text).unwrap_or(Status::Failed);

        if !current_status.can_transition(new_status) {
            return Err(ResearchError::InvalidTransition {
                from: current_status,
                to: new_status,
            });
        }
        if report.is_some() && existing_report.is_some() {
            return Err(ResearchError::Validation(format!(
                "session {} already has a report",
                id
            )));
        }

        let now = Utc::now().timestamp();
        tx.execute(
            "UPDATE sessions SET status = ?1, report = COALESCE(?2, report), updated_at = ?3
             WHERE id = ?4",
            params![new_status.as_str(), report, now, id],
        )?;
        tx.commit()?;

        debug!("Session {}: {} -> {}", id, current_status, new_status);
        Ok(())
    }

    /// Terminal failure with a recorded reason. Legal from any
    /// non-terminal status; a partial report is kept if one was produced.
    pub fn mark_failed(&self, id: i64, reason: &str, partial_report: Option<&str>) -> Result<()> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;

        let status_text: Option<String> = tx
            .query_row("SELECT status FROM sessions WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        let status_text = status_text.ok_or(ResearchError::NotFound(id))?;
        let current = Status::parse(&status_text).unwrap_or(Status::Failed);

        if current.is_terminal() {
            return Err(ResearchError::InvalidTransition {
                from: current,
                to: Status::Failed,
            });
        }

        let now = Utc::now().timestamp();
        tx.execute(
            "UPDATE sessions
             SET status = 'failed', failure_reason = ?1,
                 report = COALESCE(report, ?2), updated_at = ?3
             WHERE id = ?4",
            params![reason, partial_report, now, id],
        )?;
        tx.commit()?;

        debug!("Session {} failed: {}", id, reason);
        Ok(())
    }

    /// Record the remote service's interaction token after the first
    /// successful call.
    pub fn set_interaction_id(&self, id: i64, interaction_id: &str) -> Result<()> {
        self.set_field(id, "interaction_id", |tx, now| {
            tx.execute(
                "UPDATE sessions SET interaction_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![interaction_id, now, id],
            )
        })
    }

    /// Record the detached process id for a headless execution.
    pub fn set_pid(&self, id: i64, pid: i32) -> Result<()> {
        self.set_field(id, "pid", |tx, now| {
            tx.execute(
                "UPDATE sessions SET pid = ?1, updated_at = ?2 WHERE id = ?3",
                params![pid, now, id],
            )
        })
    }

    fn set_field<F>(&self, id: i64, field: &str, update: F) -> Result<()>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, i64) -> rusqlite::Result<usize>,
    {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();
        let changed = update(&tx, now)?;
        if changed == 0 {
            return Err(ResearchError::NotFound(id));
        }
        tx.commit()?;
        debug!("Session {}: set {}", id, field);
        Ok(())
    }

    /// List sessions (newest first), each enriched with its parent's
    /// status. Issues exactly two SELECTs regardless of result size: one
    /// for the rows, one batched `IN (...)` lookup for all referenced
    /// parents. A per-row follow-up query here degrades linearly with
    /// session count.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<ListedSession>> {
        let conn = self.inner.conn.lock();

        let mut sql = String::from("SELECT * FROM sessions WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?1");
        }
        if filter.roots_only {
            sql.push_str(" AND parent_id IS NULL");
        }
        sql.push_str(" ORDER BY updated_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.inner.list_selects.fetch_add(1, Ordering::Relaxed);
        let mut stmt = conn.prepare(&sql)?;
        let sessions: Vec<Session> = match filter.status {
            Some(status) => stmt
                .query_map(params![status.as_str()], Self::row_to_session)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map([], Self::row_to_session)?
                .collect::<rusqlite::Result<_>>()?,
        };

        // Pre-fetch every referenced parent in one batch.
        let parent_ids: Vec<i64> = {
            let mut ids: Vec<i64> = sessions.iter().filter_map(|s| s.parent_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        let mut parent_statuses: HashMap<i64, Status> = HashMap::new();
        if !parent_ids.is_empty() {
            let placeholders = vec!["?"; parent_ids.len()].join(",");
            let sql = format!("SELECT id, status FROM sessions WHERE id IN ({})", placeholders);
            self.inner.list_selects.fetch_add(1, Ordering::Relaxed);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(parent_ids.iter()), |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, status_text) = row?;
                if let Some(status) = Status::parse(&status_text) {
                    parent_statuses.insert(id, status);
                }
            }
        }

        Ok(sessions
            .into_iter()
            .map(|session| {
                let parent_status = session.parent_id.and_then(|p| parent_statuses.get(&p).copied());
                ListedSession {
                    session,
                    parent_status,
                }
            })
            .collect())
    }

    /// SELECTs issued by `list` so far. Regression hook for the N+1
    /// lookup pattern.
    pub fn list_select_count(&self) -> u64 {
        self.inner.list_selects.load(Ordering::Relaxed)
    }

    /// Non-terminal sessions with a recorded process id, for liveness
    /// reconciliation.
    pub fn sessions_with_pid(&self) -> Result<Vec<Session>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM sessions
             WHERE pid IS NOT NULL AND status NOT IN ('done', 'failed')",
        )?;
        let sessions = stmt
            .query_map([], Self::row_to_session)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(sessions)
    }

    /// Child sessions of `parent_id` in creation order.
    pub fn children(&self, parent_id: i64) -> Result<Vec<Session>> {
        let conn = self.inner.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM sessions WHERE parent_id = ?1 ORDER BY id ASC")?;
        let sessions = stmt
            .query_map(params![parent_id], Self::row_to_session)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(sessions)
    }

    /// Delete a session. Cascade policy: the whole subtree goes with it.
    /// Orphaning children would break the depth invariant against any
    /// reachable root.
    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.inner.conn.lock();
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(ResearchError::NotFound(id));
        }
        info!("Deleted session {} (and descendants)", id);
        Ok(())
    }
}
