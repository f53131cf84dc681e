//! SQLite persistence: single connection, WAL mode, versioned migrations.
//! The DB file lives at `{home}/data.db`. All writes go through the one
//! connection behind a mutex; row structs and CRUD free functions per table.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::CoreError;

pub mod json_import;

const DB_FILE: &str = "data.db";

/// Current schema version stamped in `user_version`. Each step is idempotent
/// and forward-only; never renumber.
const SCHEMA_VERSION: i64 = 2;

/// RFC 3339 timestamp for "now".
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Unix milliseconds for "now" (job scheduling).
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shared handle over the single write-serialized connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Db {
    /// Open (or create) the store under `home` and run migrations. A failed
    /// migration deletes the partial file so the next startup retries cleanly.
    pub fn open(home: &Path) -> Result<Self, CoreError> {
        std::fs::create_dir_all(home)?;
        let path = home.join(DB_FILE);
        let conn = Connection::open(&path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.clone()),
        };
        db.configure()?;
        if let Err(e) = db.migrate() {
            drop(db);
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    fn configure(&self) -> Result<(), CoreError> {
        let conn = self.lock();
        if self.path.is_some() {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), CoreError> {
        let mut conn = self.lock();
        let mut version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        while version < SCHEMA_VERSION {
            let next = version + 1;
            let tx = conn.transaction()?;
            apply_migration(&tx, next)?;
            tx.pragma_update(None, "user_version", next)?;
            tx.commit()?;
            tracing::info!(version = next, "applied schema migration");
            version = next;
        }
        Ok(())
    }

    /// Delete the DB file, used when a post-migration import fails so the next
    /// startup retries from scratch.
    pub fn destroy(self) -> Result<(), CoreError> {
        let path = self.path.clone();
        drop(self);
        if let Some(path) = path {
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_file(path.with_extension("db-wal"));
            let _ = std::fs::remove_file(path.with_extension("db-shm"));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Run a closure against the connection. Serializes all access.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, CoreError> {
        let conn = self.lock();
        f(&conn).map_err(Into::into)
    }
}

fn apply_migration(conn: &Connection, version: i64) -> Result<(), CoreError> {
    match version {
        1 => conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS agents (
                id                TEXT PRIMARY KEY,
                name              TEXT NOT NULL,
                command_template  TEXT NOT NULL,
                continue_template TEXT,
                headless_template TEXT,
                description       TEXT,
                is_built_in       INTEGER NOT NULL DEFAULT 0,
                activity_patterns TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repositories (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                path             TEXT NOT NULL UNIQUE,
                description      TEXT,
                setup_command    TEXT,
                cleanup_command  TEXT,
                env_vars         TEXT,
                default_agent_id TEXT REFERENCES agents(id) ON DELETE SET NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS worktrees (
                id            TEXT PRIMARY KEY,
                repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                path          TEXT NOT NULL UNIQUE,
                index_number  INTEGER NOT NULL,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_worktrees_repository ON worktrees(repository_id);

            CREATE TABLE IF NOT EXISTS repository_slack_integrations (
                id            TEXT PRIMARY KEY,
                repository_id TEXT NOT NULL UNIQUE REFERENCES repositories(id) ON DELETE CASCADE,
                webhook_url   TEXT NOT NULL,
                enabled       INTEGER NOT NULL DEFAULT 1,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id             TEXT PRIMARY KEY,
                type           TEXT NOT NULL,
                location_path  TEXT NOT NULL,
                server_pid     INTEGER,
                initial_prompt TEXT,
                title          TEXT,
                repository_id  TEXT,
                worktree_id    TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workers (
                id          TEXT PRIMARY KEY,
                session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                type        TEXT NOT NULL,
                name        TEXT NOT NULL,
                pid         INTEGER,
                agent_id    TEXT,
                base_commit TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workers_session ON workers(session_id);

            CREATE TABLE IF NOT EXISTS jobs (
                id            TEXT PRIMARY KEY,
                type          TEXT NOT NULL,
                payload       TEXT NOT NULL,
                status        TEXT NOT NULL,
                priority      INTEGER NOT NULL DEFAULT 0,
                attempts      INTEGER NOT NULL DEFAULT 0,
                max_attempts  INTEGER NOT NULL DEFAULT 3,
                next_retry_at INTEGER NOT NULL DEFAULT 0,
                last_error    TEXT,
                created_at    TEXT NOT NULL,
                started_at    TEXT,
                completed_at  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_type ON jobs(type);
            ",
        ).map_err(Into::into),
        2 => conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS inbound_event_notifications (
                id            TEXT PRIMARY KEY,
                job_id        TEXT NOT NULL,
                session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                worker_id     TEXT NOT NULL,
                handler_id    TEXT NOT NULL,
                event_type    TEXT NOT NULL,
                event_summary TEXT NOT NULL,
                status        TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                notified_at   TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_inbound_event_dedup
                ON inbound_event_notifications(job_id, session_id, worker_id, handler_id);
            ",
        ).map_err(Into::into),
        other => Err(CoreError::InvalidInput(format!(
            "unknown schema version {other}"
        ))),
    }
}

// -- sessions --

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub session_type: String,
    pub location_path: String,
    pub server_pid: Option<i64>,
    pub initial_prompt: Option<String>,
    pub title: Option<String>,
    pub repository_id: Option<String>,
    pub worktree_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn upsert_session(conn: &Connection, row: &SessionRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sessions
         (id, type, location_path, server_pid, initial_prompt, title, repository_id, worktree_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            row.id,
            row.session_type,
            row.location_path,
            row.server_pid,
            row.initial_prompt,
            row.title,
            row.repository_id,
            row.worktree_id,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn delete_session(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let n = conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?;
    Ok(n > 0)
}

pub fn list_sessions(conn: &Connection) -> rusqlite::Result<Vec<SessionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, type, location_path, server_pid, initial_prompt, title, repository_id, worktree_id, created_at, updated_at
         FROM sessions ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([], row_to_session)?;
    rows.collect()
}

pub fn get_session(conn: &Connection, id: &str) -> rusqlite::Result<Option<SessionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, type, location_path, server_pid, initial_prompt, title, repository_id, worktree_id, created_at, updated_at
         FROM sessions WHERE id = ?1",
    )?;
    let mut rows = stmt.query(rusqlite::params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        session_type: row.get(1)?,
        location_path: row.get(2)?,
        server_pid: row.get(3)?,
        initial_prompt: row.get(4)?,
        title: row.get(5)?,
        repository_id: row.get(6)?,
        worktree_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// -- workers --

#[derive(Debug, Clone)]
pub struct WorkerRow {
    pub id: String,
    pub session_id: String,
    pub worker_type: String,
    pub name: String,
    pub pid: Option<i64>,
    pub agent_id: Option<String>,
    pub base_commit: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Replace the session's worker rows with the given set.
pub fn replace_session_workers(
    conn: &Connection,
    session_id: &str,
    workers: &[WorkerRow],
) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM workers WHERE session_id = ?1",
        rusqlite::params![session_id],
    )?;
    for w in workers {
        conn.execute(
            "INSERT OR REPLACE INTO workers
             (id, session_id, type, name, pid, agent_id, base_commit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                w.id,
                w.session_id,
                w.worker_type,
                w.name,
                w.pid,
                w.agent_id,
                w.base_commit,
                w.created_at,
                w.updated_at,
            ],
        )?;
    }
    Ok(())
}

pub fn list_session_workers(
    conn: &Connection,
    session_id: &str,
) -> rusqlite::Result<Vec<WorkerRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, type, name, pid, agent_id, base_commit, created_at, updated_at
         FROM workers WHERE session_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![session_id], row_to_worker)?;
    rows.collect()
}

fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<WorkerRow> {
    Ok(WorkerRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        worker_type: row.get(2)?,
        name: row.get(3)?,
        pid: row.get(4)?,
        agent_id: row.get(5)?,
        base_commit: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// -- repositories --

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRow {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_agent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn insert_repository(conn: &Connection, row: &RepositoryRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO repositories
         (id, name, path, description, setup_command, cleanup_command, env_vars, default_agent_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            row.id,
            row.name,
            row.path,
            row.description,
            row.setup_command,
            row.cleanup_command,
            row.env_vars,
            row.default_agent_id,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_repository(conn: &Connection, id: &str) -> rusqlite::Result<Option<RepositoryRow>> {
    repo_query(conn, "id = ?1", id)
}

pub fn get_repository_by_path(
    conn: &Connection,
    path: &str,
) -> rusqlite::Result<Option<RepositoryRow>> {
    repo_query(conn, "path = ?1", path)
}

fn repo_query(
    conn: &Connection,
    predicate: &str,
    arg: &str,
) -> rusqlite::Result<Option<RepositoryRow>> {
    let sql = format!(
        "SELECT id, name, path, description, setup_command, cleanup_command, env_vars, default_agent_id, created_at, updated_at
         FROM repositories WHERE {predicate}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params![arg])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_repository(row)?)),
        None => Ok(None),
    }
}

pub fn list_repositories(conn: &Connection) -> rusqlite::Result<Vec<RepositoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, path, description, setup_command, cleanup_command, env_vars, default_agent_id, created_at, updated_at
         FROM repositories ORDER BY name ASC",
    )?;
    let rows = stmt.query_map([], row_to_repository)?;
    rows.collect()
}

pub fn delete_repository(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM repositories WHERE id = ?1",
        rusqlite::params![id],
    )?;
    Ok(n > 0)
}

fn row_to_repository(row: &rusqlite::Row) -> rusqlite::Result<RepositoryRow> {
    Ok(RepositoryRow {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        description: row.get(3)?,
        setup_command: row.get(4)?,
        cleanup_command: row.get(5)?,
        env_vars: row.get(6)?,
        default_agent_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// -- agents --

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub command_template: String,
    pub continue_template: Option<String>,
    pub headless_template: Option<String>,
    pub description: Option<String>,
    pub is_built_in: bool,
    pub activity_patterns: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn insert_agent(conn: &Connection, row: &AgentRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO agents
         (id, name, command_template, continue_template, headless_template, description, is_built_in, activity_patterns, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            row.id,
            row.name,
            row.command_template,
            row.continue_template,
            row.headless_template,
            row.description,
            row.is_built_in as i64,
            row.activity_patterns,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn update_agent(conn: &Connection, row: &AgentRow) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE agents SET name = ?2, command_template = ?3, continue_template = ?4,
         headless_template = ?5, description = ?6, activity_patterns = ?7, updated_at = ?8
         WHERE id = ?1",
        rusqlite::params![
            row.id,
            row.name,
            row.command_template,
            row.continue_template,
            row.headless_template,
            row.description,
            row.activity_patterns,
            row.updated_at,
        ],
    )?;
    Ok(n > 0)
}

pub fn get_agent(conn: &Connection, id: &str) -> rusqlite::Result<Option<AgentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, command_template, continue_template, headless_template, description, is_built_in, activity_patterns, created_at, updated_at
         FROM agents WHERE id = ?1",
    )?;
    let mut rows = stmt.query(rusqlite::params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_agent(row)?)),
        None => Ok(None),
    }
}

pub fn list_agents(conn: &Connection) -> rusqlite::Result<Vec<AgentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, command_template, continue_template, headless_template, description, is_built_in, activity_patterns, created_at, updated_at
         FROM agents ORDER BY name ASC",
    )?;
    let rows = stmt.query_map([], row_to_agent)?;
    rows.collect()
}

pub fn delete_agent(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let n = conn.execute("DELETE FROM agents WHERE id = ?1", rusqlite::params![id])?;
    Ok(n > 0)
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        id: row.get(0)?,
        name: row.get(1)?,
        command_template: row.get(2)?,
        continue_template: row.get(3)?,
        headless_template: row.get(4)?,
        description: row.get(5)?,
        is_built_in: row.get::<_, i64>(6)? != 0,
        activity_patterns: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// -- worktrees --

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeRow {
    pub id: String,
    pub repository_id: String,
    pub path: String,
    pub index_number: i64,
    pub created_at: String,
}

pub fn insert_worktree(conn: &Connection, row: &WorktreeRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO worktrees (id, repository_id, path, index_number, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            row.id,
            row.repository_id,
            row.path,
            row.index_number,
            row.created_at
        ],
    )?;
    Ok(())
}

pub fn list_worktrees(conn: &Connection, repository_id: &str) -> rusqlite::Result<Vec<WorktreeRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, repository_id, path, index_number, created_at
         FROM worktrees WHERE repository_id = ?1 ORDER BY index_number ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![repository_id], row_to_worktree)?;
    rows.collect()
}

pub fn delete_worktree_by_path(conn: &Connection, path: &str) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM worktrees WHERE path = ?1",
        rusqlite::params![path],
    )?;
    Ok(n > 0)
}

pub fn next_worktree_index(conn: &Connection, repository_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(index_number), 0) + 1 FROM worktrees WHERE repository_id = ?1",
        rusqlite::params![repository_id],
        |r| r.get(0),
    )
}

fn row_to_worktree(row: &rusqlite::Row) -> rusqlite::Result<WorktreeRow> {
    Ok(WorktreeRow {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        path: row.get(2)?,
        index_number: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// -- repository slack integrations --

pub fn upsert_slack_integration(
    conn: &Connection,
    repository_id: &str,
    webhook_url: &str,
    enabled: bool,
) -> rusqlite::Result<()> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO repository_slack_integrations (id, repository_id, webhook_url, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(repository_id) DO UPDATE SET webhook_url = ?3, enabled = ?4, updated_at = ?5",
        rusqlite::params![
            uuid::Uuid::new_v4().to_string(),
            repository_id,
            webhook_url,
            enabled as i64,
            now,
        ],
    )?;
    Ok(())
}

pub fn get_slack_integration(
    conn: &Connection,
    repository_id: &str,
) -> rusqlite::Result<Option<(String, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT webhook_url, enabled FROM repository_slack_integrations WHERE repository_id = ?1",
    )?;
    let mut rows = stmt.query(rusqlite::params![repository_id])?;
    match rows.next()? {
        Some(row) => Ok(Some((row.get(0)?, row.get::<_, i64>(1)? != 0))),
        None => Ok(None),
    }
}

// -- inbound event notifications --

/// Drop the notification rows tied to one worker; run when the worker is deleted.
pub fn delete_worker_notifications(
    conn: &Connection,
    session_id: &str,
    worker_id: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM inbound_event_notifications WHERE session_id = ?1 AND worker_id = ?2",
        rusqlite::params![session_id, worker_id],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn agent_row(id: &str, built_in: bool) -> AgentRow {
        let now = now_rfc3339();
        AgentRow {
            id: id.into(),
            name: format!("Agent {id}"),
            command_template: "my-agent {{prompt}}".into(),
            continue_template: None,
            headless_template: None,
            description: None,
            is_built_in: built_in,
            activity_patterns: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn repo_row(id: &str, path: &str) -> RepositoryRow {
        let now = now_rfc3339();
        RepositoryRow {
            id: id.into(),
            name: "repo".into(),
            path: path.into(),
            description: None,
            setup_command: None,
            cleanup_command: None,
            env_vars: None,
            default_agent_id: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn migrations_are_idempotent_per_version() {
        let db = db();
        // Re-running the current version's DDL must not fail.
        db.with(|c| apply_migration(c, 1).map_err(|_| rusqlite::Error::InvalidQuery))
            .unwrap();
        db.with(|c| apply_migration(c, 2).map_err(|_| rusqlite::Error::InvalidQuery))
            .unwrap();
    }

    #[test]
    fn session_round_trip_with_workers() {
        let db = db();
        let now = now_rfc3339();
        let row = SessionRow {
            id: "s1".into(),
            session_type: "quick".into(),
            location_path: "/tmp/x".into(),
            server_pid: Some(4242),
            initial_prompt: None,
            title: Some("demo".into()),
            repository_id: None,
            worktree_id: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        db.with(|c| upsert_session(c, &row)).unwrap();
        db.with(|c| {
            replace_session_workers(
                c,
                "s1",
                &[WorkerRow {
                    id: "w1".into(),
                    session_id: "s1".into(),
                    worker_type: "agent".into(),
                    name: "Claude Code".into(),
                    pid: Some(999),
                    agent_id: Some("claude-code-builtin".into()),
                    base_commit: None,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                }],
            )
        })
        .unwrap();

        let sessions = db.with(list_sessions).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].server_pid, Some(4242));
        let workers = db.with(|c| list_session_workers(c, "s1")).unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].agent_id.as_deref(), Some("claude-code-builtin"));
    }

    #[test]
    fn deleting_session_cascades_workers() {
        let db = db();
        let now = now_rfc3339();
        let row = SessionRow {
            id: "s1".into(),
            session_type: "quick".into(),
            location_path: "/tmp/x".into(),
            server_pid: None,
            initial_prompt: None,
            title: None,
            repository_id: None,
            worktree_id: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        db.with(|c| upsert_session(c, &row)).unwrap();
        db.with(|c| {
            replace_session_workers(
                c,
                "s1",
                &[WorkerRow {
                    id: "w1".into(),
                    session_id: "s1".into(),
                    worker_type: "terminal".into(),
                    name: "Terminal 1".into(),
                    pid: None,
                    agent_id: None,
                    base_commit: None,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                }],
            )
        })
        .unwrap();
        assert!(db.with(|c| delete_session(c, "s1")).unwrap());
        let workers = db.with(|c| list_session_workers(c, "s1")).unwrap();
        assert!(workers.is_empty());
    }

    #[test]
    fn deleting_repository_cascades_slack_integration() {
        let db = db();
        db.with(|c| insert_repository(c, &repo_row("r1", "/tmp/repo"))).unwrap();
        db.with(|c| upsert_slack_integration(c, "r1", "https://hooks.slack.test/x", true))
            .unwrap();
        assert!(db.with(|c| get_slack_integration(c, "r1")).unwrap().is_some());

        assert!(db.with(|c| delete_repository(c, "r1")).unwrap());
        assert!(db.with(|c| get_slack_integration(c, "r1")).unwrap().is_none());
    }

    #[test]
    fn repository_path_is_unique() {
        let db = db();
        db.with(|c| insert_repository(c, &repo_row("r1", "/tmp/repo"))).unwrap();
        let dup = db.with(|c| insert_repository(c, &repo_row("r2", "/tmp/repo")));
        assert!(dup.is_err());
    }

    #[test]
    fn deleting_repository_cascades_worktrees() {
        let db = db();
        db.with(|c| insert_repository(c, &repo_row("r1", "/tmp/repo"))).unwrap();
        db.with(|c| {
            insert_worktree(
                c,
                &WorktreeRow {
                    id: "wt1".into(),
                    repository_id: "r1".into(),
                    path: "/tmp/repo-wt/feature".into(),
                    index_number: 1,
                    created_at: now_rfc3339(),
                },
            )
        })
        .unwrap();
        db.with(|c| delete_repository(c, "r1")).unwrap();
        let left = db.with(|c| list_worktrees(c, "r1")).unwrap();
        assert!(left.is_empty());
    }

    #[test]
    fn worktree_index_increments() {
        let db = db();
        db.with(|c| insert_repository(c, &repo_row("r1", "/tmp/repo"))).unwrap();
        assert_eq!(db.with(|c| next_worktree_index(c, "r1")).unwrap(), 1);
        db.with(|c| {
            insert_worktree(
                c,
                &WorktreeRow {
                    id: "wt1".into(),
                    repository_id: "r1".into(),
                    path: "/tmp/wt1".into(),
                    index_number: 1,
                    created_at: now_rfc3339(),
                },
            )
        })
        .unwrap();
        assert_eq!(db.with(|c| next_worktree_index(c, "r1")).unwrap(), 2);
    }

    #[test]
    fn default_agent_nulls_on_agent_delete() {
        let db = db();
        db.with(|c| insert_agent(c, &agent_row("a1", false))).unwrap();
        let mut repo = repo_row("r1", "/tmp/repo");
        repo.default_agent_id = Some("a1".into());
        db.with(|c| insert_repository(c, &repo)).unwrap();
        db.with(|c| delete_agent(c, "a1")).unwrap();
        let got = db.with(|c| get_repository(c, "r1")).unwrap().unwrap();
        assert!(got.default_agent_id.is_none());
    }
}
