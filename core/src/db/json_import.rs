//! One-shot import of the legacy JSON registries (`sessions.json`,
//! `repositories.json`, `agents.json`, per-repo `worktree-indexes.json`) into
//! the SQLite store. Invalid records are skipped with a warning; built-in
//! agents are never imported; `registeredAt` is folded into `createdAt`
//! (preferring `createdAt` when both appear). Source files are renamed to
//! `*.migrated` once their records are in. A failure after writing has begun
//! bubbles up so the caller can delete the partial DB and retry next startup.

use std::path::Path;

use serde_json::Value;

use super::{now_rfc3339, Db};
use crate::error::CoreError;

#[derive(Debug, Default)]
pub struct ImportReport {
    pub agents: usize,
    pub repositories: usize,
    pub sessions: usize,
    pub worktrees: usize,
}

impl ImportReport {
    pub fn imported_anything(&self) -> bool {
        self.agents + self.repositories + self.sessions + self.worktrees > 0
    }
}

/// Open the store under `home`, then run the legacy import. An import failure
/// after writes began deletes the DB file so the next startup retries cleanly.
pub fn open_with_import(home: &Path) -> Result<Db, CoreError> {
    let db = Db::open(home)?;
    match run_json_import(&db, home) {
        Ok(report) => {
            if report.imported_anything() {
                tracing::info!(
                    agents = report.agents,
                    repositories = report.repositories,
                    sessions = report.sessions,
                    worktrees = report.worktrees,
                    "imported legacy JSON registries"
                );
            }
            Ok(db)
        }
        Err(e) => {
            tracing::error!(error = %e, "legacy JSON import failed, removing partial database");
            let _ = db.destroy();
            Err(e)
        }
    }
}

/// Import whichever legacy files exist under `home`. Missing files are not an
/// error; an unreadable or unparsable file aborts before any write for that
/// file, a mid-file DB error aborts the whole import.
pub fn run_json_import(db: &Db, home: &Path) -> Result<ImportReport, CoreError> {
    let mut report = ImportReport::default();

    let agents_file = home.join("agents.json");
    if let Some(records) = read_records(&agents_file)? {
        for rec in records {
            match import_agent(db, &rec) {
                Ok(true) => report.agents += 1,
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }
        mark_migrated(&agents_file)?;
    }

    let repos_file = home.join("repositories.json");
    let mut imported_repos: Vec<(String, String)> = Vec::new();
    if let Some(records) = read_records(&repos_file)? {
        for rec in records {
            match import_repository(db, &rec) {
                Ok(Some((id, name))) => {
                    report.repositories += 1;
                    imported_repos.push((id, name));
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
        mark_migrated(&repos_file)?;
    }

    let sessions_file = home.join("sessions.json");
    if let Some(records) = read_records(&sessions_file)? {
        for rec in records {
            match import_session(db, &rec) {
                Ok(true) => report.sessions += 1,
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }
        mark_migrated(&sessions_file)?;
    }

    // Per-repo worktree indexes are best-effort: one bad file must not sink
    // the rest of the import.
    for (repo_id, repo_name) in &imported_repos {
        let file = home
            .join("repositories")
            .join(repo_name)
            .join("worktrees")
            .join("worktree-indexes.json");
        match import_worktree_indexes(db, repo_id, &file) {
            Ok(n) => report.worktrees += n,
            Err(e) => {
                tracing::warn!(repository = %repo_name, error = %e, "worktree index import failed, continuing");
            }
        }
    }

    Ok(report)
}

/// Parse a legacy file into its record array. `None` when the file is absent.
fn read_records(path: &Path) -> Result<Option<Vec<Value>>, CoreError> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let root: Value = serde_json::from_str(&data)?;
    match root {
        Value::Array(items) => Ok(Some(items)),
        other => Err(CoreError::InvalidInput(format!(
            "{}: expected a JSON array, got {}",
            path.display(),
            kind_of(&other)
        ))),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mark_migrated(path: &Path) -> Result<(), CoreError> {
    let mut target = path.as_os_str().to_os_string();
    target.push(".migrated");
    std::fs::rename(path, &target)?;
    Ok(())
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

/// `createdAt`, falling back to the legacy `registeredAt` spelling.
fn created_at_of(v: &Value) -> String {
    str_field(v, "createdAt")
        .or_else(|| str_field(v, "registeredAt"))
        .unwrap_or_else(now_rfc3339)
}

fn import_agent(db: &Db, rec: &Value) -> Result<bool, CoreError> {
    if rec.get("isBuiltIn").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(false);
    }
    let (Some(id), Some(name)) = (str_field(rec, "id"), str_field(rec, "name")) else {
        tracing::warn!(record = %rec, "skipping agent record missing id/name");
        return Ok(false);
    };
    let Some(command_template) =
        str_field(rec, "commandTemplate").or_else(|| str_field(rec, "command"))
    else {
        tracing::warn!(agent = %id, "skipping agent record missing command template");
        return Ok(false);
    };
    let created_at = created_at_of(rec);
    let row = super::AgentRow {
        id,
        name,
        command_template,
        continue_template: str_field(rec, "continueTemplate"),
        headless_template: str_field(rec, "headlessTemplate"),
        description: str_field(rec, "description"),
        is_built_in: false,
        activity_patterns: rec.get("activityPatterns").map(|v| v.to_string()),
        created_at: created_at.clone(),
        updated_at: created_at,
    };
    db.with(|c| super::insert_agent(c, &row))?;
    Ok(true)
}

fn import_repository(db: &Db, rec: &Value) -> Result<Option<(String, String)>, CoreError> {
    let (Some(id), Some(name), Some(path)) = (
        str_field(rec, "id"),
        str_field(rec, "name"),
        str_field(rec, "path"),
    ) else {
        tracing::warn!(record = %rec, "skipping repository record missing id/name/path");
        return Ok(None);
    };
    let created_at = created_at_of(rec);
    let row = super::RepositoryRow {
        id: id.clone(),
        name: name.clone(),
        path,
        description: str_field(rec, "description"),
        setup_command: str_field(rec, "setupCommand"),
        cleanup_command: str_field(rec, "cleanupCommand"),
        env_vars: rec.get("envVars").map(|v| v.to_string()),
        default_agent_id: str_field(rec, "defaultAgentId"),
        created_at: created_at.clone(),
        updated_at: created_at,
    };
    db.with(|c| super::insert_repository(c, &row))?;
    Ok(Some((id, name)))
}

fn import_session(db: &Db, rec: &Value) -> Result<bool, CoreError> {
    let (Some(id), Some(session_type), Some(location_path)) = (
        str_field(rec, "id"),
        str_field(rec, "type"),
        str_field(rec, "locationPath"),
    ) else {
        tracing::warn!(record = %rec, "skipping session record missing id/type/locationPath");
        return Ok(false);
    };
    if session_type != "worktree" && session_type != "quick" {
        tracing::warn!(session = %id, session_type = %session_type, "skipping session with unknown type");
        return Ok(false);
    }
    if rec.get("serverPid").is_none() {
        // Preserved without a kill on the orphan sweep; flag it once here.
        tracing::warn!(session = %id, "legacy session has no serverPid field, preserving as hibernated");
    }
    let created_at = created_at_of(rec);
    let row = super::SessionRow {
        id: id.clone(),
        session_type,
        location_path,
        server_pid: rec.get("serverPid").and_then(Value::as_i64),
        initial_prompt: str_field(rec, "initialPrompt"),
        title: str_field(rec, "title"),
        repository_id: str_field(rec, "repositoryId"),
        worktree_id: str_field(rec, "worktreeId"),
        created_at: created_at.clone(),
        updated_at: str_field(rec, "updatedAt").unwrap_or(created_at),
    };
    db.with(|c| super::upsert_session(c, &row))?;

    let mut workers = Vec::new();
    if let Some(list) = rec.get("workers").and_then(Value::as_array) {
        for w in list {
            let (Some(wid), Some(worker_type), Some(name)) = (
                str_field(w, "id"),
                str_field(w, "type"),
                str_field(w, "name"),
            ) else {
                tracing::warn!(session = %id, record = %w, "skipping worker record missing id/type/name");
                continue;
            };
            let w_created = created_at_of(w);
            workers.push(super::WorkerRow {
                id: wid,
                session_id: id.clone(),
                worker_type,
                name,
                pid: w.get("pid").and_then(Value::as_i64),
                agent_id: str_field(w, "agentId"),
                base_commit: str_field(w, "baseCommit"),
                created_at: w_created.clone(),
                updated_at: w_created,
            });
        }
    }
    db.with(|c| super::replace_session_workers(c, &id, &workers))?;
    Ok(true)
}

fn import_worktree_indexes(db: &Db, repo_id: &str, file: &Path) -> Result<usize, CoreError> {
    let Some(records) = read_records(file)? else {
        return Ok(0);
    };
    let mut imported = 0;
    for rec in records {
        let Some(path) = str_field(&rec, "path") else {
            tracing::warn!(record = %rec, "skipping worktree record missing path");
            continue;
        };
        let index_number = rec
            .get("indexNumber")
            .and_then(Value::as_i64)
            .unwrap_or(imported as i64 + 1);
        let row = super::WorktreeRow {
            id: str_field(&rec, "id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            repository_id: repo_id.to_string(),
            path,
            index_number,
            created_at: created_at_of(&rec),
        };
        db.with(|c| super::insert_worktree(c, &row))?;
        imported += 1;
    }
    mark_migrated(file)?;
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_import_nothing() {
        let home = tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        let report = run_json_import(&db, home.path()).unwrap();
        assert!(!report.imported_anything());
    }

    #[test]
    fn imports_agents_and_renames_source() {
        let home = tempdir().unwrap();
        std::fs::write(
            home.path().join("agents.json"),
            r#"[
                {"id":"my-agent","name":"My Agent","command":"my-agent {{prompt}}","registeredAt":"2025-01-01T00:00:00Z"},
                {"id":"builtin","name":"Built In","command":"x {{prompt}}","isBuiltIn":true},
                {"name":"no id, skipped"}
            ]"#,
        )
        .unwrap();
        let db = Db::open_in_memory().unwrap();
        let report = run_json_import(&db, home.path()).unwrap();
        assert_eq!(report.agents, 1);

        let got = db.with(|c| crate::db::get_agent(c, "my-agent")).unwrap().unwrap();
        // registeredAt folded into created_at
        assert_eq!(got.created_at, "2025-01-01T00:00:00Z");
        assert!(!got.is_built_in);

        assert!(!home.path().join("agents.json").exists());
        assert!(home.path().join("agents.json.migrated").exists());
    }

    #[test]
    fn created_at_preferred_over_registered_at() {
        let rec: Value = serde_json::from_str(
            r#"{"createdAt":"2025-02-02T00:00:00Z","registeredAt":"2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(created_at_of(&rec), "2025-02-02T00:00:00Z");
    }

    #[test]
    fn imports_sessions_with_workers() {
        let home = tempdir().unwrap();
        std::fs::write(
            home.path().join("sessions.json"),
            r#"[
                {"id":"s1","type":"quick","locationPath":"/tmp/x","serverPid":777,
                 "workers":[{"id":"w1","type":"agent","name":"Claude Code","agentId":"claude-code-builtin"},
                            {"type":"terminal"}]},
                {"id":"s2","type":"weird","locationPath":"/tmp/y"}
            ]"#,
        )
        .unwrap();
        let db = Db::open_in_memory().unwrap();
        let report = run_json_import(&db, home.path()).unwrap();
        assert_eq!(report.sessions, 1);
        let workers = db.with(|c| crate::db::list_session_workers(c, "s1")).unwrap();
        // The nameless terminal record is skipped.
        assert_eq!(workers.len(), 1);
        let sess = db.with(|c| crate::db::get_session(c, "s1")).unwrap().unwrap();
        assert_eq!(sess.server_pid, Some(777));
    }

    #[test]
    fn malformed_root_is_an_error() {
        let home = tempdir().unwrap();
        std::fs::write(home.path().join("sessions.json"), r#"{"not":"an array"}"#).unwrap();
        let db = Db::open_in_memory().unwrap();
        assert!(run_json_import(&db, home.path()).is_err());
        // Source is left in place for the retry after the DB is rebuilt.
        assert!(home.path().join("sessions.json").exists());
    }

    #[test]
    fn worktree_indexes_import_best_effort() {
        let home = tempdir().unwrap();
        std::fs::write(
            home.path().join("repositories.json"),
            r#"[{"id":"r1","name":"acme","path":"/tmp/acme"}]"#,
        )
        .unwrap();
        let wt_dir = home.path().join("repositories").join("acme").join("worktrees");
        std::fs::create_dir_all(&wt_dir).unwrap();
        std::fs::write(
            wt_dir.join("worktree-indexes.json"),
            r#"[{"path":"/tmp/acme-wt/feature-1","indexNumber":1},{"noPath":true}]"#,
        )
        .unwrap();
        let db = Db::open_in_memory().unwrap();
        let report = run_json_import(&db, home.path()).unwrap();
        assert_eq!(report.repositories, 1);
        assert_eq!(report.worktrees, 1);
        assert!(wt_dir.join("worktree-indexes.json.migrated").exists());
    }
}
