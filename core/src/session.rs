//! Session registry: the authoritative in-memory map of sessions and their
//! workers, loaded from the store at startup with PTY workers hibernated.
//! Lifecycle changes persist on every mutation and fan out on a broadcast
//! channel the app WebSocket subscribes to.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::activity::ActivityState;
use crate::agents::AgentDefinition;
use crate::db::{self, Db, RepositoryRow, SessionRow, WorkerRow};
use crate::error::CoreError;
use crate::worker::{PublicWorker, Worker, WorkerKind, WorkerManager};

/// Broadcast capacity for app-channel events.
const APP_EVENT_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Worktree,
    Quick,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Worktree => "worktree",
            SessionType::Quick => "quick",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "worktree" => Some(SessionType::Worktree),
            "quick" => Some(SessionType::Quick),
            _ => None,
        }
    }
}

/// One session: an addressable container of workers rooted at a directory.
/// `server_pid = None` means hibernated / unowned.
pub struct Session {
    pub id: String,
    pub session_type: SessionType,
    pub location_path: PathBuf,
    pub repository_id: Option<String>,
    /// Branch name for worktree sessions; renameable.
    pub worktree_id: Mutex<Option<String>>,
    pub server_pid: Mutex<Option<i64>>,
    pub title: Mutex<Option<String>>,
    pub initial_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: Mutex<String>,
    pub workers: DashMap<String, Arc<Worker>>,
}

impl Session {
    pub fn worktree_id(&self) -> Option<String> {
        self.worktree_id.lock().unwrap().clone()
    }

    pub fn server_pid(&self) -> Option<i64> {
        *self.server_pid.lock().unwrap()
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.workers.get(worker_id).map(|w| w.value().clone())
    }

    pub fn terminal_worker_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| matches!(w.value().kind, WorkerKind::Terminal(_)))
            .count()
    }

    /// Value-copied projection for API responses and broadcasts. Workers come
    /// out in creation order so client tabs stay stable.
    pub fn to_public(&self) -> PublicSession {
        let mut workers: Vec<PublicWorker> =
            self.workers.iter().map(|w| w.value().to_public()).collect();
        workers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        PublicSession {
            id: self.id.clone(),
            session_type: self.session_type.as_str().to_string(),
            location_path: self.location_path.to_string_lossy().into_owned(),
            repository_id: self.repository_id.clone(),
            worktree_id: self.worktree_id(),
            server_pid: self.server_pid(),
            title: self.title.lock().unwrap().clone(),
            initial_prompt: self.initial_prompt.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.lock().unwrap().clone(),
            workers,
        }
    }

    fn to_row(&self) -> SessionRow {
        SessionRow {
            id: self.id.clone(),
            session_type: self.session_type.as_str().to_string(),
            location_path: self.location_path.to_string_lossy().into_owned(),
            server_pid: self.server_pid(),
            initial_prompt: self.initial_prompt.clone(),
            title: self.title.lock().unwrap().clone(),
            repository_id: self.repository_id.clone(),
            worktree_id: self.worktree_id(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.lock().unwrap().clone(),
        }
    }

    fn worker_rows(&self) -> Vec<WorkerRow> {
        self.workers
            .iter()
            .map(|entry| {
                let w = entry.value();
                WorkerRow {
                    id: w.id.clone(),
                    session_id: self.id.clone(),
                    worker_type: w.kind_str().to_string(),
                    name: w.name.clone(),
                    pid: w
                        .pty_runtime()
                        .and_then(|rt| rt.last_pid())
                        .map(|p| p as i64),
                    agent_id: w.agent_id().map(str::to_string),
                    base_commit: match &w.kind {
                        WorkerKind::GitDiff(g) => Some(g.base_commit()),
                        _ => None,
                    },
                    created_at: w.created_at.clone(),
                    updated_at: db::now_rfc3339(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSession {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub location_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    pub server_pid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub workers: Vec<PublicWorker>,
}

/// Lifecycle and activity events fanned out to every app-channel client.
#[derive(Debug, Clone)]
pub enum AppEvent {
    SessionCreated(PublicSession),
    SessionUpdated(PublicSession),
    SessionDeleted {
        session_id: String,
    },
    WorkerActivated {
        session_id: String,
        worker_id: String,
    },
    WorkerActivity {
        session_id: String,
        worker_id: String,
        activity_state: ActivityState,
    },
    AgentCreated(AgentDefinition),
    AgentUpdated(AgentDefinition),
    AgentDeleted {
        agent_id: String,
    },
    RepositoryCreated(RepositoryRow),
    RepositoryUpdated(RepositoryRow),
    RepositoryDeleted {
        repository_id: String,
    },
}

/// Fields of a new session; ids and timestamps are generated here.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_type: SessionType,
    pub location_path: PathBuf,
    pub repository_id: Option<String>,
    pub worktree_id: Option<String>,
    pub title: Option<String>,
    pub initial_prompt: Option<String>,
}

/// Owner of the session map. Create/patch/delete persist on every mutation.
pub struct SessionManager {
    db: Db,
    sessions: DashMap<String, Arc<Session>>,
    events: broadcast::Sender<AppEvent>,
    server_pid: i64,
}

impl SessionManager {
    pub fn new(db: Db, server_pid: i64) -> Self {
        let (events, _) = broadcast::channel(APP_EVENT_CAP);
        Self {
            db,
            sessions: DashMap::new(),
            events,
            server_pid,
        }
    }

    pub fn server_pid(&self) -> i64 {
        self.server_pid
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn list_public(&self) -> Vec<PublicSession> {
        let mut out: Vec<PublicSession> =
            self.sessions.iter().map(|s| s.value().to_public()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Create, persist, broadcast. The new session is owned by this server.
    pub fn create_session(&self, new: NewSession) -> Result<Arc<Session>, CoreError> {
        let now = db::now_rfc3339();
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            session_type: new.session_type,
            location_path: new.location_path,
            repository_id: new.repository_id,
            worktree_id: Mutex::new(new.worktree_id),
            server_pid: Mutex::new(Some(self.server_pid)),
            title: Mutex::new(new.title),
            initial_prompt: new.initial_prompt,
            created_at: now.clone(),
            updated_at: Mutex::new(now),
            workers: DashMap::new(),
        });
        self.persist_session(&session)?;
        self.sessions.insert(session.id.clone(), session.clone());
        self.emit(AppEvent::SessionCreated(session.to_public()));
        Ok(session)
    }

    /// Remove from the map and the store; workers cascade in the store. The
    /// caller is responsible for killing PTYs and queueing output cleanup.
    pub fn remove_session(&self, session_id: &str) -> Result<bool, CoreError> {
        let existed = self.sessions.remove(session_id).is_some();
        let in_db = self.db.with(|c| db::delete_session(c, session_id))?;
        if existed || in_db {
            self.emit(AppEvent::SessionDeleted {
                session_id: session_id.to_string(),
            });
        }
        Ok(existed || in_db)
    }

    /// Patch title and/or branch, persist, broadcast.
    pub fn patch_session(
        &self,
        session_id: &str,
        title: Option<String>,
        worktree_id: Option<String>,
    ) -> Result<Option<PublicSession>, CoreError> {
        let Some(session) = self.get(session_id) else {
            return Ok(None);
        };
        if let Some(title) = title {
            *session.title.lock().unwrap() = Some(title);
        }
        if let Some(branch) = worktree_id {
            *session.worktree_id.lock().unwrap() = Some(branch);
        }
        self.persist_session(&session)?;
        let public = session.to_public();
        self.emit(AppEvent::SessionUpdated(public.clone()));
        Ok(Some(public))
    }

    /// Stamp the session as owned by this server process.
    pub fn mark_owned(&self, session: &Session) -> Result<(), CoreError> {
        *session.server_pid.lock().unwrap() = Some(self.server_pid);
        self.persist_session(session)
    }

    /// Write the session row and its worker rows; refreshes `updated_at`.
    pub fn persist_session(&self, session: &Session) -> Result<(), CoreError> {
        *session.updated_at.lock().unwrap() = db::now_rfc3339();
        let row = session.to_row();
        let workers = session.worker_rows();
        self.db.with(|c| {
            db::upsert_session(c, &row)?;
            db::replace_session_workers(c, &session.id, &workers)
        })
    }

    /// Load every persisted session with its PTY workers hibernated
    /// (`pty = None`); activation is lazy, on first client attach.
    pub fn load_from_store(&self, workers: &WorkerManager) -> Result<usize, CoreError> {
        let rows = self.db.with(db::list_sessions)?;
        let mut loaded = 0;
        for row in rows {
            let Some(session_type) = SessionType::parse(&row.session_type) else {
                tracing::warn!(session = %row.id, session_type = %row.session_type, "skipping session with unknown type");
                continue;
            };
            let worker_rows = self.db.with(|c| db::list_session_workers(c, &row.id))?;
            let session = Arc::new(Session {
                id: row.id.clone(),
                session_type,
                location_path: PathBuf::from(&row.location_path),
                repository_id: row.repository_id.clone(),
                worktree_id: Mutex::new(row.worktree_id.clone()),
                server_pid: Mutex::new(row.server_pid),
                title: Mutex::new(row.title.clone()),
                initial_prompt: row.initial_prompt.clone(),
                created_at: row.created_at.clone(),
                updated_at: Mutex::new(row.updated_at.clone()),
                workers: DashMap::new(),
            });
            for w in worker_rows {
                let worker = match w.worker_type.as_str() {
                    "agent" => workers.initialize_agent_worker(
                        w.id.clone(),
                        w.name.clone(),
                        w.created_at.clone(),
                        w.agent_id.clone().unwrap_or_else(|| {
                            crate::agents::DEFAULT_AGENT_ID.to_string()
                        }),
                    ),
                    "terminal" => workers.initialize_terminal_worker(
                        w.id.clone(),
                        w.name.clone(),
                        w.created_at.clone(),
                    ),
                    "git-diff" => workers.initialize_git_diff_worker(
                        w.id.clone(),
                        w.name.clone(),
                        w.created_at.clone(),
                        w.base_commit.clone().unwrap_or_default(),
                    ),
                    "sdk" => workers.initialize_sdk_worker(
                        w.id.clone(),
                        w.name.clone(),
                        w.created_at.clone(),
                        w.agent_id.clone().unwrap_or_else(|| {
                            crate::agents::DEFAULT_AGENT_ID.to_string()
                        }),
                    ),
                    other => {
                        tracing::warn!(worker = %w.id, worker_type = %other, "skipping worker with unknown type");
                        continue;
                    }
                };
                if let Some(rt) = worker.pty_runtime() {
                    rt.set_last_pid(w.pid.map(|p| p as u32));
                }
                session.workers.insert(w.id.clone(), Arc::new(worker));
            }
            self.sessions.insert(row.id.clone(), session);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Reap sessions whose recorded server process is provably dead: kill any
    /// still-running worker pids and surface the session as hibernated.
    /// Sessions owned by a live foreign server, already-hibernated sessions,
    /// and legacy sessions with no recorded owner are left untouched.
    pub fn reclaim_orphans(&self) -> usize {
        let mut reclaimed = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            let Some(owner) = session.server_pid() else {
                tracing::warn!(
                    session = %session.id,
                    "session has no recorded server pid, preserving without kill"
                );
                continue;
            };
            if owner == self.server_pid || pid_alive(owner) {
                continue;
            }
            tracing::info!(session = %session.id, dead_server = owner, "reclaiming orphaned session");
            for w in session.workers.iter() {
                let Some(rt) = w.value().pty_runtime() else {
                    continue;
                };
                if let Some(pid) = rt.last_pid() {
                    if pid_alive(pid as i64) {
                        tracing::info!(worker = %w.value().id, pid, "killing orphaned worker process");
                        kill_pid(pid as i64);
                    }
                    rt.set_last_pid(None);
                }
            }
            *session.server_pid.lock().unwrap() = None;
            if let Err(e) = self.persist_session(session) {
                tracing::warn!(session = %session.id, error = %e, "failed to persist reclaimed session");
            }
            reclaimed += 1;
        }
        reclaimed
    }
}

/// Liveness probe: signal 0, which checks without delivering.
#[cfg(unix)]
pub fn pid_alive(pid: i64) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Without a liveness probe we must assume the process is alive; the design
/// prefers leaks over wrongful termination.
#[cfg(not(unix))]
pub fn pid_alive(_pid: i64) -> bool {
    true
}

#[cfg(unix)]
fn kill_pid(pid: i64) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if pid <= 0 {
        return;
    }
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::warn!(pid, error = %e, "failed to kill orphaned process");
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: i64) {}
