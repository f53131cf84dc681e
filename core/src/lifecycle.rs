//! Session-aware worker lifecycle: create/delete/restart/restore workers and
//! the composite pieces those operations need (agent command rendering, branch
//! rename, output-file setup, cleanup jobs, broadcasts).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::agents::AgentRegistry;
use crate::db::{self, Db};
use crate::error::{CoreError, ErrorCode};
use crate::git::GitRunner;
use crate::jobs::{JobQueue, JOB_CLEANUP_SESSION_OUTPUTS, JOB_CLEANUP_WORKER_OUTPUT};
use crate::output::{History, OutputFileManager};
use crate::pty::{PtyProvider, PtySpawnSpec};
use crate::session::{AppEvent, Session, SessionManager, SessionType};
use crate::worker::{
    ActivityHook, PublicWorker, Worker, WorkerEventReceiver, WorkerKind, WorkerManager,
};

/// Injected `pathExists`; a closure so tests can script missing paths.
pub type PathProbe = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

pub fn real_path_probe() -> PathProbe {
    Arc::new(|p: &Path| p.exists())
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkerRequest {
    #[serde(rename = "type", default)]
    pub worker_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub base_commit: Option<String>,
}

/// Result of a restore attempt. `was_restored = true` is the signal clients
/// use to invalidate their cached scrollback snapshots.
pub enum RestoreOutcome {
    Ready {
        was_restored: bool,
        worker: Arc<Worker>,
    },
    Failed(ErrorCode),
}

pub struct WorkerLifecycle {
    sessions: Arc<SessionManager>,
    workers: Arc<WorkerManager>,
    output: OutputFileManager,
    agents: Arc<AgentRegistry>,
    jobs: Option<JobQueue>,
    pty: Arc<dyn PtyProvider>,
    git: Arc<dyn GitRunner>,
    path_exists: PathProbe,
    db: Db,
}

impl WorkerLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionManager>,
        workers: Arc<WorkerManager>,
        output: OutputFileManager,
        agents: Arc<AgentRegistry>,
        jobs: Option<JobQueue>,
        pty: Arc<dyn PtyProvider>,
        git: Arc<dyn GitRunner>,
        path_exists: PathProbe,
        db: Db,
    ) -> Self {
        Self {
            sessions,
            workers,
            output,
            agents,
            jobs,
            pty,
            git,
            path_exists,
            db,
        }
    }

    pub fn get_worker(&self, session_id: &str, worker_id: &str) -> Option<Arc<Worker>> {
        self.sessions.get(session_id)?.get_worker(worker_id)
    }

    /// Create a worker in the session, activate its PTY (agent/terminal), and
    /// persist. `None` when the session does not exist.
    pub async fn create_worker(
        &self,
        session_id: &str,
        req: CreateWorkerRequest,
        continue_conversation: bool,
        initial_prompt: Option<String>,
    ) -> Result<Option<PublicWorker>, CoreError> {
        let Some(session) = self.sessions.get(session_id) else {
            return Ok(None);
        };
        let worker_id = uuid::Uuid::new_v4().to_string();
        let created_at = db::now_rfc3339();

        let worker = match req.worker_type.as_str() {
            "agent" => {
                let def = self.agent_for_request(&session, req.agent_id.as_deref())?;
                let name = req.name.unwrap_or_else(|| def.name.clone());
                let worker = Arc::new(self.workers.initialize_agent_worker(
                    worker_id.clone(),
                    name,
                    created_at,
                    def.id.clone(),
                ));
                // Readers must find the file before any output arrives, even
                // if a WebSocket attaches mid-create.
                self.output
                    .initialize_worker_output(&session.id, &worker_id)
                    .await?;
                let prompt = initial_prompt.or_else(|| session.initial_prompt.clone());
                let spec = self
                    .agent_spawn_spec(&session, &def, prompt.as_deref(), continue_conversation)
                    .await?;
                self.workers.activate_agent_worker_pty(
                    self.pty.as_ref(),
                    &worker,
                    &session.id,
                    spec,
                    &def.asking_patterns(),
                    Some(self.activity_hook(&session.id, &worker_id)),
                )?;
                worker
            }
            "terminal" => {
                let name = req
                    .name
                    .unwrap_or_else(|| format!("Terminal {}", session.terminal_worker_count() + 1));
                let worker = Arc::new(self.workers.initialize_terminal_worker(
                    worker_id.clone(),
                    name,
                    created_at,
                ));
                self.output
                    .initialize_worker_output(&session.id, &worker_id)
                    .await?;
                let env = self.repository_env(&session);
                let spec = PtySpawnSpec::login_shell(Some(session.location_path.clone()), env);
                self.workers.activate_terminal_worker_pty(
                    self.pty.as_ref(),
                    &worker,
                    &session.id,
                    spec,
                )?;
                worker
            }
            "git-diff" => {
                let name = req.name.unwrap_or_else(|| "Git Diff".to_string());
                Arc::new(self.workers.initialize_git_diff_worker(
                    worker_id.clone(),
                    name,
                    created_at,
                    req.base_commit.unwrap_or_default(),
                ))
            }
            "sdk" => {
                let def = self.agent_for_request(&session, req.agent_id.as_deref())?;
                let name = req.name.unwrap_or_else(|| def.name.clone());
                Arc::new(self.workers.initialize_sdk_worker(
                    worker_id.clone(),
                    name,
                    created_at,
                    def.id.clone(),
                ))
            }
            other => {
                return Err(CoreError::InvalidInput(format!(
                    "unknown worker type: {other}"
                )))
            }
        };

        session.workers.insert(worker_id, worker.clone());
        self.sessions.mark_owned(&session)?;
        Ok(Some(worker.to_public()))
    }

    /// Kill the worker, queue its output cleanup, drop notification state,
    /// remove it from the session, persist. `false` when session or worker is
    /// missing.
    pub async fn delete_worker(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<bool, CoreError> {
        let Some(session) = self.sessions.get(session_id) else {
            return Ok(false);
        };
        let Some(worker) = session.get_worker(worker_id) else {
            return Ok(false);
        };
        self.workers.kill_worker(&worker);
        drop(worker);

        let Some(jobs) = &self.jobs else {
            return Err(CoreError::JobQueueUnavailable);
        };
        jobs.enqueue(
            JOB_CLEANUP_WORKER_OUTPUT,
            serde_json::json!({"sessionId": session_id, "workerId": worker_id}),
            0,
        )?;
        self.db
            .with(|c| db::delete_worker_notifications(c, session_id, worker_id))?;

        session.workers.remove(worker_id);
        self.sessions.persist_session(&session)?;
        self.sessions.emit(AppEvent::SessionUpdated(session.to_public()));
        Ok(true)
    }

    /// Kill every worker, queue output cleanup, and drop the session.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, CoreError> {
        let Some(session) = self.sessions.get(session_id) else {
            // The map is authoritative, but clean a stray persisted row too.
            return self.sessions.remove_session(session_id);
        };
        for entry in session.workers.iter() {
            self.workers.kill_worker(entry.value());
            if let Err(e) = self
                .db
                .with(|c| db::delete_worker_notifications(c, session_id, &entry.value().id))
            {
                tracing::warn!(worker = %entry.value().id, error = %e, "notification cleanup failed");
            }
        }
        match &self.jobs {
            Some(jobs) => {
                jobs.enqueue(
                    JOB_CLEANUP_SESSION_OUTPUTS,
                    serde_json::json!({"sessionId": session_id}),
                    0,
                )?;
            }
            None => self.output.delete_session_outputs(session_id).await?,
        }
        self.sessions.remove_session(session_id)
    }

    /// Restart an agent worker in place: same worker id and creation time (so
    /// tab order survives), fresh PTY, scrollback reset so client caches
    /// cannot hold stale offsets. Optionally switches agent and renames the
    /// worktree branch.
    pub async fn restart_agent_worker(
        &self,
        session_id: &str,
        worker_id: &str,
        continue_conversation: bool,
        agent_id: Option<String>,
        branch: Option<String>,
    ) -> Result<Option<PublicWorker>, CoreError> {
        let Some(session) = self.sessions.get(session_id) else {
            return Ok(None);
        };
        let Some(old) = session.get_worker(worker_id) else {
            return Ok(None);
        };
        let WorkerKind::Agent(old_agent) = &old.kind else {
            return Err(CoreError::InvalidInput(
                "only agent workers can be restarted".into(),
            ));
        };
        if let Some(id) = &agent_id {
            if !self.agents.is_registered(id) {
                return Err(CoreError::InvalidInput(format!(
                    "agent is not registered: {id}"
                )));
            }
        }

        let mut branch_changed = false;
        if let (Some(branch), SessionType::Worktree) = (&branch, session.session_type) {
            let current = self.git.current_branch(&session.location_path).await?;
            if &current != branch {
                self.git
                    .rename_branch(&session.location_path, &current, branch)
                    .await?;
                branch_changed = true;
            }
            *session.worktree_id.lock().unwrap() = Some(branch.clone());
        }

        let effective_agent_id = agent_id
            .clone()
            .unwrap_or_else(|| old_agent.agent_id.clone());
        let agent_changed = effective_agent_id != old_agent.agent_id;

        self.workers.kill_worker(&old);
        self.output.reset_worker_output(session_id, worker_id).await?;

        let def = self
            .agents
            .resolve_effective(&effective_agent_id, self.repo_default_agent(&session).as_deref());
        let worker = Arc::new(self.workers.initialize_agent_worker(
            old.id.clone(),
            old.name.clone(),
            old.created_at.clone(),
            def.id.clone(),
        ));
        let spec = self
            .agent_spawn_spec(&session, &def, None, continue_conversation)
            .await?;
        self.workers.activate_agent_worker_pty(
            self.pty.as_ref(),
            &worker,
            &session.id,
            spec,
            &def.asking_patterns(),
            Some(self.activity_hook(session_id, worker_id)),
        )?;

        // The session may have been deleted during the async gap above.
        if self.sessions.get(session_id).is_none() {
            self.workers.kill_worker(&worker);
            return Ok(None);
        }
        session.workers.insert(worker_id.to_string(), worker.clone());
        self.sessions.mark_owned(&session)?;
        if agent_changed || branch_changed {
            self.sessions.emit(AppEvent::SessionUpdated(session.to_public()));
        }
        Ok(Some(worker.to_public()))
    }

    /// Revive a hibernated PTY worker on attach. Already-live workers come
    /// back with `was_restored = false`.
    pub async fn restore_worker(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<RestoreOutcome, CoreError> {
        let Some(session) = self.sessions.get(session_id) else {
            return Ok(RestoreOutcome::Failed(ErrorCode::WorkerNotFound));
        };
        let Some(worker) = session.get_worker(worker_id) else {
            return Ok(RestoreOutcome::Failed(ErrorCode::WorkerNotFound));
        };
        match &worker.kind {
            WorkerKind::GitDiff(_) => {
                return Ok(RestoreOutcome::Failed(ErrorCode::WorkerNotFound))
            }
            WorkerKind::Sdk(_) => {
                return Ok(RestoreOutcome::Ready {
                    was_restored: false,
                    worker,
                })
            }
            _ => {}
        }
        if worker.has_live_pty() {
            return Ok(RestoreOutcome::Ready {
                was_restored: false,
                worker,
            });
        }
        if !(self.path_exists)(&session.location_path) {
            return Ok(RestoreOutcome::Failed(ErrorCode::PathNotFound));
        }

        let activated = match &worker.kind {
            WorkerKind::Agent(agent) => {
                let def = self
                    .agents
                    .resolve_effective(&agent.agent_id, self.repo_default_agent(&session).as_deref());
                match self.agent_spawn_spec(&session, &def, None, true).await {
                    Ok(spec) => self
                        .workers
                        .activate_agent_worker_pty(
                            self.pty.as_ref(),
                            &worker,
                            &session.id,
                            spec,
                            &def.asking_patterns(),
                            Some(self.activity_hook(session_id, worker_id)),
                        )
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            WorkerKind::Terminal(_) => {
                let env = self.repository_env(&session);
                let spec = PtySpawnSpec::login_shell(Some(session.location_path.clone()), env);
                self.workers
                    .activate_terminal_worker_pty(self.pty.as_ref(), &worker, &session.id, spec)
                    .map(|_| ())
            }
            _ => unreachable!(),
        };
        if let Err(e) = activated {
            tracing::warn!(session_id, worker_id, error = %e, "worker activation failed");
            let code = match e {
                CoreError::PtyUnavailable(_) => ErrorCode::PtyUnavailable,
                _ => ErrorCode::ActivationFailed,
            };
            return Ok(RestoreOutcome::Failed(code));
        }

        self.sessions.mark_owned(&session)?;
        self.sessions.emit(AppEvent::WorkerActivated {
            session_id: session_id.to_string(),
            worker_id: worker_id.to_string(),
        });
        Ok(RestoreOutcome::Ready {
            was_restored: true,
            worker,
        })
    }

    /// Restore-or-fetch for mid-session lookups; swallows the error codes.
    pub async fn get_available_worker(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Option<Arc<Worker>> {
        match self.restore_worker(session_id, worker_id).await {
            Ok(RestoreOutcome::Ready { worker, .. }) => Some(worker),
            _ => None,
        }
    }

    pub fn attach_worker_callbacks(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Option<(String, WorkerEventReceiver)> {
        let worker = self.get_worker(session_id, worker_id)?;
        self.workers.attach_callbacks(&worker)
    }

    pub fn detach_worker_callbacks(
        &self,
        session_id: &str,
        worker_id: &str,
        connection_id: &str,
    ) -> bool {
        self.get_worker(session_id, worker_id)
            .map(|w| self.workers.detach_callbacks(&w, connection_id))
            .unwrap_or(false)
    }

    pub async fn write_worker_input(
        &self,
        session_id: &str,
        worker_id: &str,
        bytes: Vec<u8>,
    ) -> bool {
        match self.get_worker(session_id, worker_id) {
            Some(w) => self.workers.write_input(&w, bytes).await,
            None => false,
        }
    }

    pub fn resize_worker(&self, session_id: &str, worker_id: &str, cols: u16, rows: u16) -> bool {
        self.get_worker(session_id, worker_id)
            .map(|w| self.workers.resize(&w, cols, rows))
            .unwrap_or(false)
    }

    /// History for the worker channel: tail-by-lines when starting fresh,
    /// byte range when resuming from an offset. `None` for missing or
    /// git-diff workers.
    pub async fn get_worker_output_history(
        &self,
        session_id: &str,
        worker_id: &str,
        from_offset: Option<u64>,
        max_lines: Option<usize>,
    ) -> Result<Option<History>, CoreError> {
        let Some(worker) = self.get_worker(session_id, worker_id) else {
            return Ok(None);
        };
        if matches!(worker.kind, WorkerKind::GitDiff(_)) {
            return Ok(None);
        }
        let history = match (from_offset, max_lines) {
            (None | Some(0), Some(lines)) => {
                self.output
                    .read_last_n_lines(session_id, worker_id, lines)
                    .await?
            }
            (from, _) => {
                self.output
                    .read_history_with_offset(session_id, worker_id, from)
                    .await?
            }
        };
        Ok(Some(history))
    }

    /// In-memory ring fallback for when the file read times out.
    pub fn get_worker_ring_buffer(&self, session_id: &str, worker_id: &str) -> Option<Vec<u8>> {
        let worker = self.get_worker(session_id, worker_id)?;
        self.workers.get_output_buffer(&worker)
    }

    pub fn get_activity_state(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Option<crate::activity::ActivityState> {
        let worker = self.get_worker(session_id, worker_id)?;
        self.workers.get_activity_state(&worker)
    }

    fn activity_hook(&self, session_id: &str, worker_id: &str) -> ActivityHook {
        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();
        let worker_id = worker_id.to_string();
        Arc::new(move |state| {
            sessions.emit(AppEvent::WorkerActivity {
                session_id: session_id.clone(),
                worker_id: worker_id.clone(),
                activity_state: state,
            });
        })
    }

    fn agent_for_request(
        &self,
        session: &Session,
        agent_id: Option<&str>,
    ) -> Result<crate::agents::AgentDefinition, CoreError> {
        match agent_id {
            Some(id) => self
                .agents
                .get(id)
                .ok_or_else(|| CoreError::InvalidInput(format!("agent is not registered: {id}"))),
            None => {
                let fallback = self
                    .repo_default_agent(session)
                    .unwrap_or_else(|| crate::agents::DEFAULT_AGENT_ID.to_string());
                Ok(self.agents.resolve_effective(&fallback, None))
            }
        }
    }

    fn repo_default_agent(&self, session: &Session) -> Option<String> {
        let repo_id = session.repository_id.as_ref()?;
        self.db
            .with(|c| db::get_repository(c, repo_id))
            .ok()
            .flatten()
            .and_then(|r| r.default_agent_id)
    }

    /// Env vars from the linked repository record (JSON object of strings).
    fn repository_env(&self, session: &Session) -> HashMap<String, String> {
        let Some(repo_id) = session.repository_id.as_ref() else {
            return HashMap::new();
        };
        let raw = self
            .db
            .with(|c| db::get_repository(c, repo_id))
            .ok()
            .flatten()
            .and_then(|r| r.env_vars);
        raw.as_deref()
            .and_then(|s| serde_json::from_str::<HashMap<String, String>>(s).ok())
            .unwrap_or_default()
    }

    async fn agent_spawn_spec(
        &self,
        session: &Session,
        def: &crate::agents::AgentDefinition,
        prompt: Option<&str>,
        continue_conversation: bool,
    ) -> Result<PtySpawnSpec, CoreError> {
        let command = def.render_command(prompt, continue_conversation);
        let env = self.repository_env(session);
        Ok(PtySpawnSpec::shell_line(
            &command,
            Some(session.location_path.clone()),
            env,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputConfig;
    use crate::session::NewSession;
    use crate::testutil::{FakeGitRunner, FakePtyProvider};
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct Fixture {
        lifecycle: WorkerLifecycle,
        sessions: Arc<SessionManager>,
        provider: Arc<FakePtyProvider>,
        git: Arc<FakeGitRunner>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(jobs: bool, path_exists: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        let output = OutputFileManager::new(dir.path().join("outputs"), OutputConfig::default());
        let sessions = Arc::new(SessionManager::new(db.clone(), 4242));
        let workers = Arc::new(WorkerManager::new(output.clone(), 1000));
        let agents = Arc::new(AgentRegistry::new(db.clone()));
        let provider = Arc::new(FakePtyProvider::new());
        let git = Arc::new(FakeGitRunner::on_branch("main"));
        let queue = jobs.then(|| {
            let q = JobQueue::new(db.clone());
            q.register_output_cleanup(output.clone());
            q
        });
        let lifecycle = WorkerLifecycle::new(
            sessions.clone(),
            workers,
            output,
            agents,
            queue,
            provider.clone(),
            git.clone(),
            Arc::new(move |_: &Path| path_exists),
            db,
        );
        Fixture {
            lifecycle,
            sessions,
            provider,
            git,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(true, true)
    }

    fn quick_session(f: &Fixture) -> Arc<Session> {
        f.sessions
            .create_session(NewSession {
                session_type: SessionType::Quick,
                location_path: PathBuf::from("/tmp/x"),
                repository_id: None,
                worktree_id: None,
                title: None,
                initial_prompt: None,
            })
            .unwrap()
    }

    fn agent_request() -> CreateWorkerRequest {
        CreateWorkerRequest {
            worker_type: "agent".into(),
            name: None,
            agent_id: Some("claude-code-builtin".into()),
            base_commit: None,
        }
    }

    #[tokio::test]
    async fn create_agent_worker_spawns_pty_and_initializes_output() {
        let f = fixture();
        let s = quick_session(&f);
        let public = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, Some("fix the bug".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(public.worker_type, "agent");
        assert_eq!(public.name, "Claude Code");
        assert!(public.active);
        assert_eq!(f.provider.spawn_count(), 1);

        // The command line carries the quoted prompt and the session cwd.
        let specs = f.provider.specs.lock().unwrap();
        assert!(specs[0].args[1].contains("claude 'fix the bug'"));
        assert!(specs[0].args[1].contains("cd '/tmp/x'"));
        drop(specs);

        // Empty history is readable before any output arrives.
        let h = f
            .lifecycle
            .get_worker_output_history(&s.id, &public.id, Some(0), None)
            .await
            .unwrap()
            .unwrap();
        assert!(h.data.is_empty());
        assert_eq!(h.offset, 0);
    }

    #[tokio::test]
    async fn create_worker_in_missing_session_returns_none() {
        let f = fixture();
        let got = f
            .lifecycle
            .create_worker("missing", agent_request(), false, None)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn terminal_names_count_up() {
        let f = fixture();
        let s = quick_session(&f);
        let req = |_: usize| CreateWorkerRequest {
            worker_type: "terminal".into(),
            name: None,
            agent_id: None,
            base_commit: None,
        };
        let t1 = f.lifecycle.create_worker(&s.id, req(1), false, None).await.unwrap().unwrap();
        let t2 = f.lifecycle.create_worker(&s.id, req(2), false, None).await.unwrap().unwrap();
        assert_eq!(t1.name, "Terminal 1");
        assert_eq!(t2.name, "Terminal 2");
    }

    #[tokio::test]
    async fn delete_worker_kills_and_enqueues_cleanup() {
        let f = fixture();
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        assert!(f.lifecycle.delete_worker(&s.id, &w.id).await.unwrap());
        assert!(f.provider.last().killed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(s.get_worker(&w.id).is_none());
        assert!(!f.lifecycle.delete_worker(&s.id, &w.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_worker_without_queue_is_an_error() {
        let f = fixture_with(false, true);
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        let err = f.lifecycle.delete_worker(&s.id, &w.id).await;
        assert!(matches!(err, Err(CoreError::JobQueueUnavailable)));
    }

    #[tokio::test]
    async fn restore_revives_hibernated_worker_with_continue() {
        let f = fixture();
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        // Hibernate, as after a server restart.
        let worker = s.get_worker(&w.id).unwrap();
        f.lifecycle.workers.kill_worker(&worker);
        assert!(!worker.has_live_pty());

        let mut events = f.sessions.subscribe_events();
        match f.lifecycle.restore_worker(&s.id, &w.id).await.unwrap() {
            RestoreOutcome::Ready { was_restored, .. } => assert!(was_restored),
            RestoreOutcome::Failed(code) => panic!("restore failed: {code}"),
        }
        assert_eq!(f.provider.spawn_count(), 2);
        let specs = f.provider.specs.lock().unwrap();
        assert!(specs[1].args[1].contains("claude --continue"));
        drop(specs);
        assert!(matches!(
            events.try_recv().unwrap(),
            AppEvent::WorkerActivated { .. }
        ));
    }

    #[tokio::test]
    async fn restore_live_worker_is_a_noop() {
        let f = fixture();
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        match f.lifecycle.restore_worker(&s.id, &w.id).await.unwrap() {
            RestoreOutcome::Ready { was_restored, .. } => assert!(!was_restored),
            RestoreOutcome::Failed(code) => panic!("restore failed: {code}"),
        }
        assert_eq!(f.provider.spawn_count(), 1);
    }

    #[tokio::test]
    async fn restore_reports_missing_path() {
        let f = fixture_with(true, false);
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        let worker = s.get_worker(&w.id).unwrap();
        f.lifecycle.workers.kill_worker(&worker);
        match f.lifecycle.restore_worker(&s.id, &w.id).await.unwrap() {
            RestoreOutcome::Failed(code) => assert_eq!(code, ErrorCode::PathNotFound),
            RestoreOutcome::Ready { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn restore_reports_activation_failure() {
        let f = fixture();
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        let worker = s.get_worker(&w.id).unwrap();
        f.lifecycle.workers.kill_worker(&worker);
        f.provider
            .fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
        match f.lifecycle.restore_worker(&s.id, &w.id).await.unwrap() {
            RestoreOutcome::Failed(code) => assert_eq!(code, ErrorCode::ActivationFailed),
            RestoreOutcome::Ready { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn restore_missing_worker_reports_not_found() {
        let f = fixture();
        let s = quick_session(&f);
        match f.lifecycle.restore_worker(&s.id, "nope").await.unwrap() {
            RestoreOutcome::Failed(code) => assert_eq!(code, ErrorCode::WorkerNotFound),
            RestoreOutcome::Ready { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn restart_preserves_id_and_created_at_and_resets_output() {
        let f = fixture();
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        f.lifecycle
            .output
            .buffer_output(&s.id, &w.id, b"old scrollback")
            .await;
        f.lifecycle.output.flush(&s.id, &w.id).await.unwrap();

        let restarted = f
            .lifecycle
            .restart_agent_worker(&s.id, &w.id, true, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restarted.id, w.id);
        assert_eq!(restarted.created_at, w.created_at);
        assert_eq!(f.provider.spawn_count(), 2);

        let h = f
            .lifecycle
            .get_worker_output_history(&s.id, &w.id, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.offset, 0);
    }

    #[tokio::test]
    async fn restart_renames_branch_only_when_different() {
        let f = fixture();
        let s = f
            .sessions
            .create_session(NewSession {
                session_type: SessionType::Worktree,
                location_path: PathBuf::from("/tmp/wt"),
                repository_id: None,
                worktree_id: Some("main".into()),
                title: None,
                initial_prompt: None,
            })
            .unwrap();
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();

        f.lifecycle
            .restart_agent_worker(&s.id, &w.id, true, None, Some("main".into()))
            .await
            .unwrap()
            .unwrap();
        assert!(f.git.renames.lock().unwrap().is_empty());

        f.lifecycle
            .restart_agent_worker(&s.id, &w.id, true, None, Some("feature-1".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.git.renames.lock().unwrap().len(), 1);
        assert_eq!(s.worktree_id().as_deref(), Some("feature-1"));
    }

    #[tokio::test]
    async fn restart_rejects_unregistered_agent() {
        let f = fixture();
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        let err = f
            .lifecycle
            .restart_agent_worker(&s.id, &w.id, true, Some("ghost".into()), None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn history_is_none_for_git_diff_workers() {
        let f = fixture();
        let s = quick_session(&f);
        let w = f
            .lifecycle
            .create_worker(
                &s.id,
                CreateWorkerRequest {
                    worker_type: "git-diff".into(),
                    name: None,
                    agent_id: None,
                    base_commit: Some("abc123".into()),
                },
                false,
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.name, "Git Diff");
        let h = f
            .lifecycle
            .get_worker_output_history(&s.id, &w.id, Some(0), None)
            .await
            .unwrap();
        assert!(h.is_none());
        // And no subscriber channel either.
        assert!(f.lifecycle.attach_worker_callbacks(&s.id, &w.id).is_none());
    }

    #[tokio::test]
    async fn delete_session_drops_workers_and_session() {
        let f = fixture();
        let s = quick_session(&f);
        f.lifecycle
            .create_worker(&s.id, agent_request(), false, None)
            .await
            .unwrap()
            .unwrap();
        assert!(f.lifecycle.delete_session(&s.id).await.unwrap());
        assert!(f.sessions.get(&s.id).is_none());
        assert!(f.provider.last().killed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
