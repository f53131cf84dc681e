//! Session-agnostic PTY worker runtime: the worker model, PTY activation
//! wiring, and per-connection subscriber fan-out.
//!
//! Each activated PTY gets one pump task that delivers every chunk, in read
//! order, to the in-memory ring, the scrollback buffer, the activity detector
//! (agents), and a snapshot of the current subscribers. Subscribers are
//! per-connection unbounded channels, so a slow WebSocket client never stalls
//! the PTY read path.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::activity::{ActivityConfig, ActivityDetector, ActivityState};
use crate::error::CoreError;
use crate::output::OutputFileManager;
use crate::pty::{PtyHandle, PtyProvider, PtySpawnSpec};
use crate::ring::RingBuffer;

/// One event on a worker's subscriber channel.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Output(Bytes),
    Exit { exit_code: i32, signal: Option<i32> },
    Activity(ActivityState),
}

pub type WorkerEventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type WorkerEventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

/// Per-connection subscriber set. Broadcasts iterate over a snapshot taken at
/// event time, so attach/detach during a fan-out never affects it.
#[derive(Clone, Default)]
pub struct Subscribers {
    map: Arc<Mutex<HashMap<String, WorkerEventSender>>>,
}

impl Subscribers {
    /// Register a connection; the returned id stays valid until `detach`.
    pub fn attach(&self) -> (String, WorkerEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        self.map.lock().unwrap().insert(id.clone(), tx);
        (id, rx)
    }

    pub fn detach(&self, connection_id: &str) -> bool {
        self.map.lock().unwrap().remove(connection_id).is_some()
    }

    pub fn broadcast(&self, event: WorkerEvent) {
        let snapshot: Vec<WorkerEventSender> =
            self.map.lock().unwrap().values().cloned().collect();
        for tx in snapshot {
            let _ = tx.send(event.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live-PTY side of an agent or terminal worker. `pty` is `None` while the
/// worker is hibernated (registered, no child process).
pub struct PtyRuntime {
    pty: Mutex<Option<Arc<PtyHandle>>>,
    pub subscribers: Subscribers,
    ring: Arc<RingBuffer>,
    last_pid: Mutex<Option<u32>>,
}

impl PtyRuntime {
    fn new(ring_cap: usize) -> Self {
        Self {
            pty: Mutex::new(None),
            subscribers: Subscribers::default(),
            ring: Arc::new(RingBuffer::new(ring_cap)),
            last_pid: Mutex::new(None),
        }
    }

    pub fn pty_handle(&self) -> Option<Arc<PtyHandle>> {
        self.pty.lock().unwrap().clone()
    }

    pub fn has_live_pty(&self) -> bool {
        self.pty.lock().unwrap().is_some()
    }

    /// Pid of the current (or most recent) child, for persistence.
    pub fn last_pid(&self) -> Option<u32> {
        *self.last_pid.lock().unwrap()
    }

    pub fn set_last_pid(&self, pid: Option<u32>) {
        *self.last_pid.lock().unwrap() = pid;
    }
}

pub struct AgentWorker {
    pub agent_id: String,
    pub runtime: PtyRuntime,
    detector: Mutex<Option<ActivityDetector>>,
}

impl AgentWorker {
    pub fn detector(&self) -> Option<ActivityDetector> {
        self.detector.lock().unwrap().clone()
    }
}

pub struct TerminalWorker {
    pub runtime: PtyRuntime,
}

/// Watches a working tree against a base commit; no PTY, no scrollback.
pub struct GitDiffWorker {
    base_commit: Mutex<String>,
}

impl GitDiffWorker {
    pub fn base_commit(&self) -> String {
        self.base_commit.lock().unwrap().clone()
    }

    pub fn set_base_commit(&self, commit: String) {
        *self.base_commit.lock().unwrap() = commit;
    }
}

/// Alternate agent flavor driven through an SDK instead of a PTY. The message
/// log and abort handle live here; driving the conversation is the HTTP
/// collaborator's business.
pub struct SdkWorker {
    pub agent_id: String,
    pub sdk_session_id: Mutex<Option<String>>,
    pub messages: Mutex<Vec<serde_json::Value>>,
    pub abort: Mutex<Option<tokio::task::AbortHandle>>,
    pub is_running: AtomicBool,
    pub subscribers: Subscribers,
}

pub enum WorkerKind {
    Agent(AgentWorker),
    Terminal(TerminalWorker),
    GitDiff(GitDiffWorker),
    Sdk(SdkWorker),
}

pub struct Worker {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub kind: WorkerKind,
}

impl Worker {
    pub fn kind_str(&self) -> &'static str {
        match &self.kind {
            WorkerKind::Agent(_) => "agent",
            WorkerKind::Terminal(_) => "terminal",
            WorkerKind::GitDiff(_) => "git-diff",
            WorkerKind::Sdk(_) => "sdk",
        }
    }

    /// The PTY runtime for agent/terminal workers; `None` otherwise.
    pub fn pty_runtime(&self) -> Option<&PtyRuntime> {
        match &self.kind {
            WorkerKind::Agent(a) => Some(&a.runtime),
            WorkerKind::Terminal(t) => Some(&t.runtime),
            _ => None,
        }
    }

    pub fn subscribers(&self) -> Option<&Subscribers> {
        match &self.kind {
            WorkerKind::Agent(a) => Some(&a.runtime.subscribers),
            WorkerKind::Terminal(t) => Some(&t.runtime.subscribers),
            WorkerKind::Sdk(s) => Some(&s.subscribers),
            WorkerKind::GitDiff(_) => None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            WorkerKind::Agent(a) => Some(&a.agent_id),
            WorkerKind::Sdk(s) => Some(&s.agent_id),
            _ => None,
        }
    }

    /// Hibernated PTY workers have `pty = None`; git-diff and SDK workers are
    /// never "live" in the PTY sense.
    pub fn has_live_pty(&self) -> bool {
        self.pty_runtime().map(|rt| rt.has_live_pty()).unwrap_or(false)
    }

    /// Drop the PTY handle and detector; run when the child exits or is killed.
    fn clear_pty(&self) {
        if let Some(rt) = self.pty_runtime() {
            *rt.pty.lock().unwrap() = None;
        }
        if let WorkerKind::Agent(a) = &self.kind {
            *a.detector.lock().unwrap() = None;
        }
    }

    pub fn to_public(&self) -> PublicWorker {
        let activity_state = match &self.kind {
            WorkerKind::Agent(a) => a.detector().map(|d| d.state()),
            _ => None,
        };
        let base_commit = match &self.kind {
            WorkerKind::GitDiff(g) => Some(g.base_commit()),
            _ => None,
        };
        PublicWorker {
            id: self.id.clone(),
            name: self.name.clone(),
            worker_type: self.kind_str().to_string(),
            created_at: self.created_at.clone(),
            agent_id: self.agent_id().map(|s| s.to_string()),
            base_commit,
            activity_state,
            active: self.has_live_pty(),
        }
    }
}

/// Value-copied worker view for API responses and broadcasts.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicWorker {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_state: Option<ActivityState>,
    pub active: bool,
}

/// Hook invoked on agent activity transitions, wired up to the app broadcast.
pub type ActivityHook = Arc<dyn Fn(ActivityState) + Send + Sync>;

/// Low-level worker operations: initialize metadata, activate PTYs, route I/O.
pub struct WorkerManager {
    output: OutputFileManager,
    ring_cap: usize,
    activity_cfg: ActivityConfig,
}

impl WorkerManager {
    pub fn new(output: OutputFileManager, ring_cap: usize) -> Self {
        Self {
            output,
            ring_cap,
            activity_cfg: ActivityConfig::default(),
        }
    }

    pub fn initialize_agent_worker(
        &self,
        id: String,
        name: String,
        created_at: String,
        agent_id: String,
    ) -> Worker {
        Worker {
            id,
            name,
            created_at,
            kind: WorkerKind::Agent(AgentWorker {
                agent_id,
                runtime: PtyRuntime::new(self.ring_cap),
                detector: Mutex::new(None),
            }),
        }
    }

    pub fn initialize_terminal_worker(&self, id: String, name: String, created_at: String) -> Worker {
        Worker {
            id,
            name,
            created_at,
            kind: WorkerKind::Terminal(TerminalWorker {
                runtime: PtyRuntime::new(self.ring_cap),
            }),
        }
    }

    pub fn initialize_git_diff_worker(
        &self,
        id: String,
        name: String,
        created_at: String,
        base_commit: String,
    ) -> Worker {
        Worker {
            id,
            name,
            created_at,
            kind: WorkerKind::GitDiff(GitDiffWorker {
                base_commit: Mutex::new(base_commit),
            }),
        }
    }

    pub fn initialize_sdk_worker(
        &self,
        id: String,
        name: String,
        created_at: String,
        agent_id: String,
    ) -> Worker {
        Worker {
            id,
            name,
            created_at,
            kind: WorkerKind::Sdk(SdkWorker {
                agent_id,
                sdk_session_id: Mutex::new(None),
                messages: Mutex::new(Vec::new()),
                abort: Mutex::new(None),
                is_running: AtomicBool::new(false),
                subscribers: Subscribers::default(),
            }),
        }
    }

    /// Spawn the agent PTY and wire its streams. `asking_patterns` come from
    /// the agent definition; `on_activity` fans transitions to the app channel.
    pub fn activate_agent_worker_pty(
        &self,
        provider: &dyn PtyProvider,
        worker: &Arc<Worker>,
        session_id: &str,
        spec: PtySpawnSpec,
        asking_patterns: &[String],
        on_activity: Option<ActivityHook>,
    ) -> Result<u32, CoreError> {
        let WorkerKind::Agent(agent) = &worker.kind else {
            return Err(CoreError::InvalidInput("worker is not an agent".into()));
        };
        let handle = provider.spawn(spec)?;
        let subscribers = agent.runtime.subscribers.clone();
        let detector = ActivityDetector::new(self.activity_cfg.clone(), asking_patterns, {
            let subscribers = subscribers.clone();
            move |state| {
                subscribers.broadcast(WorkerEvent::Activity(state));
                if let Some(hook) = &on_activity {
                    hook(state);
                }
            }
        });
        *agent.detector.lock().unwrap() = Some(detector.clone());
        self.wire_pty(worker, session_id, handle.clone(), Some(detector));
        Ok(handle.pid())
    }

    /// Spawn the terminal shell PTY and wire its streams.
    pub fn activate_terminal_worker_pty(
        &self,
        provider: &dyn PtyProvider,
        worker: &Arc<Worker>,
        session_id: &str,
        spec: PtySpawnSpec,
    ) -> Result<u32, CoreError> {
        if !matches!(worker.kind, WorkerKind::Terminal(_)) {
            return Err(CoreError::InvalidInput("worker is not a terminal".into()));
        }
        let handle = provider.spawn(spec)?;
        self.wire_pty(worker, session_id, handle.clone(), None);
        Ok(handle.pid())
    }

    fn wire_pty(
        &self,
        worker: &Arc<Worker>,
        session_id: &str,
        handle: Arc<PtyHandle>,
        detector: Option<ActivityDetector>,
    ) {
        let rt = worker
            .pty_runtime()
            .expect("wire_pty called on a PTY worker");
        let data_rx = handle.take_data_channel();
        let exit_rx = handle.take_exit_channel();
        *rt.pty.lock().unwrap() = Some(handle.clone());
        rt.set_last_pid(Some(handle.pid()));

        if let Some(mut data_rx) = data_rx {
            let output = self.output.clone();
            let subscribers = rt.subscribers.clone();
            let ring = rt.ring.clone();
            let sid = session_id.to_string();
            let wid = worker.id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = data_rx.recv().await {
                    ring.push(&chunk);
                    output.buffer_output(&sid, &wid, &chunk).await;
                    if let Some(det) = &detector {
                        det.process_output(&chunk);
                    }
                    subscribers.broadcast(WorkerEvent::Output(Bytes::from(chunk)));
                }
            });
        }

        if let Some(mut exit_rx) = exit_rx {
            let worker = worker.clone();
            tokio::spawn(async move {
                if let Some(exit) = exit_rx.recv().await {
                    // Hibernate before fan-out so a racing attach sees pty=None.
                    worker.clear_pty();
                    if let Some(subs) = worker.subscribers() {
                        subs.broadcast(WorkerEvent::Exit {
                            exit_code: exit.exit_code,
                            signal: exit.signal,
                        });
                    }
                }
            });
        }
    }

    /// Register a subscriber channel; multiple attachments per worker are
    /// normal (one per browser tab). `None` for git-diff workers.
    pub fn attach_callbacks(&self, worker: &Worker) -> Option<(String, WorkerEventReceiver)> {
        worker.subscribers().map(|s| s.attach())
    }

    pub fn detach_callbacks(&self, worker: &Worker, connection_id: &str) -> bool {
        worker
            .subscribers()
            .map(|s| s.detach(connection_id))
            .unwrap_or(false)
    }

    /// Write keystrokes to the PTY. Agent keystrokes also feed the user-typing
    /// signal before the write. Returns false when there is no live PTY.
    pub async fn write_input(&self, worker: &Worker, bytes: Vec<u8>) -> bool {
        if let WorkerKind::Agent(a) = &worker.kind {
            if let Some(det) = a.detector() {
                det.note_user_input(&bytes);
            }
        }
        let Some(rt) = worker.pty_runtime() else {
            return false;
        };
        let Some(handle) = rt.pty_handle() else {
            return false;
        };
        let writer = handle.writer();
        // The child may not be draining; keep the blocking write off this task.
        tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = writer.lock() {
                let _ = guard.write_all(&bytes);
                let _ = guard.flush();
            }
        })
        .await
        .is_ok()
    }

    pub fn resize(&self, worker: &Worker, cols: u16, rows: u16) -> bool {
        match worker.pty_runtime().and_then(|rt| rt.pty_handle()) {
            Some(handle) => {
                handle.resize(cols, rows);
                true
            }
            None => false,
        }
    }

    /// Kill the child (or abort the SDK query) and hibernate the worker.
    pub fn kill_worker(&self, worker: &Worker) {
        match &worker.kind {
            WorkerKind::Agent(_) | WorkerKind::Terminal(_) => {
                if let Some(handle) = worker.pty_runtime().and_then(|rt| rt.pty_handle()) {
                    if let Err(e) = handle.kill() {
                        tracing::warn!(worker_id = %worker.id, error = %e, "pty kill failed");
                    }
                }
                worker.clear_pty();
            }
            WorkerKind::Sdk(sdk) => {
                if let Some(abort) = sdk.abort.lock().unwrap().take() {
                    abort.abort();
                }
                sdk.is_running.store(false, Ordering::SeqCst);
            }
            WorkerKind::GitDiff(_) => {}
        }
    }

    /// In-memory ring contents, the fallback history source.
    pub fn get_output_buffer(&self, worker: &Worker) -> Option<Vec<u8>> {
        worker.pty_runtime().map(|rt| rt.ring.dump())
    }

    pub fn get_activity_state(&self, worker: &Worker) -> Option<ActivityState> {
        match &worker.kind {
            WorkerKind::Agent(a) => Some(
                a.detector()
                    .map(|d| d.state())
                    .unwrap_or(ActivityState::Unknown),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputConfig;
    use crate::testutil::FakePtyProvider;
    use tempfile::tempdir;

    fn manager() -> (WorkerManager, OutputFileManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let output = OutputFileManager::new(dir.path().join("outputs"), OutputConfig::default());
        (WorkerManager::new(output.clone(), 1000), output, dir)
    }

    fn terminal(mgr: &WorkerManager) -> Arc<Worker> {
        Arc::new(mgr.initialize_terminal_worker(
            "w1".into(),
            "Terminal 1".into(),
            "2026-01-01T00:00:00Z".into(),
        ))
    }

    #[tokio::test]
    async fn initialized_worker_is_hibernated() {
        let (mgr, _out, _dir) = manager();
        let w = terminal(&mgr);
        assert!(!w.has_live_pty());
        assert!(w.pty_runtime().unwrap().last_pid().is_none());
    }

    #[tokio::test]
    async fn chunk_fans_out_to_every_subscriber_exactly_once() {
        let (mgr, _out, _dir) = manager();
        let provider = FakePtyProvider::new();
        let w = terminal(&mgr);
        let (_id1, mut rx1) = mgr.attach_callbacks(&w).unwrap();
        let (_id2, mut rx2) = mgr.attach_callbacks(&w).unwrap();
        mgr.activate_terminal_worker_pty(
            &provider,
            &w,
            "s",
            PtySpawnSpec::login_shell(None, Default::default()),
        )
        .unwrap();

        provider.last().data_tx.send(b"hello".to_vec()).await.unwrap();
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                WorkerEvent::Output(b) => assert_eq!(&b[..], b"hello"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn detach_does_not_affect_other_connections() {
        let (mgr, _out, _dir) = manager();
        let provider = FakePtyProvider::new();
        let w = terminal(&mgr);
        let (id1, mut rx1) = mgr.attach_callbacks(&w).unwrap();
        let (_id2, mut rx2) = mgr.attach_callbacks(&w).unwrap();
        mgr.activate_terminal_worker_pty(
            &provider,
            &w,
            "s",
            PtySpawnSpec::login_shell(None, Default::default()),
        )
        .unwrap();
        let fake = provider.last();

        fake.data_tx.send(b"one".to_vec()).await.unwrap();
        assert!(matches!(rx1.recv().await, Some(WorkerEvent::Output(_))));
        assert!(matches!(rx2.recv().await, Some(WorkerEvent::Output(_))));

        assert!(mgr.detach_callbacks(&w, &id1));
        fake.data_tx.send(b"two".to_vec()).await.unwrap();
        match rx2.recv().await.unwrap() {
            WorkerEvent::Output(b) => assert_eq!(&b[..], b"two"),
            other => panic!("unexpected event: {other:?}"),
        }
        // Conn-1 saw only the first chunk.
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn output_reaches_scrollback_and_ring() {
        let (mgr, out, _dir) = manager();
        let provider = FakePtyProvider::new();
        let w = terminal(&mgr);
        mgr.activate_terminal_worker_pty(
            &provider,
            &w,
            "s",
            PtySpawnSpec::login_shell(None, Default::default()),
        )
        .unwrap();
        let (_id, mut rx) = mgr.attach_callbacks(&w).unwrap();

        provider.last().data_tx.send(b"persisted".to_vec()).await.unwrap();
        // Wait until the pump has delivered to everything downstream.
        rx.recv().await.unwrap();

        assert_eq!(mgr.get_output_buffer(&w).unwrap(), b"persisted");
        assert_eq!(out.get_current_offset("s", "w1").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn exit_hibernates_then_notifies() {
        let (mgr, _out, _dir) = manager();
        let provider = FakePtyProvider::new();
        let w = terminal(&mgr);
        mgr.activate_terminal_worker_pty(
            &provider,
            &w,
            "s",
            PtySpawnSpec::login_shell(None, Default::default()),
        )
        .unwrap();
        let (_id, mut rx) = mgr.attach_callbacks(&w).unwrap();

        provider
            .last()
            .exit_tx
            .send(crate::pty::PtyExit {
                exit_code: 0,
                signal: None,
            })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            WorkerEvent::Exit { exit_code, signal } => {
                assert_eq!(exit_code, 0);
                assert!(signal.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!w.has_live_pty());
    }

    #[tokio::test]
    async fn kill_clears_pty_and_detector() {
        let (mgr, _out, _dir) = manager();
        let provider = FakePtyProvider::new();
        let w = Arc::new(mgr.initialize_agent_worker(
            "w1".into(),
            "claude".into(),
            "2026-01-01T00:00:00Z".into(),
            "claude-code-builtin".into(),
        ));
        mgr.activate_agent_worker_pty(
            &provider,
            &w,
            "s",
            PtySpawnSpec::shell_line("claude", None, Default::default()),
            &[],
            None,
        )
        .unwrap();
        assert!(w.has_live_pty());
        assert_eq!(mgr.get_activity_state(&w), Some(ActivityState::Unknown));

        mgr.kill_worker(&w);
        assert!(!w.has_live_pty());
        assert!(provider.last().killed.load(Ordering::SeqCst));
        match &w.kind {
            WorkerKind::Agent(a) => assert!(a.detector().is_none()),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn write_input_reaches_fake_writer() {
        let (mgr, _out, _dir) = manager();
        let provider = FakePtyProvider::new();
        let w = terminal(&mgr);
        mgr.activate_terminal_worker_pty(
            &provider,
            &w,
            "s",
            PtySpawnSpec::login_shell(None, Default::default()),
        )
        .unwrap();
        assert!(mgr.write_input(&w, b"ls\r".to_vec()).await);
        assert_eq!(provider.last().written.lock().unwrap().as_slice(), b"ls\r");
    }

    #[tokio::test]
    async fn write_input_without_pty_returns_false() {
        let (mgr, _out, _dir) = manager();
        let w = terminal(&mgr);
        assert!(!mgr.write_input(&w, b"x".to_vec()).await);
    }
}
