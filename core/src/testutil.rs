//! Scripted fakes for the capability seams, shared by the crate's unit tests.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::git::GitRunner;
use crate::pty::{PtyChild, PtyExit, PtyHandle, PtyProvider, PtySpawnSpec};

/// Writer sink that records everything written to the fake PTY.
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct FakeChild {
    killed: Arc<AtomicBool>,
}

impl PtyChild for FakeChild {
    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(None)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// PTY provider fake: records every spawn spec, hands out scriptable handles,
/// and can be told to fail the next spawn.
#[derive(Default)]
pub struct FakePtyProvider {
    pub specs: Mutex<Vec<PtySpawnSpec>>,
    pub spawned: Mutex<Vec<Arc<FakePtyShared>>>,
    pub fail_next: AtomicBool,
    next_pid: AtomicU32,
}

/// The scripting side of a spawned fake, kept by the provider.
pub struct FakePtyShared {
    pub pid: u32,
    pub data_tx: mpsc::Sender<Vec<u8>>,
    pub exit_tx: mpsc::Sender<PtyExit>,
    pub written: Arc<Mutex<Vec<u8>>>,
    pub killed: Arc<AtomicBool>,
}

impl FakePtyProvider {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    pub fn last(&self) -> Arc<FakePtyShared> {
        self.spawned.lock().unwrap().last().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

impl PtyProvider for FakePtyProvider {
    fn spawn(&self, spec: PtySpawnSpec) -> Result<Arc<PtyHandle>, CoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CoreError::PtySpawn("scripted spawn failure".into()));
        }
        self.specs.lock().unwrap().push(spec);

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let written = Arc::new(Mutex::new(Vec::new()));
        let killed = Arc::new(AtomicBool::new(false));
        let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, exit_rx) = mpsc::channel::<PtyExit>(1);
        let (resize_tx, _resize_rx) = std::sync::mpsc::channel::<(u16, u16)>();

        let child: Arc<Mutex<Box<dyn PtyChild>>> = Arc::new(Mutex::new(Box::new(FakeChild {
            killed: killed.clone(),
        })));
        let handle = Arc::new(PtyHandle::from_parts(
            pid,
            Box::new(SharedVecWriter(written.clone())),
            child,
            resize_tx,
            data_rx,
            exit_rx,
        ));
        self.spawned.lock().unwrap().push(Arc::new(FakePtyShared {
            pid,
            data_tx,
            exit_tx,
            written,
            killed,
        }));
        Ok(handle)
    }
}

/// Git runner fake: fixed current branch, records renames.
#[derive(Default)]
pub struct FakeGitRunner {
    pub current_branch: Mutex<String>,
    pub renames: Mutex<Vec<(PathBuf, String, String)>>,
}

impl FakeGitRunner {
    pub fn on_branch(branch: &str) -> Self {
        Self {
            current_branch: Mutex::new(branch.to_string()),
            renames: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl GitRunner for FakeGitRunner {
    async fn is_git_repo(&self, _path: &Path) -> bool {
        true
    }

    async fn current_branch(&self, _repo: &Path) -> Result<String, CoreError> {
        Ok(self.current_branch.lock().unwrap().clone())
    }

    async fn rename_branch(&self, repo: &Path, from: &str, to: &str) -> Result<(), CoreError> {
        self.renames
            .lock()
            .unwrap()
            .push((repo.to_path_buf(), from.to_string(), to.to_string()));
        *self.current_branch.lock().unwrap() = to.to_string();
        Ok(())
    }

    async fn add_worktree(
        &self,
        _repo: &Path,
        _path: &Path,
        _branch: &str,
        _create_branch: bool,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn remove_worktree(&self, _repo: &Path, _path: &Path) -> Result<(), CoreError> {
        Ok(())
    }
}
