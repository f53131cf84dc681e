//! Portable PTY provider: spawn a child under a pseudo-terminal and bridge its
//! byte stream into the async world. The reader runs on a blocking thread and
//! feeds an mpsc channel; resize requests go through a dedicated thread that
//! owns the master; a poll thread watches `try_wait()` and reports the exit.
//!
//! `PtyProvider` is the seam the worker manager spawns through; tests swap in
//! a scripted fake instead of a real shell.

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::CoreError;

/// What to spawn and where. `command` + `args` are exec-style; shell lines are
/// built by the caller (`bash -c "cd '<dir>' && exec <cmd>"`).
#[derive(Debug, Clone)]
pub struct PtySpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl PtySpawnSpec {
    /// Shell line wrapped for a working directory on unix: `bash -c "cd '<dir>' && exec <line>"`.
    pub fn shell_line(line: &str, cwd: Option<PathBuf>, env: HashMap<String, String>) -> Self {
        let (command, args) = match &cwd {
            Some(dir) => {
                let path = dir.to_string_lossy();
                let escaped = path.replace('\'', "'\"'\"'");
                (
                    "bash".to_string(),
                    vec!["-c".to_string(), format!("cd '{}' && exec {}", escaped, line)],
                )
            }
            None => ("bash".to_string(), vec!["-c".to_string(), line.to_string()]),
        };
        Self {
            command,
            args,
            cwd,
            env,
            cols: 80,
            rows: 24,
        }
    }

    /// Login shell for terminal workers.
    pub fn login_shell(cwd: Option<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            command: "bash".to_string(),
            args: vec!["-l".to_string()],
            cwd,
            env,
            cols: 80,
            rows: 24,
        }
    }
}

/// Exit report from the PTY child. portable-pty folds signals into the exit
/// code, so `signal` stays `None` unless a platform reports one separately.
#[derive(Debug, Clone, Copy)]
pub struct PtyExit {
    pub exit_code: i32,
    pub signal: Option<i32>,
}

/// Sender to request PTY resize (cols, rows); a dedicated thread runs `master.resize()`.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// The slice of the child-process surface the handle needs. The native
/// provider wraps portable-pty's child; test fakes implement it directly.
pub(crate) trait PtyChild: Send {
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;
    fn kill(&mut self) -> std::io::Result<()>;
}

struct NativeChild(Box<dyn portable_pty::Child + Send + Sync>);

impl PtyChild for NativeChild {
    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        self.0
            .try_wait()
            .map(|status| status.map(|s| s.exit_code() as i32))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill()
    }
}

/// A live PTY child. The data and exit channels are take-once: whoever
/// activates the worker owns the pump.
pub struct PtyHandle {
    pid: u32,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn PtyChild>>>,
    resize_tx: ResizeSender,
    data_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    exit_rx: Mutex<Option<mpsc::Receiver<PtyExit>>>,
    killed: AtomicBool,
}

impl PtyHandle {
    pub(crate) fn from_parts(
        pid: u32,
        writer: Box<dyn Write + Send>,
        child: Arc<Mutex<Box<dyn PtyChild>>>,
        resize_tx: ResizeSender,
        data_rx: mpsc::Receiver<Vec<u8>>,
        exit_rx: mpsc::Receiver<PtyExit>,
    ) -> Self {
        Self {
            pid,
            writer: Arc::new(Mutex::new(writer)),
            child,
            resize_tx,
            data_rx: Mutex::new(Some(data_rx)),
            exit_rx: Mutex::new(Some(exit_rx)),
            killed: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the output byte stream. Returns `None` on the second call.
    pub fn take_data_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.data_rx.lock().ok().and_then(|mut g| g.take())
    }

    /// Take the exit channel. Returns `None` on the second call.
    pub fn take_exit_channel(&self) -> Option<mpsc::Receiver<PtyExit>> {
        self.exit_rx.lock().ok().and_then(|mut g| g.take())
    }

    /// Write bytes to the child's stdin. Callers on the async path should wrap
    /// this in `spawn_blocking`; the write can stall when the child stops reading.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("pty writer mutex poisoned"))?;
        guard.write_all(bytes)?;
        guard.flush()
    }

    /// Clone of the shared writer, for `spawn_blocking` writes.
    pub fn writer(&self) -> Arc<Mutex<Box<dyn Write + Send>>> {
        self.writer.clone()
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.resize_tx.send((cols, rows));
    }

    /// Kill the child process. Idempotent.
    pub fn kill(&self) -> std::io::Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self
            .child
            .lock()
            .map_err(|_| std::io::Error::other("pty child mutex poisoned"))?;
        guard.kill()
    }
}

/// Capability seam for spawning PTYs. Production uses [`NativePtyProvider`];
/// tests inject a fake that records specs and scripts output.
pub trait PtyProvider: Send + Sync {
    fn spawn(&self, spec: PtySpawnSpec) -> Result<Arc<PtyHandle>, CoreError>;
}

/// Real PTY system via portable-pty.
pub struct NativePtyProvider;

impl PtyProvider for NativePtyProvider {
    fn spawn(&self, spec: PtySpawnSpec) -> Result<Arc<PtyHandle>, CoreError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::PtyUnavailable(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.cwd(dir);
        }
        // The child should see a modern 256/truecolor terminal (matches xterm.js).
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::PtySpawn(e.to_string()))?;
        let pid = child.process_id().unwrap_or(0);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| CoreError::PtyUnavailable(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| CoreError::PtyUnavailable(e.to_string()))?;
        let master = pair.master;

        let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(256);
        let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
        let (exit_tx, exit_rx) = mpsc::channel::<PtyExit>(1);

        let child: Arc<Mutex<Box<dyn PtyChild>>> =
            Arc::new(Mutex::new(Box::new(NativeChild(child))));

        // Blocking thread: read PTY output and forward to the async side.
        // Read-sized chunks stay well under 64 KiB; UTF-8 sequences split at a
        // chunk boundary are tolerated downstream by boundary-aware readers.
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if data_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Dedicated thread: apply resize requests on the master.
        std::thread::spawn(move || {
            while let Ok((cols, rows)) = resize_rx.recv() {
                let size = PtySize {
                    cols,
                    rows,
                    pixel_width: 0,
                    pixel_height: 0,
                };
                let _ = master.resize(size);
            }
        });

        // Poll child.try_wait(); report the exit once, then stop.
        let child_poll = Arc::clone(&child);
        std::thread::spawn(move || loop {
            let code = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => None,
                    Ok(Some(code)) => Some(code),
                    Err(_) => break,
                }
            };
            if let Some(code) = code {
                let _ = exit_tx.blocking_send(PtyExit {
                    exit_code: code,
                    signal: None,
                });
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(200));
        });

        Ok(Arc::new(PtyHandle::from_parts(
            pid, writer, child, resize_tx, data_rx, exit_rx,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_line_wraps_cwd_with_quote_escaping() {
        let spec = PtySpawnSpec::shell_line(
            "claude --continue",
            Some(PathBuf::from("/tmp/it's here")),
            HashMap::new(),
        );
        assert_eq!(spec.command, "bash");
        assert_eq!(spec.args[0], "-c");
        assert!(spec.args[1].contains("cd '/tmp/it'\"'\"'s here'"));
        assert!(spec.args[1].ends_with("exec claude --continue"));
    }

    #[test]
    fn shell_line_without_cwd_runs_bare() {
        let spec = PtySpawnSpec::shell_line("gemini", None, HashMap::new());
        assert_eq!(spec.args, vec!["-c".to_string(), "gemini".to_string()]);
    }
}
