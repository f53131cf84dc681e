//! Runtime configuration: home directory resolution and tunables.
//! Constructed once in `main` and passed down explicitly; tests build their own
//! instance pointing at a temp dir, so nothing here is process-global.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the console home directory.
pub const HOME_ENV: &str = "AGENT_CONSOLE_HOME";

/// Config for the whole runtime. Field defaults match the documented tunables;
/// tests shrink `max_file_size` / intervals as needed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for everything the server persists: `data.db`, `outputs/`.
    pub home: PathBuf,
    /// Scrollback flush batching window.
    pub flush_interval: Duration,
    /// Pending bytes that trigger an immediate scrollback flush.
    pub flush_threshold_bytes: usize,
    /// Scrollback file size cap; files are truncated to ~80% of this.
    pub max_file_size: u64,
    /// In-memory fallback ring per PTY worker.
    pub ring_buffer_bytes: usize,
    /// Per-connection WebSocket output coalescing window.
    pub ws_output_flush_interval: Duration,
    /// Buffered bytes that force a WebSocket output flush before the timer.
    pub ws_output_flush_threshold: usize,
    /// Lines of history sent on worker attach.
    pub initial_history_lines: usize,
    /// Deadline for the initial history load on attach.
    pub initial_history_timeout: Duration,
    /// Deadline for a client-requested history reload.
    pub request_history_timeout: Duration,
}

impl Config {
    /// Resolve the home directory: `$AGENT_CONSOLE_HOME`, else `$HOME/.agent-console`.
    pub fn resolve_home() -> PathBuf {
        if let Ok(dir) = std::env::var(HOME_ENV) {
            let dir = dir.trim().to_string();
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".agent-console")
    }

    pub fn from_env() -> Self {
        Self::with_home(Self::resolve_home())
    }

    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            flush_interval: Duration::from_millis(100),
            flush_threshold_bytes: 64 * 1024,
            max_file_size: 5 * 1024 * 1024,
            ring_buffer_bytes: 100_000,
            ws_output_flush_interval: Duration::from_millis(50),
            ws_output_flush_threshold: 16 * 1024,
            initial_history_lines: 1000,
            initial_history_timeout: Duration::from_secs(15),
            request_history_timeout: Duration::from_secs(5),
        }
    }

    /// Path of the SQLite store.
    pub fn db_path(&self) -> PathBuf {
        self.home.join("data.db")
    }

    /// Root of per-worker scrollback files.
    pub fn outputs_dir(&self) -> PathBuf {
        self.home.join("outputs")
    }
}
