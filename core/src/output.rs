//! Per-worker append-only scrollback files with flush batching.
//!
//! Files live at `{home}/outputs/{sessionId}/{workerId}.log`. Writers append
//! to an in-memory pending buffer; a scheduled task flushes after the batching
//! window, and crossing the threshold flushes immediately (fire-and-forget,
//! errors logged). All operations for one `(session, worker)` key serialize on
//! that key's async mutex. Offsets are byte offsets into the file; readers
//! slicing mid-codepoint advance forward to a UTF-8 boundary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::CoreError;

/// Tunables, split out of the main config so tests can shrink them.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub flush_interval: Duration,
    pub flush_threshold_bytes: usize,
    pub max_file_size: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            flush_threshold_bytes: 64 * 1024,
            max_file_size: 5 * 1024 * 1024,
        }
    }
}

/// History slice handed to clients: raw bytes plus the offset to resume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    pub data: Vec<u8>,
    pub offset: u64,
}

impl History {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            offset: 0,
        }
    }
}

type Key = (String, String);

#[derive(Default)]
struct Entry {
    pending: Vec<u8>,
    flush_scheduled: bool,
}

struct Inner {
    root: PathBuf,
    cfg: OutputConfig,
    entries: DashMap<Key, Arc<Mutex<Entry>>>,
}

/// Scrollback file manager. Cheap to clone; flush tasks hold clones.
#[derive(Clone)]
pub struct OutputFileManager {
    inner: Arc<Inner>,
}

impl OutputFileManager {
    /// `root` is the `outputs/` directory under the console home.
    pub fn new(root: PathBuf, cfg: OutputConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                cfg,
                entries: DashMap::new(),
            }),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.inner.root.join(session_id)
    }

    fn log_path(&self, session_id: &str, worker_id: &str) -> PathBuf {
        self.session_dir(session_id).join(format!("{worker_id}.log"))
    }

    fn entry(&self, session_id: &str, worker_id: &str) -> Arc<Mutex<Entry>> {
        self.inner
            .entries
            .entry((session_id.to_string(), worker_id.to_string()))
            .or_default()
            .clone()
    }

    /// Append bytes to the pending buffer. Never touches the disk on the
    /// caller's path: a flush is scheduled after the batching window, or
    /// spawned immediately once pending crosses the threshold.
    pub async fn buffer_output(&self, session_id: &str, worker_id: &str, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let entry = self.entry(session_id, worker_id);
        let mut g = entry.lock().await;
        g.pending.extend_from_slice(bytes);
        if g.pending.len() >= self.inner.cfg.flush_threshold_bytes {
            // Over threshold: flush now, off this path. Errors are logged.
            self.spawn_flush(session_id, worker_id, Duration::ZERO);
        } else if !g.flush_scheduled {
            g.flush_scheduled = true;
            self.spawn_flush(session_id, worker_id, self.inner.cfg.flush_interval);
        }
    }

    fn spawn_flush(&self, session_id: &str, worker_id: &str, delay: Duration) {
        let mgr = self.clone();
        let sid = session_id.to_string();
        let wid = worker_id.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = mgr.flush(&sid, &wid).await {
                tracing::warn!(session_id = %sid, worker_id = %wid, error = %e, "scrollback flush failed");
            }
        });
    }

    /// Persist pending bytes. A crash mid-append may lose the in-memory tail;
    /// the file itself is never left with a partial truncation.
    pub async fn flush(&self, session_id: &str, worker_id: &str) -> Result<(), CoreError> {
        let entry = self.entry(session_id, worker_id);
        let mut g = entry.lock().await;
        g.flush_scheduled = false;
        if g.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut g.pending);
        let path = self.log_path(session_id, worker_id);
        tokio::fs::create_dir_all(self.session_dir(session_id)).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&pending).await?;
        file.flush().await?;
        drop(file);

        let len = tokio::fs::metadata(&path).await?.len();
        if len > self.inner.cfg.max_file_size {
            self.truncate_to_tail(&path, len).await?;
        }
        Ok(())
    }

    /// Keep the newest ~80% of the cap, advanced forward to a UTF-8 codepoint
    /// boundary, written atomically via tmp-file + rename.
    async fn truncate_to_tail(&self, path: &PathBuf, len: u64) -> Result<(), CoreError> {
        let keep = self.inner.cfg.max_file_size * 8 / 10;
        let buf = tokio::fs::read(path).await?;
        let mut start = (len.saturating_sub(keep)) as usize;
        start = advance_to_char_boundary(&buf, start);
        let tmp = path.with_extension("log.tmp");
        tokio::fs::write(&tmp, &buf[start..]).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Drain every worker's pending buffer.
    pub async fn flush_all(&self) {
        let keys: Vec<Key> = self
            .inner
            .entries
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for (sid, wid) in keys {
            if let Err(e) = self.flush(&sid, &wid).await {
                tracing::warn!(session_id = %sid, worker_id = %wid, error = %e, "flush_all failed for worker");
            }
        }
    }

    /// Bytes `[from_offset, fileSize)`. A missing file with pending bytes
    /// yields the pending buffer; a brand-new worker yields empty history,
    /// never an error.
    pub async fn read_history_with_offset(
        &self,
        session_id: &str,
        worker_id: &str,
        from_offset: Option<u64>,
    ) -> Result<History, CoreError> {
        let entry = self.entry(session_id, worker_id);
        let g = entry.lock().await;
        let path = self.log_path(session_id, worker_id);
        let buf = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if g.pending.is_empty() {
                    return Ok(History::empty());
                }
                return Ok(History {
                    data: g.pending.clone(),
                    offset: g.pending.len() as u64,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let len = buf.len() as u64;
        let from = from_offset.unwrap_or(0).min(len) as usize;
        let from = advance_to_char_boundary(&buf, from);
        Ok(History {
            data: buf[from..].to_vec(),
            offset: len,
        })
    }

    /// Tail of file + pending buffer keeping the last `max_lines` lines; the
    /// empty line after a trailing terminator counts as a line.
    pub async fn read_last_n_lines(
        &self,
        session_id: &str,
        worker_id: &str,
        max_lines: usize,
    ) -> Result<History, CoreError> {
        let entry = self.entry(session_id, worker_id);
        let g = entry.lock().await;
        let path = self.log_path(session_id, worker_id);
        let file_buf = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if max_lines == 0 {
            return Ok(History {
                data: Vec::new(),
                offset: file_buf.len() as u64,
            });
        }
        let mut combined = file_buf;
        combined.extend_from_slice(&g.pending);
        let total = combined.len() as u64;
        let start = tail_line_start(&combined, max_lines);
        let start = advance_to_char_boundary(&combined, start);
        Ok(History {
            data: combined[start..].to_vec(),
            offset: total,
        })
    }

    /// Flushes first, then reports the file size (pending-buffer size when the
    /// flush could not produce a file).
    pub async fn get_current_offset(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<u64, CoreError> {
        self.flush(session_id, worker_id).await?;
        let path = self.log_path(session_id, worker_id);
        match tokio::fs::metadata(&path).await {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let entry = self.entry(session_id, worker_id);
                let g = entry.lock().await;
                Ok(g.pending.len() as u64)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create the directory and a zero-byte file so reader APIs succeed before
    /// any write.
    pub async fn initialize_worker_output(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(self.session_dir(session_id)).await?;
        let path = self.log_path(session_id, worker_id);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(())
    }

    /// Truncate the file and drop pending bytes. Used on agent restart so
    /// client caches cannot hold offsets past the new end of file.
    pub async fn reset_worker_output(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<(), CoreError> {
        let entry = self.entry(session_id, worker_id);
        let mut g = entry.lock().await;
        g.pending.clear();
        let path = self.log_path(session_id, worker_id);
        match tokio::fs::write(&path, b"").await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the worker's pending buffer and remove its file. Idempotent.
    pub async fn delete_worker_output(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<(), CoreError> {
        let key = (session_id.to_string(), worker_id.to_string());
        if let Some((_, entry)) = self.inner.entries.remove(&key) {
            let mut g = entry.lock().await;
            g.pending.clear();
            g.flush_scheduled = false;
        }
        let path = self.log_path(session_id, worker_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every worker buffer and the whole session output directory.
    pub async fn delete_session_outputs(&self, session_id: &str) -> Result<(), CoreError> {
        self.inner
            .entries
            .retain(|(sid, _), _| sid != session_id);
        match tokio::fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Advance `pos` forward past UTF-8 continuation bytes to the next codepoint
/// boundary (never backward). Positions at or past the end are returned as-is.
fn advance_to_char_boundary(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && (buf[pos] & 0xC0) == 0x80 {
        pos += 1;
    }
    pos
}

/// Start index of the tail keeping the last `max_lines` lines. The slice after
/// the final terminator counts as one (possibly empty) line.
fn tail_line_start(buf: &[u8], max_lines: usize) -> usize {
    let mut count = 0usize;
    for i in (0..buf.len()).rev() {
        if buf[i] == b'\n' {
            count += 1;
            if count == max_lines {
                return i + 1;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mgr_with(cfg: OutputConfig) -> (OutputFileManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (
            OutputFileManager::new(dir.path().join("outputs"), cfg),
            dir,
        )
    }

    fn mgr() -> (OutputFileManager, tempfile::TempDir) {
        mgr_with(OutputConfig::default())
    }

    #[tokio::test]
    async fn new_worker_presents_empty_history() {
        let (m, _dir) = mgr();
        let h = m.read_history_with_offset("s", "w", None).await.unwrap();
        assert_eq!(h, History::empty());
    }

    #[tokio::test]
    async fn initialized_worker_reads_before_any_write() {
        let (m, _dir) = mgr();
        m.initialize_worker_output("s", "w").await.unwrap();
        let h = m.read_history_with_offset("s", "w", None).await.unwrap();
        assert_eq!(h.offset, 0);
        assert!(h.data.is_empty());
    }

    #[tokio::test]
    async fn round_trip_from_offset() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"hello world").await;
        m.flush("s", "w").await.unwrap();
        let h = m.read_history_with_offset("s", "w", Some(6)).await.unwrap();
        assert_eq!(h.data, b"world");
        assert_eq!(h.offset, 11);
    }

    #[tokio::test]
    async fn multibyte_offset_slices_on_codepoint() {
        let (m, _dir) = mgr();
        // "A日🎉B" = 1 + 3 + 4 + 1 bytes
        m.buffer_output("s", "w", "A日🎉B".as_bytes()).await;
        m.flush("s", "w").await.unwrap();
        let h = m.read_history_with_offset("s", "w", Some(4)).await.unwrap();
        assert_eq!(h.data, "🎉B".as_bytes());
        assert_eq!(h.offset, 9);

        // Offset 3 into byte content lands exactly on 日's start.
        let h = m.read_history_with_offset("s", "w", Some(1)).await.unwrap();
        assert_eq!(h.data, "日🎉B".as_bytes());

        // Mid-codepoint offsets advance forward.
        let h = m.read_history_with_offset("s", "w", Some(2)).await.unwrap();
        assert_eq!(h.data, "🎉B".as_bytes());
    }

    #[tokio::test]
    async fn pending_buffer_serves_history_when_file_missing() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"pending!").await;
        let h = m.read_history_with_offset("s", "w", None).await.unwrap();
        assert_eq!(h.data, b"pending!");
        assert_eq!(h.offset, 8);
    }

    #[tokio::test]
    async fn truncation_keeps_tail_under_cap() {
        let cfg = OutputConfig {
            max_file_size: 1024,
            ..Default::default()
        };
        let (m, _dir) = mgr_with(cfg);
        m.buffer_output("s", "w", &vec![b'A'; 500]).await;
        m.flush("s", "w").await.unwrap();
        m.buffer_output("s", "w", &vec![b'B'; 600]).await;
        m.flush("s", "w").await.unwrap();

        let h = m.read_history_with_offset("s", "w", None).await.unwrap();
        assert!(h.data.len() as u64 <= 1024);
        assert!(h.data.ends_with(&vec![b'B'; 600]));
    }

    #[tokio::test]
    async fn truncation_lands_on_utf8_boundary() {
        let cfg = OutputConfig {
            max_file_size: 64,
            ..Default::default()
        };
        let (m, _dir) = mgr_with(cfg);
        let s = "日本語のテキストで埋める".repeat(4);
        m.buffer_output("s", "w", s.as_bytes()).await;
        m.flush("s", "w").await.unwrap();
        let h = m.read_history_with_offset("s", "w", None).await.unwrap();
        assert!(std::str::from_utf8(&h.data).is_ok());
        assert!(h.data.len() as u64 <= 64);
    }

    #[tokio::test]
    async fn last_n_lines_counts_trailing_empty_line() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"one\ntwo\nthree\n").await;
        m.flush("s", "w").await.unwrap();
        let h = m.read_last_n_lines("s", "w", 2).await.unwrap();
        assert_eq!(h.data, b"three\n");
        assert_eq!(h.offset, 14);

        let h = m.read_last_n_lines("s", "w", 4).await.unwrap();
        assert_eq!(h.data, b"two\nthree\n");
    }

    #[tokio::test]
    async fn last_n_lines_handles_crlf() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"a\r\nb\r\nc").await;
        m.flush("s", "w").await.unwrap();
        let h = m.read_last_n_lines("s", "w", 1).await.unwrap();
        assert_eq!(h.data, b"c");
    }

    #[tokio::test]
    async fn zero_lines_yields_empty_with_file_size_offset() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"abc\n").await;
        m.flush("s", "w").await.unwrap();
        let h = m.read_last_n_lines("s", "w", 0).await.unwrap();
        assert!(h.data.is_empty());
        assert_eq!(h.offset, 4);
    }

    #[tokio::test]
    async fn last_n_lines_includes_pending_tail() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"old\n").await;
        m.flush("s", "w").await.unwrap();
        m.buffer_output("s", "w", b"new").await;
        let h = m.read_last_n_lines("s", "w", 1).await.unwrap();
        assert_eq!(h.data, b"new");
        assert_eq!(h.offset, 7);
    }

    #[tokio::test]
    async fn current_offset_flushes_first() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"abcdef").await;
        let off = m.get_current_offset("s", "w").await.unwrap();
        assert_eq!(off, 6);
        // And the bytes really are on disk now.
        let h = m.read_history_with_offset("s", "w", None).await.unwrap();
        assert_eq!(h.data, b"abcdef");
    }

    #[tokio::test]
    async fn offset_is_monotonic_across_writes() {
        let (m, _dir) = mgr();
        let mut prev = 0;
        for chunk in [&b"ab"[..], b"cde", b"f"] {
            m.buffer_output("s", "w", chunk).await;
            let off = m.get_current_offset("s", "w").await.unwrap();
            assert!(off >= prev);
            prev = off;
        }
        assert_eq!(prev, 6);
    }

    #[tokio::test]
    async fn reset_truncates_file_and_pending() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"before").await;
        m.flush("s", "w").await.unwrap();
        m.buffer_output("s", "w", b"pending").await;
        m.reset_worker_output("s", "w").await.unwrap();
        assert_eq!(m.get_current_offset("s", "w").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_worker_output_is_idempotent() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w", b"x").await;
        m.flush("s", "w").await.unwrap();
        m.delete_worker_output("s", "w").await.unwrap();
        m.delete_worker_output("s", "w").await.unwrap();
        let h = m.read_history_with_offset("s", "w", None).await.unwrap();
        assert_eq!(h, History::empty());
    }

    #[tokio::test]
    async fn delete_session_outputs_removes_directory() {
        let (m, _dir) = mgr();
        m.buffer_output("s", "w1", b"x").await;
        m.buffer_output("s", "w2", b"y").await;
        m.flush_all().await;
        m.delete_session_outputs("s").await.unwrap();
        m.delete_session_outputs("s").await.unwrap();
        let h = m.read_history_with_offset("s", "w1", None).await.unwrap();
        assert_eq!(h, History::empty());
    }
}
