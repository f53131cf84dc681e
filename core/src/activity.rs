//! Agent activity detection from the raw PTY byte stream.
//!
//! Three detectors feed one state machine: a rate detector (chunk arrivals in
//! a sliding window), an idle detector (silence while active), and an asking
//! detector (agent-supplied regexes run over the ANSI-stripped tail of the
//! stream after a quiet debounce). The client's keystrokes feed a user-typing
//! signal that suppresses rate detection and resolves `asking`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::bytes::Regex;

/// Derived agent state, serialized lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Unknown,
    Active,
    Idle,
    Asking,
}

#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Sliding window for chunk-arrival timestamps.
    pub rate_window: Duration,
    /// Arrivals within the window that mean `active`.
    pub active_count_threshold: usize,
    /// Silence while `active` that means `idle`.
    pub no_output_idle: Duration,
    /// Quiet period before the asking patterns run.
    pub debounce: Duration,
    /// Rolling tail kept for asking matches.
    pub buffer_size: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_millis(2000),
            active_count_threshold: 20,
            no_output_idle: Duration::from_millis(2000),
            debounce: Duration::from_millis(300),
            buffer_size: 1000,
        }
    }
}

/// Only the newest bytes of the tail are matched against asking patterns.
const ASKING_SCAN_BYTES: usize = 500;
/// Keystroke silence that clears the user-typing signal.
const TYPING_CLEAR: Duration = Duration::from_secs(5);

/// CSI sequences plus the two-character escapes; OSC introducers fall in the
/// two-character class.
const ANSI_STRIP: &str = r"\x1B\[[0-?]*[ -/]*[@-~]|\x1B[@-Z\\-_]";

struct DetectorState {
    state: ActivityState,
    chunk_times: VecDeque<Instant>,
    tail: Vec<u8>,
    last_chunk_at: Option<Instant>,
    last_keystroke_at: Option<Instant>,
    user_typing: bool,
    rate_suppressed: bool,
    quiet_task_running: bool,
    idle_task_running: bool,
    typing_task_running: bool,
}

struct Inner {
    cfg: ActivityConfig,
    asking: Vec<Regex>,
    strip: Regex,
    state: Mutex<DetectorState>,
    /// Fired on every transition, in transition order (invoked under the state
    /// lock; must not block or call back into the detector).
    on_change: Box<dyn Fn(ActivityState) + Send + Sync>,
}

/// One detector per agent worker. Cheap to clone; timer tasks hold clones.
#[derive(Clone)]
pub struct ActivityDetector {
    inner: Arc<Inner>,
}

impl ActivityDetector {
    /// Build a detector with agent-supplied asking patterns. Patterns that do
    /// not compile are skipped with a warning.
    pub fn new(
        cfg: ActivityConfig,
        asking_patterns: &[String],
        on_change: impl Fn(ActivityState) + Send + Sync + 'static,
    ) -> Self {
        let asking = asking_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid asking pattern, skipping");
                    None
                }
            })
            .collect();
        let strip = Regex::new(ANSI_STRIP).expect("ansi strip regex");
        Self {
            inner: Arc::new(Inner {
                cfg,
                asking,
                strip,
                state: Mutex::new(DetectorState {
                    state: ActivityState::Unknown,
                    chunk_times: VecDeque::new(),
                    tail: Vec::new(),
                    last_chunk_at: None,
                    last_keystroke_at: None,
                    user_typing: false,
                    rate_suppressed: false,
                    quiet_task_running: false,
                    idle_task_running: false,
                    typing_task_running: false,
                }),
                on_change: Box::new(on_change),
            }),
        }
    }

    pub fn state(&self) -> ActivityState {
        self.lock().state
    }

    /// Feed one PTY output chunk. Never blocks on I/O; may schedule timer tasks.
    pub fn process_output(&self, bytes: &[u8]) {
        let now = Instant::now();
        let mut st = self.lock();
        st.last_chunk_at = Some(now);
        st.chunk_times.push_back(now);
        if let Some(horizon) = now.checked_sub(self.inner.cfg.rate_window) {
            while st.chunk_times.front().is_some_and(|t| *t < horizon) {
                st.chunk_times.pop_front();
            }
        }

        st.tail.extend_from_slice(bytes);
        if st.tail.len() > self.inner.cfg.buffer_size {
            let excess = st.tail.len() - self.inner.cfg.buffer_size;
            st.tail.drain(..excess);
        }

        if st.chunk_times.len() >= self.inner.cfg.active_count_threshold
            && !st.user_typing
            && !st.rate_suppressed
        {
            self.transition(&mut st, ActivityState::Active);
        }

        self.spawn_quiet_task(&mut st);
        if st.state == ActivityState::Active {
            self.spawn_idle_task(&mut st);
        }
    }

    /// Feed one client keystroke chunk. Enter resolves as submit, a bare ESC as
    /// cancel; anything else asserts the typing signal.
    pub fn note_user_input(&self, bytes: &[u8]) {
        let is_submit = bytes.contains(&b'\r') || bytes.contains(&b'\n');
        let is_cancel = bytes == [0x1b];
        let mut st = self.lock();
        if is_submit || is_cancel {
            st.user_typing = false;
            st.last_keystroke_at = None;
            if st.state == ActivityState::Asking {
                st.tail.clear();
                st.rate_suppressed = false;
                self.transition(&mut st, ActivityState::Idle);
            }
        } else {
            st.user_typing = true;
            st.last_keystroke_at = Some(Instant::now());
            self.spawn_typing_task(&mut st);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetectorState> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn transition(&self, st: &mut DetectorState, next: ActivityState) {
        if st.state != next {
            st.state = next;
            (self.inner.on_change)(next);
        }
    }

    /// Run the asking patterns over the stripped tail, as the quiet timer does.
    fn evaluate_asking(&self, st: &mut DetectorState) {
        if self.inner.asking.is_empty() || st.tail.is_empty() {
            return;
        }
        let start = st.tail.len().saturating_sub(ASKING_SCAN_BYTES);
        let scan = &st.tail[start..];
        let stripped = self.inner.strip.replace_all(scan, &b""[..]);
        if self.inner.asking.iter().any(|re| re.is_match(&stripped)) {
            st.chunk_times.clear();
            st.rate_suppressed = true;
            self.transition(st, ActivityState::Asking);
        }
    }

    /// Idle check, as the idle timer runs it once the silence deadline passes.
    fn evaluate_idle(&self, st: &mut DetectorState) {
        if st.state == ActivityState::Active {
            self.transition(st, ActivityState::Idle);
        }
    }

    fn spawn_quiet_task(&self, st: &mut DetectorState) {
        if self.inner.asking.is_empty() || st.quiet_task_running {
            return;
        }
        st.quiet_task_running = true;
        let det = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let mut st = det.lock();
                    let Some(last) = st.last_chunk_at else {
                        st.quiet_task_running = false;
                        return;
                    };
                    let deadline = last + det.inner.cfg.debounce;
                    let now = Instant::now();
                    if now >= deadline {
                        det.evaluate_asking(&mut st);
                        st.quiet_task_running = false;
                        return;
                    }
                    deadline - now
                };
                tokio::time::sleep(wait).await;
            }
        });
    }

    fn spawn_idle_task(&self, st: &mut DetectorState) {
        if st.idle_task_running {
            return;
        }
        st.idle_task_running = true;
        let det = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let mut st = det.lock();
                    if st.state != ActivityState::Active {
                        st.idle_task_running = false;
                        return;
                    }
                    let deadline = st.last_chunk_at.unwrap_or_else(Instant::now)
                        + det.inner.cfg.no_output_idle;
                    let now = Instant::now();
                    if now >= deadline {
                        det.evaluate_idle(&mut st);
                        st.idle_task_running = false;
                        return;
                    }
                    deadline - now
                };
                tokio::time::sleep(wait).await;
            }
        });
    }

    fn spawn_typing_task(&self, st: &mut DetectorState) {
        if st.typing_task_running {
            return;
        }
        st.typing_task_running = true;
        let det = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let mut st = det.lock();
                    if !st.user_typing {
                        st.typing_task_running = false;
                        return;
                    }
                    let deadline = st.last_keystroke_at.unwrap_or_else(Instant::now) + TYPING_CLEAR;
                    let now = Instant::now();
                    if now >= deadline {
                        st.user_typing = false;
                        st.typing_task_running = false;
                        return;
                    }
                    deadline - now
                };
                tokio::time::sleep(wait).await;
            }
        });
    }

    /// Test hook: run the asking evaluation immediately, skipping the debounce.
    #[cfg(test)]
    fn evaluate_asking_now(&self) {
        let mut st = self.lock();
        self.evaluate_asking(&mut st);
    }

    /// Test hook: run the idle evaluation immediately, skipping the silence wait.
    #[cfg(test)]
    fn evaluate_idle_now(&self) {
        let mut st = self.lock();
        self.evaluate_idle(&mut st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detector_with(patterns: &[&str]) -> (ActivityDetector, Arc<Mutex<Vec<ActivityState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        let det = ActivityDetector::new(ActivityConfig::default(), &patterns, move |s| {
            seen2.lock().unwrap().push(s);
        });
        (det, seen)
    }

    #[tokio::test]
    async fn rapid_chunks_turn_active() {
        let (det, seen) = detector_with(&[]);
        for _ in 0..20 {
            det.process_output(b"x");
        }
        assert_eq!(det.state(), ActivityState::Active);
        assert_eq!(seen.lock().unwrap().as_slice(), &[ActivityState::Active]);
    }

    #[tokio::test]
    async fn typing_suppresses_rate_detection() {
        let (det, _) = detector_with(&[]);
        det.note_user_input(b"a");
        for _ in 0..30 {
            det.process_output(b"x");
        }
        assert_eq!(det.state(), ActivityState::Unknown);
    }

    #[tokio::test]
    async fn idle_after_silence_while_active() {
        let (det, seen) = detector_with(&[]);
        for _ in 0..20 {
            det.process_output(b"x");
        }
        det.evaluate_idle_now();
        assert_eq!(det.state(), ActivityState::Idle);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[ActivityState::Active, ActivityState::Idle]
        );
    }

    #[tokio::test]
    async fn asking_pattern_matches_through_ansi_escapes() {
        let (det, _) = detector_with(&[r"Do you want to proceed\?"]);
        det.process_output(b"\x1b[1mDo you \x1b[32mwant to proceed?\x1b[0m (y/n)");
        det.evaluate_asking_now();
        assert_eq!(det.state(), ActivityState::Asking);
    }

    #[tokio::test]
    async fn asking_suppresses_rate_until_submit() {
        let (det, _) = detector_with(&["\\? \\(y/n\\)"]);
        det.process_output(b"continue? (y/n)");
        det.evaluate_asking_now();
        assert_eq!(det.state(), ActivityState::Asking);

        // Rapid output no longer flips to active while suppressed.
        for _ in 0..30 {
            det.process_output(b".");
        }
        assert_eq!(det.state(), ActivityState::Asking);

        // Submit resolves the question: buffer zeroed, suppression lifted, idle.
        det.note_user_input(b"y\r");
        assert_eq!(det.state(), ActivityState::Idle);
        for _ in 0..20 {
            det.process_output(b".");
        }
        assert_eq!(det.state(), ActivityState::Active);
    }

    #[tokio::test]
    async fn cancel_esc_resolves_asking() {
        let (det, _) = detector_with(&["\\(y/n\\)"]);
        det.process_output(b"ok? (y/n)");
        det.evaluate_asking_now();
        assert_eq!(det.state(), ActivityState::Asking);
        det.note_user_input(&[0x1b]);
        assert_eq!(det.state(), ActivityState::Idle);
    }

    #[tokio::test]
    async fn only_tail_bytes_are_scanned() {
        let (det, _) = detector_with(&["NEEDLE"]);
        // Push the needle out past the 500-byte scan window.
        det.process_output(b"NEEDLE");
        det.process_output(&vec![b'x'; 600]);
        det.evaluate_asking_now();
        assert_eq!(det.state(), ActivityState::Unknown);
    }

    #[tokio::test]
    async fn transitions_fire_in_order() {
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let det = ActivityDetector::new(ActivityConfig::default(), &[], move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..40 {
            det.process_output(b"x");
        }
        // One transition only: repeated active chunks do not re-fire.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
