//! Durable async jobs over the `jobs` table, chiefly deferred worker-output
//! cleanup. A worker loop claims pending jobs with an atomic status
//! transition, runs the registered handler, and retries failures with
//! exponential back-off until `max_attempts`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::{self, Db};
use crate::error::CoreError;
use crate::output::OutputFileManager;

pub const JOB_CLEANUP_WORKER_OUTPUT: &str = "CLEANUP_WORKER_OUTPUT";
pub const JOB_CLEANUP_SESSION_OUTPUTS: &str = "CLEANUP_SESSION_OUTPUTS";

const DEFAULT_MAX_ATTEMPTS: i64 = 3;
const BACKOFF_BASE_MS: i64 = 1000;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send>>;
pub type JobHandler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone)]
struct ClaimedJob {
    id: String,
    job_type: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
}

/// The queue handle. Clones share the handler table and store.
#[derive(Clone)]
pub struct JobQueue {
    db: Db,
    handlers: Arc<Mutex<HashMap<String, JobHandler>>>,
    poll_interval: Duration,
}

impl JobQueue {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn register_handler(&self, job_type: &str, handler: JobHandler) {
        self.handlers
            .lock()
            .unwrap()
            .insert(job_type.to_string(), handler);
    }

    /// Wire up the scrollback cleanup handlers.
    pub fn register_output_cleanup(&self, output: OutputFileManager) {
        let out = output.clone();
        self.register_handler(
            JOB_CLEANUP_WORKER_OUTPUT,
            Arc::new(move |payload| {
                let out = out.clone();
                Box::pin(async move {
                    let session_id = payload
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            CoreError::InvalidInput("cleanup payload missing sessionId".into())
                        })?
                        .to_string();
                    let worker_id = payload
                        .get("workerId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            CoreError::InvalidInput("cleanup payload missing workerId".into())
                        })?
                        .to_string();
                    out.delete_worker_output(&session_id, &worker_id).await
                })
            }),
        );
        self.register_handler(
            JOB_CLEANUP_SESSION_OUTPUTS,
            Arc::new(move |payload| {
                let out = output.clone();
                Box::pin(async move {
                    let session_id = payload
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            CoreError::InvalidInput("cleanup payload missing sessionId".into())
                        })?
                        .to_string();
                    out.delete_session_outputs(&session_id).await
                })
            }),
        );
    }

    /// Enqueue a job for the worker loop. Returns the job id.
    pub fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<String, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = db::now_rfc3339();
        self.db.with(|c| {
            c.execute(
                "INSERT INTO jobs (id, type, payload, status, priority, attempts, max_attempts, next_retry_at, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    job_type,
                    payload.to_string(),
                    priority,
                    DEFAULT_MAX_ATTEMPTS,
                    db::now_millis(),
                    now,
                ],
            )
        })?;
        Ok(id)
    }

    /// Background worker loop; claims and runs jobs until the task is aborted.
    pub fn spawn_worker_loop(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                match queue.run_once().await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(queue.poll_interval).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "job queue poll failed");
                        tokio::time::sleep(queue.poll_interval).await;
                    }
                }
            }
        })
    }

    /// Claim and process at most one due job. Returns whether one ran.
    pub async fn run_once(&self) -> Result<bool, CoreError> {
        let Some(job) = self.claim_next()? else {
            return Ok(false);
        };
        let handler = self.handlers.lock().unwrap().get(&job.job_type).cloned();
        let Some(handler) = handler else {
            // Programmer error: a job type nobody registered. Fail fast.
            self.mark_failed(&job, "no handler registered for job type")?;
            tracing::error!(job_type = %job.job_type, job_id = %job.id, "unknown job type, marked failed");
            return Ok(true);
        };
        let payload: serde_json::Value =
            serde_json::from_str(&job.payload).unwrap_or(serde_json::Value::Null);
        match handler(payload).await {
            Ok(()) => {
                self.db.with(|c| {
                    c.execute(
                        "UPDATE jobs SET status = 'completed', completed_at = ?2 WHERE id = ?1",
                        rusqlite::params![job.id, db::now_rfc3339()],
                    )
                })?;
            }
            Err(e) => self.handle_failure(&job, &e.to_string())?,
        }
        Ok(true)
    }

    /// Atomic claim: flip one due pending row to running. The UPDATE is the
    /// row-level transition, so concurrent claimers cannot double-run a job.
    fn claim_next(&self) -> Result<Option<ClaimedJob>, CoreError> {
        let now_ms = db::now_millis();
        self.db.with(|c| {
            let candidate: Option<ClaimedJob> = {
                let mut stmt = c.prepare(
                    "SELECT id, type, payload, attempts, max_attempts FROM jobs
                     WHERE status = 'pending' AND next_retry_at <= ?1
                     ORDER BY priority DESC, next_retry_at ASC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![now_ms])?;
                match rows.next()? {
                    Some(row) => Some(ClaimedJob {
                        id: row.get(0)?,
                        job_type: row.get(1)?,
                        payload: row.get(2)?,
                        attempts: row.get(3)?,
                        max_attempts: row.get(4)?,
                    }),
                    None => None,
                }
            };
            let Some(job) = candidate else {
                return Ok(None);
            };
            let claimed = c.execute(
                "UPDATE jobs SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                rusqlite::params![job.id, db::now_rfc3339()],
            )?;
            Ok(if claimed == 1 { Some(job) } else { None })
        })
    }

    fn handle_failure(&self, job: &ClaimedJob, error: &str) -> Result<(), CoreError> {
        let attempts = job.attempts + 1;
        if attempts < job.max_attempts {
            let backoff_ms = BACKOFF_BASE_MS << (attempts - 1).min(16);
            let next = db::now_millis() + backoff_ms;
            tracing::warn!(job_id = %job.id, job_type = %job.job_type, attempts, error, "job failed, rescheduling");
            self.db.with(|c| {
                c.execute(
                    "UPDATE jobs SET status = 'pending', attempts = ?2, next_retry_at = ?3, last_error = ?4
                     WHERE id = ?1",
                    rusqlite::params![job.id, attempts, next, error],
                )
            })?;
        } else {
            tracing::error!(job_id = %job.id, job_type = %job.job_type, attempts, error, "job failed permanently");
            self.mark_failed_with_attempts(job, attempts, error)?;
        }
        Ok(())
    }

    fn mark_failed(&self, job: &ClaimedJob, error: &str) -> Result<(), CoreError> {
        self.mark_failed_with_attempts(job, job.attempts, error)
    }

    fn mark_failed_with_attempts(
        &self,
        job: &ClaimedJob,
        attempts: i64,
        error: &str,
    ) -> Result<(), CoreError> {
        self.db.with(|c| {
            c.execute(
                "UPDATE jobs SET status = 'failed', attempts = ?2, last_error = ?3, completed_at = ?4
                 WHERE id = ?1",
                rusqlite::params![job.id, attempts, error, db::now_rfc3339()],
            )
        })?;
        Ok(())
    }

    #[cfg(test)]
    fn job_status(&self, id: &str) -> (String, i64) {
        self.db
            .with(|c| {
                c.query_row(
                    "SELECT status, attempts FROM jobs WHERE id = ?1",
                    rusqlite::params![id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap()
    }

    #[cfg(test)]
    fn make_due_now(&self, id: &str) {
        self.db
            .with(|c| {
                c.execute(
                    "UPDATE jobs SET next_retry_at = 0 WHERE id = ?1",
                    rusqlite::params![id],
                )
            })
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn queue() -> JobQueue {
        JobQueue::new(Db::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn runs_registered_handler_to_completion() {
        let q = queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        q.register_handler(
            "NOOP",
            Arc::new(move |_| {
                let c = c2.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        let id = q.enqueue("NOOP", serde_json::json!({}), 0).unwrap();
        assert!(q.run_once().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.job_status(&id).0, "completed");
        assert!(!q.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn failure_retries_then_fails_permanently() {
        let q = queue();
        q.register_handler(
            "ALWAYS_FAILS",
            Arc::new(|_| Box::pin(async { Err(CoreError::InvalidInput("nope".into())) })),
        );
        let id = q.enqueue("ALWAYS_FAILS", serde_json::json!({}), 0).unwrap();

        assert!(q.run_once().await.unwrap());
        let (status, attempts) = q.job_status(&id);
        assert_eq!((status.as_str(), attempts), ("pending", 1));

        // Back-off pushes next_retry_at into the future; nothing due now.
        assert!(!q.run_once().await.unwrap());

        q.make_due_now(&id);
        assert!(q.run_once().await.unwrap());
        q.make_due_now(&id);
        assert!(q.run_once().await.unwrap());
        let (status, attempts) = q.job_status(&id);
        assert_eq!((status.as_str(), attempts), ("failed", 3));
    }

    #[tokio::test]
    async fn higher_priority_claims_first() {
        let q = queue();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o2 = order.clone();
        q.register_handler(
            "RECORD",
            Arc::new(move |payload| {
                let o = o2.clone();
                Box::pin(async move {
                    o.lock().unwrap().push(payload["tag"].as_str().unwrap().to_string());
                    Ok(())
                })
            }),
        );
        q.enqueue("RECORD", serde_json::json!({"tag": "low"}), 0).unwrap();
        q.enqueue("RECORD", serde_json::json!({"tag": "high"}), 10).unwrap();
        q.run_once().await.unwrap();
        q.run_once().await.unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), &["high", "low"]);
    }

    #[tokio::test]
    async fn unknown_job_type_fails_fast() {
        let q = queue();
        let id = q.enqueue("NOBODY_HOME", serde_json::json!({}), 0).unwrap();
        assert!(q.run_once().await.unwrap());
        assert_eq!(q.job_status(&id).0, "failed");
    }

    #[tokio::test]
    async fn cleanup_worker_output_deletes_scrollback() {
        let dir = tempdir().unwrap();
        let output = OutputFileManager::new(dir.path().join("outputs"), OutputConfig::default());
        output.buffer_output("s", "w", b"bytes").await;
        output.flush("s", "w").await.unwrap();

        let q = queue();
        q.register_output_cleanup(output.clone());
        q.enqueue(
            JOB_CLEANUP_WORKER_OUTPUT,
            serde_json::json!({"sessionId": "s", "workerId": "w"}),
            0,
        )
        .unwrap();
        assert!(q.run_once().await.unwrap());
        let h = output.read_history_with_offset("s", "w", None).await.unwrap();
        assert!(h.data.is_empty());
        assert_eq!(h.offset, 0);
    }
}
