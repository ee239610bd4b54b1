//! Durable FIFO job queue decoupling run submission from execution.
//!
//! Jobs live in the `jobs` table so a restart does not lose queued work.
//! Submission enqueues and returns immediately; exactly one worker drains
//! the queue serially. A `Notify` wakes the worker on enqueue, with a
//! short poll fallback covering jobs enqueued outside this process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;

use crate::db::DbHandle;

/// Poll fallback when no enqueue notification arrives.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a job for a run and wake the worker.
    pub async fn enqueue(&self, run_id: &str) -> Result<i64> {
        let run_id = run_id.to_string();
        let job_id = self.db.call(move |db| db.enqueue_job(&run_id)).await?;
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Claim the oldest queued job, or None when the queue is empty.
    pub async fn claim_next(&self) -> Result<Option<(i64, String)>> {
        self.db.call(|db| db.claim_next_job()).await
    }

    /// Best-effort removal of a not-yet-claimed job for a run. Returns
    /// false when the job already started (or never existed).
    pub async fn remove_queued(&self, run_id: &str) -> Result<bool> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.remove_queued_job(&run_id)).await
    }

    /// Drop a claimed job once processing finished (either way).
    pub async fn finish(&self, job_id: i64) -> Result<()> {
        self.db.call(move |db| db.finish_job(job_id)).await
    }

    /// Park until new work is likely available.
    pub async fn wait_for_work(&self) {
        let _ = tokio::time::timeout(IDLE_POLL, self.notify.notified()).await;
    }
}
