//! The single worker that drains the job queue.
//!
//! Concurrency is fixed at 1: the engine backend is a stateful singleton
//! that cannot safely interleave scans. Everything else in the system is
//! non-blocking; this loop is where the waiting happens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::db::DbHandle;
use crate::engine::{EngineEvents, EngineReport, ScanEngine};
use crate::errors::EngineError;
use crate::events::EventHub;
use crate::models::*;
use crate::queue::JobQueue;

/// Flush the stdout accumulator at least this often while output arrives.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// ... or once this many bytes have accumulated since the last flush.
const FLUSH_BYTES: usize = 1000;

/// Buffered stdout accumulator for one job. Bounds artifact write
/// amplification while staying near-real-time; lives only for the
/// duration of the job.
struct OutputBuffer {
    content: String,
    unflushed: usize,
    last_flush: Instant,
}

impl OutputBuffer {
    fn new() -> Self {
        Self {
            content: String::new(),
            unflushed: 0,
            last_flush: Instant::now(),
        }
    }

    /// Append a chunk; returns true when a flush is due.
    fn push(&mut self, chunk: &str) -> bool {
        self.content.push_str(chunk);
        self.content.push('\n');
        self.unflushed += chunk.len() + 1;
        self.unflushed >= FLUSH_BYTES || self.last_flush.elapsed() >= FLUSH_INTERVAL
    }

    fn mark_flushed(&mut self) {
        self.unflushed = 0;
        self.last_flush = Instant::now();
    }
}

/// EngineEvents sink bridging one job's callbacks to the event hub and
/// the buffered stdout artifact.
struct JobSink {
    db: DbHandle,
    hub: EventHub,
    run_id: String,
    buffer: Mutex<OutputBuffer>,
}

impl JobSink {
    fn new(db: DbHandle, hub: EventHub, run_id: String) -> Self {
        Self {
            db,
            hub,
            run_id,
            buffer: Mutex::new(OutputBuffer::new()),
        }
    }

    async fn flush_stdout(&self, content: String) {
        let run_id = self.run_id.clone();
        if let Err(e) = self
            .db
            .call(move |db| db.upsert_artifact(&run_id, ARTIFACT_STDOUT, &content).map(|_| ()))
            .await
        {
            warn!(run_id = %self.run_id, "stdout artifact flush failed: {:#}", e);
        }
    }

    /// Write whatever is buffered, regardless of thresholds.
    async fn final_flush(&self) -> String {
        let content = {
            let mut buffer = self.buffer.lock().await;
            buffer.mark_flushed();
            buffer.content.clone()
        };
        if !content.is_empty() {
            self.flush_stdout(content.clone()).await;
        }
        content
    }
}

#[async_trait]
impl EngineEvents for JobSink {
    async fn on_output(&self, chunk: &str) {
        let flush_due = {
            let mut buffer = self.buffer.lock().await;
            let due = buffer.push(chunk);
            if due {
                buffer.mark_flushed();
            }
            due.then(|| buffer.content.clone())
        };
        self.hub.emit(
            &self.run_id,
            StreamEventType::Output,
            serde_json::json!({"chunk": chunk}),
        );
        if let Some(content) = flush_due {
            self.flush_stdout(content).await;
        }
    }

    async fn on_tool_start(&self, name: &str, params: &serde_json::Value) {
        self.hub.emit(
            &self.run_id,
            StreamEventType::ToolStart,
            serde_json::json!({"name": name, "params": params}),
        );
    }

    async fn on_tool_complete(&self, name: &str, exit_code: i32, duration_ms: u64) {
        self.hub.emit(
            &self.run_id,
            StreamEventType::ToolComplete,
            serde_json::json!({"name": name, "exit_code": exit_code, "duration_ms": duration_ms}),
        );
    }

    async fn on_progress(&self, percent: u8, message: &str) {
        self.hub.emit(
            &self.run_id,
            StreamEventType::Progress,
            serde_json::json!({"percent": percent, "message": message}),
        );
    }
}

pub struct Worker {
    db: DbHandle,
    queue: JobQueue,
    hub: EventHub,
    engine: Arc<dyn ScanEngine>,
}

impl Worker {
    pub fn new(db: DbHandle, queue: JobQueue, hub: EventHub, engine: Arc<dyn ScanEngine>) -> Self {
        Self {
            db,
            queue,
            hub,
            engine,
        }
    }

    /// Start the drain loop. Exactly one of these runs per process.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("worker started");
            loop {
                match self.queue.claim_next().await {
                    Ok(Some((job_id, run_id))) => {
                        self.process_job(job_id, &run_id).await;
                    }
                    Ok(None) => self.queue.wait_for_work().await,
                    Err(e) => {
                        error!("queue claim failed: {:#}", e);
                        self.queue.wait_for_work().await;
                    }
                }
            }
        })
    }

    /// Process one claimed job end to end. All terminal transitions go
    /// through the guarded update, so completions racing a stop are
    /// idempotent no-ops.
    pub async fn process_job(&self, job_id: i64, run_id: &str) {
        let run = {
            let id = run_id.to_string();
            match self.db.call(move |db| db.get_run(&id)).await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    // Run deleted while queued.
                    let _ = self.queue.finish(job_id).await;
                    return;
                }
                Err(e) => {
                    error!(run_id, "failed to load run: {:#}", e);
                    let _ = self.queue.finish(job_id).await;
                    return;
                }
            }
        };

        let started = {
            let id = run_id.to_string();
            self.db
                .call(move |db| db.transition_run(&id, RunStatus::Running, None, None))
                .await
                .unwrap_or(false)
        };
        if !started {
            // Cancelled (or otherwise finished) while queued; drop the job.
            info!(run_id, "skipping job for non-pending run");
            let _ = self.queue.finish(job_id).await;
            return;
        }

        self.hub.emit(
            run_id,
            StreamEventType::Init,
            serde_json::json!({"tool": run.tool, "target": run.target}),
        );

        let sink = JobSink::new(self.db.clone(), self.hub.clone(), run_id.to_string());
        let timeout = Duration::from_secs(run.timeout_secs);
        let task = format!("Execute security tool '{}' against the target", run.tool);

        let result = tokio::time::timeout(
            timeout,
            self.engine
                .execute(&task, &run.target, &run.params, timeout, &sink),
        )
        .await;

        let stdout = sink.final_flush().await;

        match result {
            Ok(Ok(report)) => self.complete_run(run_id, &stdout, report).await,
            Ok(Err(EngineError::Timeout { seconds })) => {
                self.fail_run(
                    run_id,
                    RunStatus::Timeout,
                    &format!("Scan timed out after {}s", seconds),
                )
                .await;
            }
            Ok(Err(e)) => {
                self.fail_run(run_id, RunStatus::Failed, &format!("{:#}", anyhow::Error::from(e)))
                    .await;
            }
            Err(_) => {
                self.fail_run(
                    run_id,
                    RunStatus::Timeout,
                    &format!("Scan timed out after {}s", timeout.as_secs()),
                )
                .await;
            }
        }

        // The engine backend keeps session/cache state; reset it so the
        // next run starts clean. Failures here never block the queue.
        if let Err(e) = self.engine.reset().await {
            warn!("engine reset failed: {:#}", e);
        }

        let _ = self.queue.finish(job_id).await;
    }

    async fn complete_run(&self, run_id: &str, stdout: &str, report: EngineReport) {
        let exit_code = report.exit_code();
        let stderr = report.combined_stderr();
        let metadata = serde_json::json!({
            "invocations": report.invocations,
            "tokens_used": report.tokens_used,
        });

        {
            let id = run_id.to_string();
            let stdout = stdout.to_string();
            let analysis = report.analysis.clone();
            let metadata = metadata.to_string();
            let persisted = self
                .db
                .call(move |db| {
                    db.upsert_artifact(&id, ARTIFACT_STDOUT, &stdout)?;
                    if !stderr.is_empty() {
                        db.upsert_artifact(&id, ARTIFACT_STDERR, &stderr)?;
                    }
                    db.upsert_artifact(&id, ARTIFACT_ANALYSIS, &analysis)?;
                    db.upsert_artifact(&id, ARTIFACT_TOOL_METADATA, &metadata)?;
                    Ok(())
                })
                .await;
            if let Err(e) = persisted {
                error!(run_id, "failed to persist artifacts: {:#}", e);
            }
        }

        let transitioned = {
            let id = run_id.to_string();
            self.db
                .call(move |db| db.transition_run(&id, RunStatus::Completed, None, Some(exit_code)))
                .await
                .unwrap_or(false)
        };
        if transitioned {
            self.hub.emit(
                run_id,
                StreamEventType::Completed,
                serde_json::json!({"exit_code": exit_code}),
            );
        }
    }

    async fn fail_run(&self, run_id: &str, status: RunStatus, message: &str) {
        let transitioned = {
            let id = run_id.to_string();
            let status_owned = status;
            let message_owned = message.to_string();
            self.db
                .call(move |db| db.transition_run(&id, status_owned, Some(&message_owned), None))
                .await
                .unwrap_or(false)
        };
        if transitioned {
            self.hub.emit(
                run_id,
                StreamEventType::Failed,
                serde_json::json!({"error": message, "status": status.as_str()}),
            );
        }
    }
}
