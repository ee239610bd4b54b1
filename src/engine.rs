//! Seam to the external AI-assisted tool-invocation capability.
//!
//! The engine decides which low-level commands to run against a target
//! and returns free-text analysis plus a record of every sub-invocation.
//! It is a stateful singleton on the other side of the seam - the worker
//! runs at concurrency 1 and calls [`ScanEngine::reset`] between runs.
//!
//! Real implementation: `ProcessEngine` (spawns a configured command and
//! speaks a line-oriented JSON protocol on stdio). Test double:
//! `MockEngine` (scripted outcomes).

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::errors::EngineError;

/// One sub-invocation the engine performed on our behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Final result of an engine invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineReport {
    pub analysis: String,
    #[serde(default)]
    pub invocations: Vec<ToolInvocation>,
    #[serde(default)]
    pub tokens_used: u64,
}

impl EngineReport {
    /// Exit code derived from the sub-invocations: 0 unless any of them
    /// reported an error.
    pub fn exit_code(&self) -> i32 {
        if self.invocations.iter().any(|inv| inv.exit_code != 0) {
            1
        } else {
            0
        }
    }

    pub fn combined_stderr(&self) -> String {
        self.invocations
            .iter()
            .filter(|inv| !inv.stderr.is_empty())
            .map(|inv| format!("[{}] {}", inv.name, inv.stderr))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Callbacks fired while an invocation is in flight.
#[async_trait]
pub trait EngineEvents: Send + Sync {
    async fn on_output(&self, chunk: &str);
    async fn on_tool_start(&self, name: &str, params: &serde_json::Value);
    async fn on_tool_complete(&self, name: &str, exit_code: i32, duration_ms: u64);
    async fn on_progress(&self, percent: u8, message: &str);
}

/// Abstraction over scan execution for testability.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Run one task against a target, streaming events to `sink`.
    async fn execute(
        &self,
        task: &str,
        target: &str,
        params: &serde_json::Value,
        timeout: Duration,
        sink: &dyn EngineEvents,
    ) -> Result<EngineReport, EngineError>;

    /// Reset the shared backend so the next run starts clean. Callers
    /// treat failures as housekeeping noise, not run failures.
    async fn reset(&self) -> Result<()>;
}

// ── Line protocol ─────────────────────────────────────────────────────

/// Events from the engine process's line-oriented JSON stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Output {
        chunk: String,
    },
    ToolStart {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    ToolComplete {
        #[serde(flatten)]
        invocation: ToolInvocation,
    },
    Progress {
        #[serde(default)]
        percent: u8,
        #[serde(default)]
        message: String,
    },
    Report {
        #[serde(flatten)]
        report: EngineReport,
    },
}

/// Task payload written to the engine process's stdin.
#[derive(Debug, Serialize)]
struct WireTask<'a> {
    task: &'a str,
    target: &'a str,
    params: &'a serde_json::Value,
    timeout_secs: u64,
}

// ── Process engine ────────────────────────────────────────────────────

/// Engine implementation that shells out to a configured command.
pub struct ProcessEngine {
    command: String,
    args: Vec<String>,
}

impl ProcessEngine {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl ScanEngine for ProcessEngine {
    async fn execute(
        &self,
        task: &str,
        target: &str,
        params: &serde_json::Value,
        timeout: Duration,
        sink: &dyn EngineEvents,
    ) -> Result<EngineReport, EngineError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::SpawnFailed)?;

        // Hand the task over on stdin and close it so the engine knows
        // the request is complete.
        if let Some(mut stdin) = child.stdin.take() {
            let wire = WireTask {
                task,
                target,
                params,
                timeout_secs: timeout.as_secs(),
            };
            let payload =
                serde_json::to_string(&wire).context("Failed to serialize engine task")?;
            stdin
                .write_all(payload.as_bytes())
                .await
                .context("Failed to write engine task")?;
            stdin
                .write_all(b"\n")
                .await
                .context("Failed to terminate engine task line")?;
        }

        let stdout = child
            .stdout
            .take()
            .context("Engine process has no stdout")?;

        let drive = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut invocations: Vec<ToolInvocation> = Vec::new();
            let mut report: Option<EngineReport> = None;

            while let Some(line) = lines.next_line().await.context("Failed to read engine output")? {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireEvent>(trimmed) {
                    Ok(WireEvent::Output { chunk }) => sink.on_output(&chunk).await,
                    Ok(WireEvent::ToolStart { name, params }) => {
                        sink.on_tool_start(&name, &params).await
                    }
                    Ok(WireEvent::ToolComplete { invocation }) => {
                        sink.on_tool_complete(
                            &invocation.name,
                            invocation.exit_code,
                            invocation.duration_ms,
                        )
                        .await;
                        invocations.push(invocation);
                    }
                    Ok(WireEvent::Progress { percent, message }) => {
                        sink.on_progress(percent, &message).await
                    }
                    Ok(WireEvent::Report { report: r }) => report = Some(r),
                    Err(_) => {
                        // Not protocol JSON; treat the raw line as output.
                        sink.on_output(trimmed).await;
                    }
                }
            }

            let status = child.wait().await.context("Failed to wait for engine")?;
            if !status.success() {
                let mut stderr_text = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = stderr.read_to_string(&mut stderr_text).await;
                }
                return Err(EngineError::NonZeroExit {
                    exit_code: status.code().unwrap_or(-1),
                    stderr: stderr_text.trim().to_string(),
                });
            }

            let mut report = report.ok_or(EngineError::MissingReport)?;
            if report.invocations.is_empty() {
                report.invocations = invocations;
            }
            Ok(report)
        };

        match tokio::time::timeout(timeout, drive).await {
            Ok(result) => result,
            Err(_) => {
                debug!("engine invocation exceeded {}s, killing", timeout.as_secs());
                // kill_on_drop covers the child when this future is
                // dropped; an explicit kill keeps the error path tidy.
                Err(EngineError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    async fn reset(&self) -> Result<()> {
        let status = Command::new(&self.command)
            .args(&self.args)
            .arg("--reset")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("Failed to spawn engine reset")?;
        if !status.success() {
            anyhow::bail!("Engine reset exited with {:?}", status.code());
        }
        Ok(())
    }
}

// ── Mock engine ───────────────────────────────────────────────────────

/// One scripted outcome for the mock engine.
pub enum ScriptedOutcome {
    /// Emit the chunks as output events, then return the report.
    Report {
        chunks: Vec<String>,
        report: EngineReport,
    },
    /// Fail with the given message.
    Fail { message: String },
    /// Never return; drives the caller's timeout path.
    Hang,
}

/// Scripted engine for tests. Outcomes are consumed in order; once the
/// script is exhausted every call returns an empty successful report.
pub struct MockEngine {
    script: std::sync::Mutex<std::collections::VecDeque<ScriptedOutcome>>,
    pub tasks_seen: std::sync::Mutex<Vec<String>>,
    pub resets: std::sync::atomic::AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            tasks_seen: std::sync::Mutex::new(Vec::new()),
            resets: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn with_report(self, chunks: &[&str], report: EngineReport) -> Self {
        self.push(ScriptedOutcome::Report {
            chunks: chunks.iter().map(|s| s.to_string()).collect(),
            report,
        });
        self
    }

    pub fn with_failure(self, message: &str) -> Self {
        self.push(ScriptedOutcome::Fail {
            message: message.to_string(),
        });
        self
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanEngine for MockEngine {
    async fn execute(
        &self,
        task: &str,
        _target: &str,
        _params: &serde_json::Value,
        _timeout: Duration,
        sink: &dyn EngineEvents,
    ) -> Result<EngineReport, EngineError> {
        self.tasks_seen.lock().unwrap().push(task.to_string());
        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            Some(ScriptedOutcome::Report { chunks, report }) => {
                for (i, inv) in report.invocations.iter().enumerate() {
                    sink.on_tool_start(&inv.name, &inv.params).await;
                    if let Some(chunk) = chunks.get(i) {
                        sink.on_output(chunk).await;
                    }
                    sink.on_tool_complete(&inv.name, inv.exit_code, inv.duration_ms)
                        .await;
                }
                for chunk in chunks.iter().skip(report.invocations.len()) {
                    sink.on_output(chunk).await;
                }
                sink.on_progress(100, "done").await;
                Ok(report)
            }
            Some(ScriptedOutcome::Fail { message }) => {
                Err(EngineError::Other(anyhow::anyhow!(message)))
            }
            Some(ScriptedOutcome::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(EngineReport::default()),
        }
    }

    async fn reset(&self) -> Result<()> {
        self.resets
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
