//! Six-phase workflow orchestration.
//!
//! A WorkflowSession drives a fixed sequence of phases, each delegating
//! one task to the scan engine and mining the analysis for findings. One
//! session runs at a time system-wide: admission is an atomic conditional
//! claim in the database, and every terminal session hands the slot to
//! the oldest queued session (poll-on-completion, no background
//! scheduler). A failure inside one phase becomes a finding and a failed
//! step while the sequence advances; the session itself only fails when
//! an error escapes the phase handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::Audit;
use crate::db::DbHandle;
use crate::engine::{EngineEvents, EngineReport, ScanEngine};
use crate::errors::{EngineError, VigilError};
use crate::events::EventHub;
use crate::extract;
use crate::models::*;

// ── Phase table ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    IntelligencePlanning,
    AutomatedScan,
    DeepReconnaissance,
    VulnerabilityScanning,
    ExploitationChainAnalysis,
    FinalReport,
}

impl WorkflowPhase {
    pub const ALL: [WorkflowPhase; 6] = [
        Self::IntelligencePlanning,
        Self::AutomatedScan,
        Self::DeepReconnaissance,
        Self::VulnerabilityScanning,
        Self::ExploitationChainAnalysis,
        Self::FinalReport,
    ];

    pub fn number(self) -> i32 {
        match self {
            Self::IntelligencePlanning => 1,
            Self::AutomatedScan => 2,
            Self::DeepReconnaissance => 3,
            Self::VulnerabilityScanning => 4,
            Self::ExploitationChainAnalysis => 5,
            Self::FinalReport => 6,
        }
    }

    pub fn from_number(n: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.number() == n)
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::IntelligencePlanning => "Intelligence Planning",
            Self::AutomatedScan => "Automated Scan",
            Self::DeepReconnaissance => "Deep Reconnaissance",
            Self::VulnerabilityScanning => "Vulnerability Scanning",
            Self::ExploitationChainAnalysis => "Exploitation Chain Analysis",
            Self::FinalReport => "Final Report",
        }
    }

    /// Transition table: phases advance in fixed order.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::IntelligencePlanning => Some(Self::AutomatedScan),
            Self::AutomatedScan => Some(Self::DeepReconnaissance),
            Self::DeepReconnaissance => Some(Self::VulnerabilityScanning),
            Self::VulnerabilityScanning => Some(Self::ExploitationChainAnalysis),
            Self::ExploitationChainAnalysis => Some(Self::FinalReport),
            Self::FinalReport => None,
        }
    }

    /// Task description handed to the engine for this phase.
    pub fn task(self, objective: Objective, target: &str) -> String {
        let approach = match objective {
            Objective::Quick => "Prefer fast, low-noise checks",
            Objective::Comprehensive => "Be exhaustive; cover every exposed surface",
            Objective::Stealth => "Minimize traffic and avoid detection",
            Objective::Aggressive => "Use intrusive checks where they yield signal",
        };
        let goal = match self {
            Self::IntelligencePlanning => {
                "Plan the engagement: enumerate known facts about the target and pick tooling"
            }
            Self::AutomatedScan => "Run broad automated scanning against the target",
            Self::DeepReconnaissance => {
                "Perform deep reconnaissance: services, versions, endpoints, entry points"
            }
            Self::VulnerabilityScanning => {
                "Scan discovered services for known vulnerabilities and misconfigurations"
            }
            Self::ExploitationChainAnalysis => {
                "Analyze how discovered weaknesses chain into viable attack paths"
            }
            Self::FinalReport => {
                "Summarize the engagement: consolidate findings, impact, and remediation"
            }
        };
        format!("{} for {}. {}.", goal, target, approach)
    }
}

/// Step names in phase order, used when materializing a session.
pub const STEP_NAMES: [&str; 6] = [
    "Intelligence Planning",
    "Automated Scan",
    "Deep Reconnaissance",
    "Vulnerability Scanning",
    "Exploitation Chain Analysis",
    "Final Report",
];

/// Per-invocation timeout by objective; intrusive profiles get longer.
fn objective_timeout(objective: Objective) -> Duration {
    match objective {
        Objective::Quick => Duration::from_secs(300),
        Objective::Aggressive => Duration::from_secs(600),
        Objective::Stealth => Duration::from_secs(900),
        Objective::Comprehensive => Duration::from_secs(1200),
    }
}

const GENERIC_REMEDIATION: &str =
    "Review the phase analysis and apply vendor hardening guidance.";
const GENERIC_EXPLOITATION: &str =
    "No exploitation path was confirmed; manual validation required.";
const GENERIC_VERIFICATION: &str = "Re-run the phase after remediation to verify.";

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_len)
        .last()
        .unwrap_or(0);
    let mut out = s[..cut].to_string();
    out.push_str("...");
    out
}

// ── Inputs and outputs ────────────────────────────────────────────────

pub struct CreateWorkflowInput {
    pub target: String,
    pub objective: Objective,
    pub max_steps: Option<i32>,
    pub name: Option<String>,
}

pub struct WorkflowCreated {
    pub session: WorkflowSession,
    pub steps: Vec<Step>,
    /// 0 when the session started immediately; otherwise the 1-based rank
    /// in the FIFO backlog. A position, not a guarantee.
    pub queue_position: i64,
}

// ── Event fanout ──────────────────────────────────────────────────────

/// Publishes engine callbacks to both the session channel and the bound
/// run channel.
struct PhaseSink {
    hub: EventHub,
    session_id: String,
    run_id: String,
}

impl PhaseSink {
    fn emit(&self, kind: StreamEventType, payload: serde_json::Value) {
        self.hub.emit(&self.session_id, kind, payload.clone());
        self.hub.emit(&self.run_id, kind, payload);
    }
}

#[async_trait]
impl EngineEvents for PhaseSink {
    async fn on_output(&self, chunk: &str) {
        self.emit(StreamEventType::Output, serde_json::json!({"chunk": chunk}));
    }

    async fn on_tool_start(&self, name: &str, params: &serde_json::Value) {
        self.emit(
            StreamEventType::ToolStart,
            serde_json::json!({"name": name, "params": params}),
        );
    }

    async fn on_tool_complete(&self, name: &str, exit_code: i32, duration_ms: u64) {
        self.emit(
            StreamEventType::ToolComplete,
            serde_json::json!({"name": name, "exit_code": exit_code, "duration_ms": duration_ms}),
        );
    }

    async fn on_progress(&self, percent: u8, message: &str) {
        self.emit(
            StreamEventType::Progress,
            serde_json::json!({"percent": percent, "message": message}),
        );
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WorkflowOrchestrator {
    db: DbHandle,
    hub: EventHub,
    engine: Arc<dyn ScanEngine>,
    audit: Audit,
}

impl WorkflowOrchestrator {
    pub fn new(db: DbHandle, hub: EventHub, engine: Arc<dyn ScanEngine>, audit: Audit) -> Self {
        Self {
            db,
            hub,
            engine,
            audit,
        }
    }

    /// Create a session with its six steps and bound run, then try to
    /// start it. When another session holds the slot the new one stays
    /// created and its backlog position is reported.
    pub async fn create(
        &self,
        user: &User,
        input: CreateWorkflowInput,
    ) -> Result<WorkflowCreated, VigilError> {
        let target = input.target.trim().to_string();
        if target.is_empty() {
            return Err(VigilError::Validation("target is required".into()));
        }
        let max_steps = input.max_steps.unwrap_or(STEP_NAMES.len() as i32);
        if max_steps < 1 {
            return Err(VigilError::Validation("max_steps must be positive".into()));
        }

        let run = Run {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            tool: format!("workflow:{}", input.objective),
            scope_id: None,
            target: target.clone(),
            params: serde_json::json!({"objective": input.objective}),
            status: RunStatus::Pending,
            exit_code: None,
            error: None,
            timeout_secs: objective_timeout(input.objective).as_secs(),
            created_at: now_ts(),
            started_at: None,
            completed_at: None,
        };
        let session = WorkflowSession {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            target,
            objective: input.objective,
            name: input
                .name
                .unwrap_or_else(|| format!("{} scan", input.objective)),
            status: SessionStatus::Created,
            current_phase: 0,
            progress: 0,
            risk_score: 0,
            max_steps,
            run_id: run.id.clone(),
            error: None,
            created_at: now_ts(),
            started_at: None,
            completed_at: None,
        };

        {
            let run = run.clone();
            let session = session.clone();
            self.db
                .call(move |db| {
                    db.insert_run(&run)?;
                    db.insert_session_with_steps(&session, &STEP_NAMES)
                })
                .await?;
        }
        self.audit.record(
            &user.id,
            "workflow.create",
            &session.id,
            Some(format!("target={} objective={}", session.target, session.objective)),
        );

        let queue_position = if self.try_start(&session.id).await? {
            0
        } else {
            let id = session.id.clone();
            self.db.call(move |db| db.created_session_rank(&id)).await?
        };

        let (session, steps) = self.load_session_steps(&session.id).await?;
        Ok(WorkflowCreated {
            session,
            steps,
            queue_position,
        })
    }

    /// Atomic admission: claim the single running slot, and on success
    /// start the bound run and spawn the phase driver.
    async fn try_start(&self, session_id: &str) -> Result<bool, VigilError> {
        let claimed = {
            let id = session_id.to_string();
            self.db.call(move |db| db.claim_session_slot(&id)).await?
        };
        if !claimed {
            return Ok(false);
        }

        let session = self.must_get(session_id).await?;
        {
            let run_id = session.run_id.clone();
            self.db
                .call(move |db| db.transition_run(&run_id, RunStatus::Running, None, None))
                .await?;
        }
        let payload =
            serde_json::json!({"target": session.target, "objective": session.objective});
        self.hub
            .emit(&session.id, StreamEventType::Init, payload.clone());
        self.hub.emit(&session.run_id, StreamEventType::Init, payload);

        info!(session_id, "workflow session started");
        let orchestrator = self.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            orchestrator.drive(&id).await;
        });
        Ok(true)
    }

    /// Phase driver loop. One task per running session; contains phase
    /// failures, fails the session only when an error escapes a phase
    /// handler, and always hands the slot onward afterwards.
    pub async fn drive(&self, session_id: &str) {
        let outcome = self.drive_phases(session_id).await;

        match outcome {
            Ok(()) => {
                let finished = self
                    .finish(session_id, SessionStatus::Completed, None)
                    .await;
                if let Err(e) = finished {
                    error!(session_id, "failed to finalize session: {:#}", e);
                }
            }
            Err(e) => {
                let message = format!("{}", e);
                error!(session_id, "workflow failed: {}", message);
                if let Err(e2) = self
                    .finish(session_id, SessionStatus::Failed, Some(&message))
                    .await
                {
                    error!(session_id, "failed to record session failure: {:#}", e2);
                }
            }
        }

        self.drain_next().await;
    }

    async fn drive_phases(&self, session_id: &str) -> Result<(), VigilError> {
        let session = self.must_get(session_id).await?;

        let mut phase = Some(WorkflowPhase::IntelligencePlanning);
        while let Some(current) = phase {
            if current.number() > session.max_steps {
                break;
            }
            // Cooperative cancellation: an in-flight phase cannot be
            // preempted, but the driver stops between phases.
            let live = self.must_get(session_id).await?;
            if live.status != SessionStatus::Running {
                return Ok(());
            }

            {
                let id = session_id.to_string();
                let n = current.number();
                let risk = live.risk_score;
                self.db
                    .call(move |db| {
                        db.update_session_progress(&id, n, progress_percent(n - 1), risk)
                    })
                    .await?;
            }
            self.emit_both(
                &session,
                StreamEventType::Progress,
                serde_json::json!({
                    "phase": current.number(),
                    "name": current.title(),
                    "percent": progress_percent(current.number() - 1),
                }),
            );

            self.run_phase(&session, current).await?;

            let risk = self.recompute_risk(session_id).await?;
            {
                let id = session_id.to_string();
                let n = current.number();
                self.db
                    .call(move |db| {
                        db.update_session_progress(&id, n, progress_percent(n), risk)
                    })
                    .await?;
            }

            phase = current.next();
        }
        Ok(())
    }

    /// Execute one phase with local failure containment: an engine error
    /// becomes a finding plus a failed step, and the sequence advances.
    /// Only infrastructure errors (the handler itself) propagate.
    async fn run_phase(
        &self,
        session: &WorkflowSession,
        phase: WorkflowPhase,
    ) -> Result<(), VigilError> {
        {
            let id = session.id.clone();
            let n = phase.number();
            self.db.call(move |db| db.start_step(&id, n)).await?;
        }

        let sink = PhaseSink {
            hub: self.hub.clone(),
            session_id: session.id.clone(),
            run_id: session.run_id.clone(),
        };
        let task = phase.task(session.objective, &session.target);
        let timeout = objective_timeout(session.objective);
        let params = serde_json::json!({"objective": session.objective, "phase": phase.number()});

        let result = tokio::time::timeout(
            timeout,
            self.engine
                .execute(&task, &session.target, &params, timeout, &sink),
        )
        .await;

        match result {
            Ok(Ok(report)) => {
                let (impact, remediation) = self.record_phase_report(session, phase, &report).await?;
                let id = session.id.clone();
                let n = phase.number();
                self.db
                    .call(move |db| {
                        db.complete_step(
                            &id,
                            n,
                            StepStatus::Completed,
                            None,
                            Some(&impact),
                            Some(&remediation),
                        )
                    })
                    .await?;
            }
            Ok(Err(e)) => {
                let timed_out = matches!(e, EngineError::Timeout { .. });
                let message = e.to_string();
                self.record_phase_error(session, phase, &message, timed_out)
                    .await?;
            }
            Err(_) => {
                let message = format!(
                    "{} exceeded the {}s phase timeout",
                    phase.title(),
                    timeout.as_secs()
                );
                self.record_phase_error(session, phase, &message, true).await?;
            }
        }
        Ok(())
    }

    /// Mine findings out of a phase report. Returns (impact, remediation)
    /// hints for the step record.
    async fn record_phase_report(
        &self,
        session: &WorkflowSession,
        phase: WorkflowPhase,
        report: &EngineReport,
    ) -> Result<(String, String), VigilError> {
        let severity = extract::classify_severity(&report.analysis);
        let remediation = extract::extract_section(&report.analysis, "remediation")
            .text_or(GENERIC_REMEDIATION)
            .to_string();
        let exploitation = extract::extract_section(&report.analysis, "exploitation")
            .text_or(GENERIC_EXPLOITATION)
            .to_string();
        let verification = extract::extract_section(&report.analysis, "verification")
            .text_or(GENERIC_VERIFICATION)
            .to_string();

        let mut findings = vec![Finding {
            id: Uuid::new_v4().to_string(),
            run_id: Some(session.run_id.clone()),
            session_id: Some(session.id.clone()),
            phase: Some(phase.number()),
            severity,
            title: format!("{}: {}", phase.title(), session.target),
            description: report.analysis.clone(),
            evidence: report
                .invocations
                .iter()
                .map(|inv| inv.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            remediation: remediation.clone(),
            exploitation,
            verification,
            created_at: now_ts(),
        }];

        for inv in &report.invocations {
            if extract::contains_alarm(&inv.stdout) {
                findings.push(Finding {
                    id: Uuid::new_v4().to_string(),
                    run_id: Some(session.run_id.clone()),
                    session_id: Some(session.id.clone()),
                    phase: Some(phase.number()),
                    severity: extract::classify_severity(&inv.stdout),
                    title: format!("{} flagged output from {}", phase.title(), inv.name),
                    description: format!(
                        "Sub-invocation '{}' produced output containing alarm keywords",
                        inv.name
                    ),
                    evidence: truncate(&inv.stdout, 2000),
                    remediation: GENERIC_REMEDIATION.to_string(),
                    exploitation: GENERIC_EXPLOITATION.to_string(),
                    verification: GENERIC_VERIFICATION.to_string(),
                    created_at: now_ts(),
                });
            }
        }

        {
            let findings = findings.clone();
            self.db
                .call(move |db| {
                    for finding in &findings {
                        db.insert_finding(finding)?;
                    }
                    Ok(())
                })
                .await?;
        }

        let impact = format!("{} severity signal in {}", severity, phase.title());
        Ok((impact, remediation))
    }

    /// Containment path: convert a phase failure into a finding and a
    /// failed (or timed-out) step.
    async fn record_phase_error(
        &self,
        session: &WorkflowSession,
        phase: WorkflowPhase,
        message: &str,
        timed_out: bool,
    ) -> Result<(), VigilError> {
        warn!(session_id = %session.id, phase = phase.number(), "phase failed: {}", message);
        let finding = Finding {
            id: Uuid::new_v4().to_string(),
            run_id: Some(session.run_id.clone()),
            session_id: Some(session.id.clone()),
            phase: Some(phase.number()),
            severity: if timed_out { Severity::Medium } else { Severity::Low },
            title: format!("{} did not complete", phase.title()),
            description: message.to_string(),
            evidence: String::new(),
            remediation: "Re-run the phase once the underlying error is addressed.".into(),
            exploitation: GENERIC_EXPLOITATION.into(),
            verification: GENERIC_VERIFICATION.into(),
            created_at: now_ts(),
        };
        {
            let finding = finding.clone();
            self.db.call(move |db| db.insert_finding(&finding)).await?;
        }
        let id = session.id.clone();
        let n = phase.number();
        let status = if timed_out {
            StepStatus::Timeout
        } else {
            StepStatus::Failed
        };
        let message = message.to_string();
        self.db
            .call(move |db| db.complete_step(&id, n, status, Some(&message), None, None))
            .await?;
        Ok(())
    }

    async fn recompute_risk(&self, session_id: &str) -> Result<i32, VigilError> {
        let id = session_id.to_string();
        let findings = self
            .db
            .call(move |db| db.list_findings_for_session(&id))
            .await?;
        let total: i32 = findings.iter().map(|f| f.severity.weight()).sum();
        Ok(total.min(100))
    }

    /// Terminal bookkeeping: guarded session + run transitions, terminal
    /// events on both channels.
    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<(), VigilError> {
        let session = self.must_get(session_id).await?;
        let finished = {
            let id = session_id.to_string();
            let error = error.map(String::from);
            self.db
                .call(move |db| db.finish_session(&id, status, error.as_deref()))
                .await?
        };
        if !finished {
            // Already terminal (e.g. cancelled under our feet).
            return Ok(());
        }

        let run_status = match status {
            SessionStatus::Completed => RunStatus::Completed,
            SessionStatus::Timeout => RunStatus::Timeout,
            SessionStatus::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        {
            let run_id = session.run_id.clone();
            let error = error.map(String::from);
            let exit_code = if status == SessionStatus::Completed {
                Some(0)
            } else {
                None
            };
            self.db
                .call(move |db| {
                    db.transition_run(&run_id, run_status, error.as_deref(), exit_code)
                })
                .await?;
        }

        let kind = if status == SessionStatus::Completed {
            StreamEventType::Completed
        } else {
            StreamEventType::Failed
        };
        self.emit_both(
            &session,
            kind,
            serde_json::json!({"status": status, "error": error}),
        );
        info!(session_id, status = %status, "workflow session finished");
        Ok(())
    }

    /// Poll-on-completion handoff: start the oldest queued session, if any.
    async fn drain_next(&self) {
        let next = self.db.call(|db| db.oldest_created_session()).await;
        match next {
            Ok(Some(session)) => match self.try_start(&session.id).await {
                Ok(true) => info!(session_id = %session.id, "drained next session from backlog"),
                Ok(false) => {}
                Err(e) => error!("failed to start queued session: {:#}", e),
            },
            Ok(None) => {}
            Err(e) => error!("backlog lookup failed: {:#}", e),
        }
    }

    /// Cancel a session: skip every unfinished step, cancel the session
    /// and its bound run, emit terminal events on both channels, and hand
    /// the slot onward.
    pub async fn cancel(&self, user: &User, session_id: &str) -> Result<SessionDetail, VigilError> {
        let session = self.load_owned(user, session_id).await?;
        if session.status.is_terminal() {
            return Err(VigilError::conflict(format!(
                "Workflow '{}' is already {}",
                session_id, session.status
            )));
        }

        {
            let id = session_id.to_string();
            let run_id = session.run_id.clone();
            self.db
                .call(move |db| {
                    db.skip_active_steps(&id)?;
                    db.finish_session(&id, SessionStatus::Cancelled, Some("Cancelled by user"))?;
                    db.transition_run(&run_id, RunStatus::Cancelled, Some("Cancelled by user"), None)?;
                    Ok(())
                })
                .await?;
        }
        self.emit_both(
            &session,
            StreamEventType::Failed,
            serde_json::json!({"status": "cancelled", "error": "Cancelled by user"}),
        );
        self.audit.record(&user.id, "workflow.cancel", session_id, None);

        self.drain_next().await;
        self.get(session_id).await
    }

    /// Delete a session and everything referencing it. Cancels first when
    /// still active; the removal itself is one transaction.
    pub async fn delete(&self, user: &User, session_id: &str) -> Result<(), VigilError> {
        let session = self.load_owned(user, session_id).await?;
        if !session.status.is_terminal() {
            self.cancel(user, session_id).await?;
        }

        let deleted = {
            let id = session_id.to_string();
            self.db
                .call(move |db| db.delete_session_cascade(&id))
                .await?
        };
        if !deleted {
            return Err(VigilError::not_found(format!(
                "Workflow '{}' not found",
                session_id
            )));
        }
        self.audit.record(&user.id, "workflow.delete", session_id, None);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionDetail, VigilError> {
        let id = session_id.to_string();
        let detail = self
            .db
            .call(move |db| {
                let Some(session) = db.get_session(&id)? else {
                    return Ok(None);
                };
                let steps = db.list_steps(&id)?;
                let findings = db.list_findings_for_session(&id)?;
                Ok(Some(SessionDetail {
                    session,
                    steps,
                    findings,
                }))
            })
            .await?;
        detail.ok_or_else(|| VigilError::not_found(format!("Workflow '{}' not found", session_id)))
    }

    pub async fn list(&self) -> Result<Vec<WorkflowSession>, VigilError> {
        Ok(self.db.call(|db| db.list_sessions()).await?)
    }

    fn emit_both(&self, session: &WorkflowSession, kind: StreamEventType, payload: serde_json::Value) {
        self.hub.emit(&session.id, kind, payload.clone());
        self.hub.emit(&session.run_id, kind, payload);
    }

    async fn must_get(&self, session_id: &str) -> Result<WorkflowSession, VigilError> {
        let id = session_id.to_string();
        self.db
            .call(move |db| db.get_session(&id))
            .await?
            .ok_or_else(|| VigilError::not_found(format!("Workflow '{}' not found", session_id)))
    }

    async fn load_owned(&self, user: &User, session_id: &str) -> Result<WorkflowSession, VigilError> {
        let session = self.must_get(session_id).await?;
        if !user.is_elevated() && session.user_id != user.id {
            return Err(VigilError::Forbidden(
                "Workflow belongs to another user".into(),
            ));
        }
        Ok(session)
    }

    async fn load_session_steps(
        &self,
        session_id: &str,
    ) -> Result<(WorkflowSession, Vec<Step>), VigilError> {
        let id = session_id.to_string();
        let pair = self
            .db
            .call(move |db| {
                let Some(session) = db.get_session(&id)? else {
                    return Ok(None);
                };
                let steps = db.list_steps(&id)?;
                Ok(Some((session, steps)))
            })
            .await?;
        pair.ok_or_else(|| VigilError::not_found(format!("Workflow '{}' not found", session_id)))
    }
}

/// Computed progress: completed phases over total phases, as a percent.
fn progress_percent(done: i32) -> i32 {
    let total = STEP_NAMES.len() as i32;
    (done.clamp(0, total) * 100) / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::VigilDb;
    use crate::engine::{MockEngine, ToolInvocation};

    fn analyst() -> User {
        User {
            id: "u1".into(),
            name: "analyst".into(),
            role: Role::User,
        }
    }

    fn orchestrator(engine: MockEngine) -> (WorkflowOrchestrator, DbHandle, EventHub) {
        let db = DbHandle::new(VigilDb::new_in_memory().unwrap());
        let hub = EventHub::new();
        let audit = Audit::new(db.clone());
        let orch = WorkflowOrchestrator::new(db.clone(), hub.clone(), Arc::new(engine), audit);
        (orch, db, hub)
    }

    fn phase_report(analysis: &str) -> EngineReport {
        EngineReport {
            analysis: analysis.into(),
            invocations: vec![],
            tokens_used: 5,
        }
    }

    fn quiet_engine() -> MockEngine {
        let engine = MockEngine::new();
        for _ in 0..6 {
            engine.push(crate::engine::ScriptedOutcome::Report {
                chunks: vec![],
                report: phase_report("Nothing of note."),
            });
        }
        engine
    }

    fn input(target: &str) -> CreateWorkflowInput {
        CreateWorkflowInput {
            target: target.into(),
            objective: Objective::Quick,
            max_steps: None,
            name: None,
        }
    }

    #[test]
    fn phase_table_is_fixed_and_ordered() {
        assert_eq!(WorkflowPhase::ALL.len(), 6);
        let mut phase = WorkflowPhase::IntelligencePlanning;
        let mut seen = vec![phase.number()];
        while let Some(next) = phase.next() {
            seen.push(next.number());
            phase = next;
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(WorkflowPhase::FinalReport.next(), None);
        assert_eq!(
            WorkflowPhase::from_number(4),
            Some(WorkflowPhase::VulnerabilityScanning)
        );
        assert_eq!(WorkflowPhase::from_number(7), None);
    }

    #[test]
    fn task_descriptions_mention_target_and_objective_approach() {
        let task = WorkflowPhase::AutomatedScan.task(Objective::Stealth, "10.0.0.5");
        assert!(task.contains("10.0.0.5"));
        assert!(task.contains("avoid detection"));
    }

    #[test]
    fn progress_is_completed_over_total() {
        assert_eq!(progress_percent(0), 0);
        assert_eq!(progress_percent(3), 50);
        assert_eq!(progress_percent(6), 100);
    }

    #[tokio::test]
    async fn create_materializes_six_steps_and_bound_run() {
        let (orch, db, _hub) = orchestrator(quiet_engine());
        let created = orch.create(&analyst(), input("10.0.0.5")).await.unwrap();

        assert_eq!(created.steps.len(), 6);
        assert_eq!(created.queue_position, 0);
        assert_eq!(created.steps[0].name, "Intelligence Planning");
        assert_eq!(created.steps[5].name, "Final Report");

        let guard = db.lock_sync().unwrap();
        let run = guard.get_run(&created.session.run_id).unwrap().unwrap();
        assert!(run.tool.starts_with("workflow:"));
    }

    #[tokio::test]
    async fn full_drive_completes_all_steps() {
        let (orch, _db, _hub) = orchestrator(quiet_engine());
        let created = orch.create(&analyst(), input("10.0.0.5")).await.unwrap();

        // The driver runs on a spawned task; wait for the terminal state.
        let detail = wait_terminal(&orch, &created.session.id).await;
        assert_eq!(detail.session.status, SessionStatus::Completed);
        assert_eq!(detail.session.progress, 100);
        assert!(detail.steps.iter().all(|s| s.status == StepStatus::Completed));
        // One finding per phase.
        assert_eq!(detail.findings.len(), 6);

        let guard = _db.lock_sync().unwrap();
        let run = guard.get_run(&detail.session.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.exit_code, Some(0));
    }

    async fn wait_terminal(orch: &WorkflowOrchestrator, session_id: &str) -> SessionDetail {
        for _ in 0..200 {
            let detail = orch.get(session_id).await.unwrap();
            if detail.session.status.is_terminal() {
                return detail;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached a terminal state");
    }

    #[tokio::test]
    async fn failed_phase_is_contained_and_sequence_advances() {
        let engine = MockEngine::new();
        engine.push(crate::engine::ScriptedOutcome::Fail {
            message: "planner crashed".into(),
        });
        for _ in 0..5 {
            engine.push(crate::engine::ScriptedOutcome::Report {
                chunks: vec![],
                report: phase_report("Nothing of note."),
            });
        }
        let (orch, _db, _hub) = orchestrator(engine);
        let created = orch.create(&analyst(), input("10.0.0.5")).await.unwrap();

        let detail = wait_terminal(&orch, &created.session.id).await;
        // The session still completes; only the first step failed.
        assert_eq!(detail.session.status, SessionStatus::Completed);
        assert_eq!(detail.steps[0].status, StepStatus::Failed);
        assert!(detail.steps[1..]
            .iter()
            .all(|s| s.status == StepStatus::Completed));
        // The failure produced a low-severity finding describing the error.
        let error_finding = detail
            .findings
            .iter()
            .find(|f| f.phase == Some(1))
            .unwrap();
        assert_eq!(error_finding.severity, Severity::Low);
        assert!(error_finding.description.contains("planner crashed"));
    }

    #[tokio::test]
    async fn alarm_output_yields_extra_findings_and_risk() {
        let engine = MockEngine::new();
        engine.push(crate::engine::ScriptedOutcome::Report {
            chunks: vec![],
            report: EngineReport {
                analysis: "Critical: SQL injection confirmed.\n\nRemediation: sanitize inputs\n".into(),
                invocations: vec![ToolInvocation {
                    name: "sqlmap".into(),
                    params: serde_json::json!({}),
                    stdout: "parameter 'id' is vulnerable".into(),
                    stderr: String::new(),
                    exit_code: 0,
                    duration_ms: 2000,
                }],
                tokens_used: 50,
            },
        });
        for _ in 0..5 {
            engine.push(crate::engine::ScriptedOutcome::Report {
                chunks: vec![],
                report: phase_report("Nothing of note."),
            });
        }
        let (orch, _db, _hub) = orchestrator(engine);
        let created = orch.create(&analyst(), input("10.0.0.5")).await.unwrap();

        let detail = wait_terminal(&orch, &created.session.id).await;
        // Phase finding + alarm finding for phase 1, plus one per later phase.
        assert_eq!(detail.findings.len(), 7);
        let phase_finding = detail
            .findings
            .iter()
            .find(|f| f.phase == Some(1) && f.title.starts_with("Intelligence Planning:"))
            .unwrap();
        assert_eq!(phase_finding.severity, Severity::Critical);
        assert_eq!(phase_finding.remediation, "sanitize inputs");
        assert!(detail.session.risk_score > 0);
    }

    #[tokio::test]
    async fn cancel_skips_unfinished_steps_and_frees_slot() {
        // First phase hangs so the session stays mid-flight.
        let engine = MockEngine::new();
        engine.push(crate::engine::ScriptedOutcome::Hang);
        let (orch, db, _hub) = orchestrator(engine);
        let created = orch.create(&analyst(), input("10.0.0.5")).await.unwrap();
        // Give the driver a beat to start phase 1.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let detail = orch.cancel(&analyst(), &created.session.id).await.unwrap();
        assert_eq!(detail.session.status, SessionStatus::Cancelled);
        assert!(detail
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Skipped));

        let guard = db.lock_sync().unwrap();
        let run = guard.get_run(&detail.session.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(guard.running_session_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_terminal_session_is_conflict() {
        let (orch, _db, _hub) = orchestrator(quiet_engine());
        let created = orch.create(&analyst(), input("10.0.0.5")).await.unwrap();
        wait_terminal(&orch, &created.session.id).await;

        let err = orch
            .cancel(&analyst(), &created.session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_leaves_no_rows_behind() {
        let (orch, db, _hub) = orchestrator(quiet_engine());
        let created = orch.create(&analyst(), input("10.0.0.5")).await.unwrap();
        wait_terminal(&orch, &created.session.id).await;

        orch.delete(&analyst(), &created.session.id).await.unwrap();

        let guard = db.lock_sync().unwrap();
        assert_eq!(
            guard
                .count_rows_referencing_session(&created.session.id, &created.session.run_id)
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn backlog_drains_in_fifo_order() {
        // Session 1 hangs; sessions 2 and 3 queue behind it.
        let engine = MockEngine::new();
        engine.push(crate::engine::ScriptedOutcome::Hang);
        let (orch, _db, _hub) = orchestrator(engine);

        let first = orch.create(&analyst(), input("10.0.0.1")).await.unwrap();
        let second = orch.create(&analyst(), input("10.0.0.2")).await.unwrap();
        let third = orch.create(&analyst(), input("10.0.0.3")).await.unwrap();
        assert_eq!(first.queue_position, 0);
        assert_eq!(second.queue_position, 1);
        assert_eq!(third.queue_position, 2);
        assert_eq!(second.session.status, SessionStatus::Created);

        // Cancelling the active session hands the slot to session 2.
        orch.cancel(&analyst(), &first.session.id).await.unwrap();
        let second_now = orch.get(&second.session.id).await.unwrap();
        assert_ne!(second_now.session.status, SessionStatus::Created);
        let third_now = orch.get(&third.session.id).await.unwrap();
        // Session 3 is still queued (or just started if 2 finished fast);
        // the invariant is it never started before session 2.
        let _ = third_now;
    }
}
