use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current UTC timestamp as an RFC 3339 string, the format used for every
/// timestamp column in the database.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Run ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One tool-invocation execution record with its own lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub user_id: String,
    pub tool: String,
    pub scope_id: Option<String>,
    pub target: String,
    pub params: serde_json::Value,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub timeout_secs: u64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A typed output blob attached to a Run. Content is upserted by name;
/// `size_bytes` is recomputed on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub run_id: String,
    pub name: String,
    pub content: String,
    pub size_bytes: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Artifact names written by the worker.
pub const ARTIFACT_STDOUT: &str = "stdout";
pub const ARTIFACT_STDERR: &str = "stderr";
pub const ARTIFACT_ANALYSIS: &str = "analysis";
pub const ARTIFACT_TOOL_METADATA: &str = "tool_metadata";

// ── Findings ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Contribution to a session's aggregate risk score.
    pub fn weight(&self) -> i32 {
        match self {
            Self::Info => 0,
            Self::Low => 10,
            Self::Medium => 25,
            Self::High => 50,
            Self::Critical => 80,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// A discovered issue. Owned by a Run, a WorkflowSession phase, or both
/// (phase findings reference the session and carry the phase number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub phase: Option<i32>,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub evidence: String,
    pub remediation: String,
    pub exploitation: String,
    pub verification: String,
    pub created_at: String,
}

// ── Workflow sessions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Quick,
    Comprehensive,
    Stealth,
    Aggressive,
}

impl Objective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Comprehensive => "comprehensive",
            Self::Stealth => "stealth",
            Self::Aggressive => "aggressive",
        }
    }
}

impl std::fmt::Display for Objective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Objective {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "comprehensive" => Ok(Self::Comprehensive),
            "stealth" => Ok(Self::Stealth),
            "aggressive" => Ok(Self::Aggressive),
            _ => Err(format!("Invalid objective: {}", s)),
        }
    }
}

/// A composite six-phase scan built from sequential steps, bound to one Run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: String,
    pub user_id: String,
    pub target: String,
    pub objective: Objective,
    pub name: String,
    pub status: SessionStatus,
    pub current_phase: i32,
    pub progress: i32,
    pub risk_score: i32,
    pub max_steps: i32,
    pub run_id: String,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Timeout,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// One phase instance within a WorkflowSession. Phase order is fixed; each
/// step transitions independently but only ever advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub session_id: String,
    pub phase: i32,
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub impact: Option<String>,
    pub remediation: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

// ── Catalog records (external CRUD, read-only here) ───────────────────

/// An authorization boundary: CIDR ranges plus exact or `*.suffix`
/// wildcard host patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub name: String,
    pub cidrs: Vec<String>,
    pub host_patterns: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub enabled: bool,
    pub manifest: Option<serde_json::Value>,
}

impl Tool {
    /// Per-tool default timeout from the manifest, if one is declared.
    pub fn default_timeout_secs(&self) -> Option<u64> {
        self.manifest
            .as_ref()?
            .get("default_timeout_secs")?
            .as_u64()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl User {
    /// Admins bypass scope authorization and ownership checks.
    pub fn is_elevated(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Stream events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Init,
    Output,
    ToolStart,
    ToolComplete,
    Progress,
    Completed,
    Failed,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Output => "output",
            Self::ToolStart => "tool_start",
            Self::ToolComplete => "tool_complete",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal events close the channel after the drain grace window.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral event distributed to channel observers. Never persisted
/// beyond the in-memory replay window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: StreamEventType,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

impl StreamEvent {
    pub fn new(channel: impl Into<String>, kind: StreamEventType, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            kind,
            payload,
            timestamp: now_ts(),
        }
    }
}

// ── Aggregate API views ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub artifacts: Vec<Artifact>,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: WorkflowSession,
    pub steps: Vec<Step>,
    pub findings: Vec<Finding>,
}
