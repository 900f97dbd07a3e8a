//! Core job model: status state machine, log entries, build results.
//!
//! A `Job` is owned by the job store; the pipeline executor holds a working
//! copy and commits it back after every stage. Status transitions are
//! validated here so an illegal transition is a programming error surfaced
//! at the call site, not a corrupt row discovered later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of pipeline stages. Progress is derived from this.
pub const TOTAL_STEPS: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal edges: created→running, running→{completed,failed,cancelled},
    /// created→{failed,cancelled} (rejected or cancelled before a worker
    /// picked the job up). Nothing leaves a terminal state.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        match self {
            Self::Created => matches!(
                to,
                Self::Running | Self::Failed | Self::Cancelled
            ),
            Self::Running => to.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Per-job build switches, fixed at creation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    pub skip_drivers: bool,
    pub skip_updates: bool,
    pub skip_validation: bool,
}

/// Inbound build request, validated by the scheduler before a job exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub device: String,
    pub os_id: u32,
    #[serde(flatten)]
    pub options: BuildOptions,
}

/// Outputs recorded when a job completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResults {
    pub export_path: String,
    pub export_name: String,
    pub export_size_bytes: u64,
    pub drivers_integrated: u32,
    pub updates_integrated: u32,
    pub payloads_staged: u32,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub device: String,
    pub os_id: u32,
    #[serde(flatten)]
    pub options: BuildOptions,
    pub status: JobStatus,
    pub step_number: u32,
    pub total_steps: u32,
    pub current_step: String,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub results: Option<BuildResults>,
}

impl Job {
    pub fn new(request: &BuildRequest) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            device: request.device.clone(),
            os_id: request.os_id,
            options: request.options,
            status: JobStatus::Created,
            step_number: 0,
            total_steps: TOTAL_STEPS,
            current_step: "Queued".to_string(),
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            results: None,
        }
    }

    /// Move to a new status, stamping `started_at`/`completed_at`.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition(to) {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }
        match to {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            _ if to.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Advance step bookkeeping. Progress is monotone by construction:
    /// stages run in order and the derived percentage never moves backwards.
    pub fn advance(&mut self, step_number: u32, label: &str) {
        debug_assert!(step_number > self.step_number && step_number <= self.total_steps);
        self.step_number = step_number;
        self.current_step = label.to_string();
        let pct = (step_number as f64 / self.total_steps as f64 * 100.0).round() as u8;
        if pct > self.progress {
            self.progress = pct;
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogCategory {
    System,
    Image,
    Driver,
    Update,
    Workflow,
    Job,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Image => "IMAGE",
            Self::Driver => "DRIVER",
            Self::Update => "UPDATE",
            Self::Workflow => "WORKFLOW",
            Self::Job => "JOB",
        }
    }
}

/// One observation emitted during execution. Append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(
        job_id: &str,
        level: LogLevel,
        category: LogCategory,
        component: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            level,
            category,
            component: component.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
