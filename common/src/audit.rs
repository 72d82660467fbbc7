//! # Audit Event Model
//!
//! Every lifecycle transition in fortress is recorded as an [`AuditEvent`]
//! before it is considered committed. Components never talk to the
//! encrypted log directly; they hold an [`AuditSink`] and append payloads to
//! it. The sink assigns the per-run sequence number and the timestamp.
//!
//! Events that belong to no assessment run (plugin loading, continuous
//! scanning) are filed under [`RunId::system`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::findings::Finding;
use crate::lifecycle::{PluginState, RunState, StageKind, StageStatus};
use crate::network::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// A fresh, time-ordered run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The pseudo-run collecting events outside any assessment.
    pub const fn system() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_system(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            f.write_str("system")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "system" {
            return Ok(Self::system());
        }
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(Uuid);

impl StageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// How one plugin invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginOutcome {
    Succeeded,
    Failed,
    /// `initialize()` returned false; the plugin sat this run out.
    Declined,
    /// The action limiter refused the invocation.
    RateLimited,
    /// Cut short by run cancellation.
    Cancelled,
}

impl fmt::Display for PluginOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginOutcome::Succeeded => "succeeded",
            PluginOutcome::Failed => "failed",
            PluginOutcome::Declined => "declined",
            PluginOutcome::RateLimited => "rate limited",
            PluginOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    pub id: StageId,
    pub kind: StageKind,
}

/// What happened. Serialized inside the encrypted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditPayload {
    RunPlanned {
        stages: Vec<PlannedStage>,
        targets: Vec<Target>,
    },
    RunTransition {
        from: RunState,
        to: RunState,
        reason: Option<String>,
    },
    StageTransition {
        stage: StageKind,
        from: StageStatus,
        to: StageStatus,
    },
    PluginTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },
    PluginResult {
        plugin: String,
        stage: StageKind,
        outcome: PluginOutcome,
        detail: Option<String>,
        findings: Vec<Finding>,
    },
    InvalidPlugin {
        source: PathBuf,
        reason: String,
    },
    ScanCompleted {
        interface: String,
        network: String,
        targets: Vec<Target>,
    },
    ScanFailed {
        interface: String,
        network: String,
        reason: String,
    },
    ReportWritten {
        path: PathBuf,
    },
    /// Raised when the log itself lost an event.
    DegradedLogging {
        reason: String,
    },
    Note {
        message: String,
    },
}

impl AuditPayload {
    pub fn note(message: impl Into<String>) -> Self {
        AuditPayload::Note {
            message: message.into(),
        }
    }

    /// Short name used by operational logs and report listings.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditPayload::RunPlanned { .. } => "run_planned",
            AuditPayload::RunTransition { .. } => "run_transition",
            AuditPayload::StageTransition { .. } => "stage_transition",
            AuditPayload::PluginTransition { .. } => "plugin_transition",
            AuditPayload::PluginResult { .. } => "plugin_result",
            AuditPayload::InvalidPlugin { .. } => "invalid_plugin",
            AuditPayload::ScanCompleted { .. } => "scan_completed",
            AuditPayload::ScanFailed { .. } => "scan_failed",
            AuditPayload::ReportWritten { .. } => "report_written",
            AuditPayload::DegradedLogging { .. } => "degraded_logging",
            AuditPayload::Note { .. } => "note",
        }
    }
}

impl fmt::Display for AuditPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditPayload::RunPlanned { stages, targets } => write!(
                f,
                "run planned with {} stages and {} targets",
                stages.len(),
                targets.len()
            ),
            AuditPayload::RunTransition { from, to, reason } => {
                write!(f, "run {from} -> {to}")?;
                if let Some(reason) = reason {
                    write!(f, " ({reason})")?;
                }
                Ok(())
            }
            AuditPayload::StageTransition { stage, from, to } => {
                write!(f, "stage {stage} {from} -> {to}")
            }
            AuditPayload::PluginTransition { plugin, from, to } => {
                write!(f, "plugin {plugin} {from} -> {to}")
            }
            AuditPayload::PluginResult {
                plugin,
                stage,
                outcome,
                detail,
                ..
            } => {
                write!(f, "plugin {plugin} {outcome} in {stage}")?;
                if let Some(detail) = detail {
                    write!(f, ": {detail}")?;
                }
                Ok(())
            }
            AuditPayload::InvalidPlugin { source, reason } => {
                write!(f, "invalid plugin {}: {reason}", source.display())
            }
            AuditPayload::ScanCompleted {
                interface,
                network,
                targets,
            } => write!(
                f,
                "scan of {network} on {interface} found {} targets",
                targets.len()
            ),
            AuditPayload::ScanFailed {
                interface,
                network,
                reason,
            } => write!(f, "scan of {network} on {interface} failed: {reason}"),
            AuditPayload::ReportWritten { path } => {
                write!(f, "report written to {}", path.display())
            }
            AuditPayload::DegradedLogging { reason } => write!(f, "degraded logging: {reason}"),
            AuditPayload::Note { message } => f.write_str(message),
        }
    }
}

/// A decrypted audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub run_id: RunId,
    /// Starts at 1 and has no gaps within a run.
    pub seq: u64,
    pub stage_id: Option<StageId>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub payload: AuditPayload,
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The retry budget was spent and the event was not persisted.
    #[error("audit event for run {run_id} lost: {reason}")]
    Lost { run_id: RunId, reason: String },

    #[error("audit key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("audit record cipher failure")]
    Crypto,

    #[error("audit record {seq} of run {run_id} is corrupt: {reason}")]
    Corrupt {
        run_id: RunId,
        seq: u64,
        reason: String,
    },

    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuditError {
    /// Failures after which a run can no longer keep a trustworthy record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuditError::Lost { .. } | AuditError::KeyUnavailable(_))
    }
}

/// Anything that accepts audit events.
pub trait AuditSink: Send + Sync {
    /// Persists one event and returns its sequence number within `run_id`.
    fn append(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        severity: Severity,
        payload: AuditPayload,
    ) -> Result<u64, AuditError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_run_round_trips_through_display() {
        let system = RunId::system();
        assert_eq!(system.to_string(), "system");
        assert_eq!("system".parse::<RunId>().unwrap(), system);

        let run = RunId::new();
        assert!(!run.is_system());
        assert_eq!(run.to_string().parse::<RunId>().unwrap(), run);
    }

    #[test]
    fn payload_serializes_with_event_tag() {
        let payload = AuditPayload::StageTransition {
            stage: StageKind::Capture,
            from: StageStatus::Running,
            to: StageStatus::Failed,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"], "stage_transition");
        assert_eq!(json["stage"], "capture");
        assert_eq!(json["to"], "failed");
        assert_eq!(payload.to_string(), "stage Capture Running -> Failed");
    }

    #[test]
    fn only_lost_and_key_errors_are_fatal() {
        assert!(
            AuditError::Lost {
                run_id: RunId::new(),
                reason: "disk full".into()
            }
            .is_fatal()
        );
        assert!(AuditError::KeyUnavailable("empty".into()).is_fatal());
        assert!(!AuditError::WriteTimeout(Duration::from_millis(5)).is_fatal());
        assert!(!AuditError::Crypto.is_fatal());
    }
}
