//! # Report Builder
//!
//! Rebuilds what a run did purely from its audit trail, so a report can be
//! produced at any time: while the run is active, after it completed, or
//! after the process died halfway through. Whatever the log holds is
//! rendered; stages that never finished are flagged and the document is
//! marked partial.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fortress_common::audit::{AuditError, AuditEvent, AuditPayload, RunId, Severity, StageId};
use fortress_common::error::{Error, Result};
use fortress_common::findings::{Artifact, Finding};
use fortress_common::lifecycle::{RunState, StageKind, StageStatus};
use fortress_common::network::target::{SecurityMode, Target};
use serde::Serialize;
use tracing::{debug, warn};

use crate::audit::AuditLog;

mod render;

/// More networks than this on one channel is reported as congestion.
const CHANNEL_CONGESTION: usize = 3;
const CREDENTIAL_PENALTY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Markdown => "md",
            ReportFormat::Json => "json",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            "json" => Ok(ReportFormat::Json),
            other => Err(Error::invalid_argument(
                "report_format",
                format!("unknown report format '{other}'"),
            )),
        }
    }
}

/// One audit event, flattened for display.
#[derive(Debug, Clone, Serialize)]
pub struct EventLine {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub kind: &'static str,
    pub message: String,
}

impl From<&AuditEvent> for EventLine {
    fn from(event: &AuditEvent) -> Self {
        Self {
            seq: event.seq,
            timestamp: event.timestamp,
            severity: event.severity,
            kind: event.payload.kind(),
            message: event.payload.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSection {
    pub kind: StageKind,
    pub id: StageId,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<EventLine>,
    pub findings: Vec<Finding>,
}

impl StageSection {
    fn planned(id: StageId, kind: StageKind) -> Self {
        Self {
            kind,
            id,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            events: Vec::new(),
            findings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialLine {
    pub plugin: String,
    pub stage: StageKind,
    pub target: String,
    pub credential_type: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SecurityScore {
    pub score: u32,
    pub grade: char,
}

impl SecurityScore {
    /// Starts from 100 and subtracts the risk of every inventoried network
    /// and a fixed penalty per recovered credential.
    pub fn assess(inventory: &[Target], credentials: usize) -> Self {
        let penalty: u32 = inventory.iter().map(|t| t.security.risk_penalty()).sum::<u32>()
            + CREDENTIAL_PENALTY.saturating_mul(credentials as u32);
        let score = 100u32.saturating_sub(penalty);
        let grade = if score >= 90 {
            'A'
        } else if score >= 80 {
            'B'
        } else if score >= 70 {
            'C'
        } else if score >= 60 {
            'D'
        } else {
            'F'
        };
        Self { score, grade }
    }
}

/// Everything known about one run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: RunId,
    /// `None` when the log holds no lifecycle event for the run.
    pub state: Option<RunState>,
    pub abort_reason: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<StageSection>,
    /// Events not tied to a planned stage.
    pub run_events: Vec<EventLine>,
    pub inventory: Vec<Target>,
    pub credentials: Vec<CredentialLine>,
    pub artifacts: Vec<Artifact>,
    pub security: SecurityScore,
    pub recommendations: Vec<String>,
    /// Records that could not be decrypted or parsed.
    pub unreadable: usize,
}

impl Report {
    /// Folds an event stream (in sequence order) into a report.
    pub fn from_events<I>(run_id: RunId, events: I) -> Self
    where
        I: IntoIterator<Item = std::result::Result<AuditEvent, AuditError>>,
    {
        let mut stages: Vec<StageSection> = Vec::new();
        let mut run_events = Vec::new();
        let mut state = None;
        let mut abort_reason = None;
        let mut inventory: BTreeMap<String, Target> = BTreeMap::new();
        let mut credentials = Vec::new();
        let mut artifacts = Vec::new();
        let mut unreadable = 0;

        for event in events {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(%run_id, error = %e, "unreadable audit record left out of report");
                    unreadable += 1;
                    continue;
                }
            };

            match &event.payload {
                AuditPayload::RunPlanned { stages: planned, targets } => {
                    stages = planned
                        .iter()
                        .map(|s| StageSection::planned(s.id, s.kind))
                        .collect();
                    merge_inventory(&mut inventory, targets);
                    if state.is_none() {
                        state = Some(RunState::Planned);
                    }
                }
                AuditPayload::RunTransition { to, reason, .. } => {
                    state = Some(*to);
                    if *to == RunState::Aborted {
                        abort_reason = reason.clone();
                    }
                }
                AuditPayload::ScanCompleted { targets, .. } => merge_inventory(&mut inventory, targets),
                AuditPayload::PluginResult {
                    plugin,
                    stage,
                    findings,
                    ..
                } => {
                    for finding in findings {
                        match finding {
                            Finding::DeviceInventory { targets } => merge_inventory(&mut inventory, targets),
                            Finding::Credential {
                                target,
                                credential_type,
                                detail,
                            } => credentials.push(CredentialLine {
                                plugin: plugin.clone(),
                                stage: *stage,
                                target: target.clone(),
                                credential_type: credential_type.clone(),
                                detail: detail.clone(),
                            }),
                            Finding::Artifact(artifact) => artifacts.push(artifact.clone()),
                            Finding::Note { .. } => {}
                        }
                    }
                }
                _ => {}
            }

            let section = event
                .stage_id
                .and_then(|id| stages.iter_mut().find(|s| s.id == id));
            let Some(section) = section else {
                run_events.push(EventLine::from(&event));
                continue;
            };

            match &event.payload {
                AuditPayload::StageTransition { to, .. } => {
                    section.status = *to;
                    if *to == StageStatus::Running {
                        section.started_at = Some(event.timestamp);
                    } else if to.is_terminal() {
                        section.finished_at = Some(event.timestamp);
                    }
                }
                AuditPayload::PluginResult { findings, .. } => {
                    section.findings.extend(findings.iter().cloned());
                }
                _ => {}
            }
            section.events.push(EventLine::from(&event));
        }

        let inventory: Vec<Target> = inventory.into_values().collect();
        let security = SecurityScore::assess(&inventory, credentials.len());
        let recommendations = recommendations(&inventory, credentials.len());

        Self {
            run_id,
            state,
            abort_reason,
            generated_at: Utc::now(),
            stages,
            run_events,
            inventory,
            credentials,
            artifacts,
            security,
            recommendations,
            unreadable,
        }
    }

    /// Complete means the run reached `Completed` with no stage skipped,
    /// failed or left unfinished.
    pub fn is_partial(&self) -> bool {
        self.state != Some(RunState::Completed)
            || self.stages.iter().any(|s| s.status != StageStatus::Succeeded)
    }

    pub fn stages_with(&self, status: StageStatus) -> Vec<StageKind> {
        self.stages
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.kind)
            .collect()
    }

    /// Headline status, e.g. `Completed (partial — stages skipped: Crack, Mitm)`.
    pub fn status_line(&self) -> String {
        let mut line = match self.state {
            Some(RunState::Completed) => "Completed".to_string(),
            Some(RunState::Aborted) => match &self.abort_reason {
                Some(reason) => format!("Aborted: {reason}"),
                None => "Aborted".to_string(),
            },
            Some(RunState::Planned | RunState::Active) => "Incomplete".to_string(),
            None => "Unknown run".to_string(),
        };

        let skipped = self.stages_with(StageStatus::Skipped);
        let unfinished: Vec<StageKind> = self
            .stages
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.kind)
            .collect();

        if self.is_partial() {
            let mut parts = Vec::new();
            if !skipped.is_empty() {
                parts.push(format!("stages skipped: {}", join_kinds(&skipped)));
            }
            if !unfinished.is_empty() {
                parts.push(format!("unfinished: {}", join_kinds(&unfinished)));
            }
            if parts.is_empty() {
                line.push_str(" (partial)");
            } else {
                line.push_str(&format!(" (partial — {})", parts.join("; ")));
            }
        }
        line
    }

    pub fn render(&self, format: ReportFormat) -> Result<String> {
        match format {
            ReportFormat::Markdown => Ok(render::markdown(self)),
            ReportFormat::Json => render::json(self),
        }
    }

    /// Renders into `<dir>/<run id>.<ext>`, replacing an earlier rendering.
    pub fn write_to(&self, dir: &Path, format: ReportFormat) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}", self.run_id, format.extension()));
        let tmp = path.with_extension(format!("{}.tmp", format.extension()));
        std::fs::write(&tmp, self.render(format)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "report written");
        Ok(path)
    }
}

pub(crate) fn join_kinds(kinds: &[StageKind]) -> String {
    kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
}

fn merge_inventory(inventory: &mut BTreeMap<String, Target>, targets: &[Target]) {
    for target in targets {
        inventory
            .entry(target.id.to_string())
            .and_modify(|known| known.observe(target))
            .or_insert_with(|| target.clone());
    }
}

fn recommendations(inventory: &[Target], credentials: usize) -> Vec<String> {
    let mut advice = Vec::new();

    for target in inventory {
        match target.security {
            SecurityMode::Wep => advice.push(format!(
                "{} still uses WEP; move it to WPA3 (WPA2 at minimum).",
                target.display_name()
            )),
            SecurityMode::Open => advice.push(format!(
                "{} is an open network; enable WPA2/WPA3 encryption.",
                target.display_name()
            )),
            _ => {}
        }
    }

    let mut per_channel: BTreeMap<u16, usize> = BTreeMap::new();
    for channel in inventory.iter().filter_map(|t| t.channel) {
        *per_channel.entry(channel).or_default() += 1;
    }
    for (channel, count) in per_channel {
        if count > CHANNEL_CONGESTION {
            advice.push(format!(
                "Channel {channel} is shared by {count} networks; spread access points across less congested channels."
            ));
        }
    }

    if credentials > 0 {
        advice.push(format!(
            "{credentials} credential(s) were recovered; rotate them and enforce stronger passphrases."
        ));
    }
    advice
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {}: {}", self.run_id, self.status_line())
    }
}

/// Builds reports from the audit log.
#[derive(Clone)]
pub struct ReportBuilder {
    audit: Arc<AuditLog>,
}

impl ReportBuilder {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }

    pub fn build(&self, run_id: RunId) -> std::result::Result<Report, AuditError> {
        let events = self.audit.read_run(run_id)?;
        Ok(Report::from_events(run_id, events))
    }

    pub fn write(&self, run_id: RunId, dir: &Path, format: ReportFormat) -> Result<PathBuf> {
        self.build(run_id)?.write_to(dir, format)
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
