//! # Attack Orchestrator
//!
//! Drives one run through its stages in chain order:
//!
//! ```text
//! Scan -> Capture -> Crack -> Mitm -> Report
//! ```
//!
//! Plugins within a stage run concurrently; stages never overlap. A failed
//! stage skips the stages after it, but Report always runs, so every run
//! leaves a report behind. The run is only aborted on cancellation, on
//! rate-limit exhaustion, or when the audit log itself gives out.
//!
//! **Architectural Note:**
//! Every run, stage and plugin transition is appended to the audit log
//! before it is applied and before observers hear about it. The report is
//! rebuilt from that log alone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fortress_common::audit::{AuditPayload, PluginOutcome, Severity, StageId};
use fortress_common::config::ConfigStore;
use fortress_common::error::{Error, Result};
use fortress_common::findings::Finding;
use fortress_common::lifecycle::{RunState, StageKind, StageStatus, Transition};
use fortress_common::rate_limit::RateLimiter;
use fortress_plugins::{PluginContext, PluginRegistry};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::mapper::NetworkMapper;
use crate::report::{ReportBuilder, ReportFormat};

mod observer;
mod run;
mod stage;

pub use observer::{ProgressEvent, ProgressObserver};
pub use run::{Run, RunPlan, RunSummary, Stage};

use stage::{PluginReport, StageTally};

/// Name under which the mapper's own sweep is reported in the Scan stage.
pub const MAPPER_CONTRIBUTOR: &str = "network-mapper";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Time cancelled plugins get to finish before being forced to Failed.
    pub grace_period: Duration,
    /// Consecutive rate-exhausted stages that abort a run. 0 disables.
    pub max_exhausted_stages: usize,
    pub report_dir: PathBuf,
    pub report_format: ReportFormat,
    /// Per-run scratch space handed to plugins.
    pub work_dir: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &ConfigStore) -> Result<Self> {
        let format: String = cfg.get_or("report.format", "markdown".to_string());
        Ok(Self {
            grace_period: cfg.get_secs("attack.grace_period", 10),
            max_exhausted_stages: cfg.get_or("attack.max_exhausted_stages", 2),
            report_dir: PathBuf::from(cfg.get_or("report.dir", "reports".to_string())),
            report_format: format.parse().map_err(|e| Error::Config(format!("report.format: {e}")))?,
            work_dir: PathBuf::from(cfg.get_or("attack.work_dir", "work".to_string())),
        })
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            max_exhausted_stages: 2,
            report_dir: PathBuf::from("reports"),
            report_format: ReportFormat::Markdown,
            work_dir: PathBuf::from("work"),
        }
    }
}

pub struct AttackOrchestrator {
    mapper: Arc<NetworkMapper>,
    registry: Arc<PluginRegistry>,
    limiter: RateLimiter,
    audit: Arc<AuditLog>,
    reports: ReportBuilder,
    settings: OrchestratorSettings,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl AttackOrchestrator {
    /// `limiter` guards plugin invocations; every invocation takes a slot.
    pub fn new(
        mapper: Arc<NetworkMapper>,
        registry: Arc<PluginRegistry>,
        limiter: RateLimiter,
        audit: Arc<AuditLog>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            mapper,
            registry,
            limiter,
            reports: ReportBuilder::new(audit.clone()),
            audit,
            settings,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn reports(&self) -> &ReportBuilder {
        &self.reports
    }

    /// Runs `plan` to a terminal state without a way to cancel it.
    pub async fn execute(&self, plan: RunPlan) -> Result<RunSummary> {
        let (_keep_open, cancel) = watch::channel(false);
        self.execute_with_cancel(plan, cancel).await
    }

    /// Runs `plan` until it is terminal or `cancel` reads true.
    ///
    /// Only an invalid plan is an error. Everything that goes wrong during
    /// the run ends up in the returned run's state and in the audit log.
    pub async fn execute_with_cancel(
        &self,
        plan: RunPlan,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        plan.validate()?;
        let mut run = run::Run::planned(&plan);
        info!(run_id = %run.id, stages = plan.stages().len(), "run planned");

        let mut report_path = None;
        if let Err(e) = self.drive(&mut run, &plan, &cancel, &mut report_path).await {
            error!(run_id = %run.id, error = %e, "run cannot continue");
            self.wind_down(&mut run, &e);
        }

        // The final rendering includes the terminal transition.
        if let Some(path) = self.render_report(&run) {
            report_path = Some(path);
        }

        info!(run_id = %run.id, state = %run.state, "run finished");
        Ok(RunSummary { run, report_path })
    }

    async fn drive(
        &self,
        run: &mut Run,
        plan: &RunPlan,
        cancel: &watch::Receiver<bool>,
        report_path: &mut Option<PathBuf>,
    ) -> Result<()> {
        self.audit.append(
            run.id,
            None,
            Severity::Info,
            AuditPayload::RunPlanned {
                stages: run.planned_stages(),
                targets: run.targets.clone(),
            },
        )?;
        self.registry.prepare_run(run.id)?;
        self.move_run(run, RunState::Active, None)?;

        if run.targets.is_empty() && !plan.stages().contains(&StageKind::Scan) {
            run.targets = self.mapper.active_targets();
        }

        // Set once the remaining non-report stages must be skipped.
        let mut halted: Option<String> = None;
        let mut abort: Option<String> = None;
        let mut exhausted_streak = 0usize;

        for index in 0..run.stages.len() {
            let kind = run.stages[index].kind;
            if kind == StageKind::Report {
                continue;
            }

            if abort.is_none() && *cancel.borrow() {
                abort = Some("cancelled".to_string());
            }
            if let Some(reason) = abort.as_ref().or(halted.as_ref()) {
                info!(stage = %kind, reason = %reason, "stage skipped");
                self.move_stage(run, index, StageStatus::Skipped)?;
                continue;
            }

            let tally = self.run_stage(run, index, plan, cancel).await?;

            if *cancel.borrow() {
                abort = Some("cancelled".to_string());
            } else if tally.exhausted() {
                exhausted_streak += 1;
                if self.settings.max_exhausted_stages > 0 && exhausted_streak >= self.settings.max_exhausted_stages {
                    warn!(stages = exhausted_streak, "action rate limit exhausted, aborting run");
                    abort = Some(format!("rate limit exhausted for {exhausted_streak} consecutive stages"));
                }
            } else {
                exhausted_streak = 0;
            }

            if run.stages[index].status == StageStatus::Failed && halted.is_none() {
                halted = Some(format!("{kind} failed"));
            }
        }

        for index in 0..run.stages.len() {
            if run.stages[index].kind == StageKind::Report {
                *report_path = self.run_report_stage(run, index)?;
            }
        }

        match abort {
            Some(reason) => self.move_run(run, RunState::Aborted, Some(reason))?,
            None => self.move_run(run, RunState::Completed, None)?,
        };
        Ok(())
    }

    async fn run_stage(
        &self,
        run: &mut Run,
        index: usize,
        plan: &RunPlan,
        cancel: &watch::Receiver<bool>,
    ) -> Result<StageTally> {
        let kind = run.stages[index].kind;
        let stage_id = run.stages[index].id;
        let plugins = self.registry.eligible(kind);
        run.stages[index].plugins = plugins.clone();
        self.move_stage(run, index, StageStatus::Running)?;

        let mut reports: Vec<PluginReport> = Vec::new();

        if kind == StageKind::Scan {
            let sweep = self.sweep(run, stage_id, plan).await?;
            for finding in &sweep.findings {
                if let Finding::DeviceInventory { targets } = finding {
                    run.merge_targets(targets);
                }
            }
            reports.push(sweep);
        }

        if !plugins.is_empty() {
            let ctx = PluginContext::new(run.id, kind, self.work_dir(run, kind), cancel.clone())
                .with_interface(plan.interface().map(str::to_string))
                .with_targets(run.targets.clone())
                .with_artifacts(run.artifacts.clone());
            reports.extend(self.run_plugins(stage_id, &plugins, ctx).await?);
        } else if kind != StageKind::Scan {
            info!(stage = %kind, "no eligible plugins");
        }

        self.publish(run.id, stage_id, kind, &reports)?;
        for report in &reports {
            run.record(&report.findings);
        }

        let tally = StageTally::of(&reports);
        self.move_stage(run, index, tally.status())?;
        Ok(tally)
    }

    /// The mapper's contribution to the Scan stage, reported like a plugin.
    /// It is guarded by the mapper's own scan limiter, not the action limiter.
    async fn sweep(&self, run: &Run, stage_id: StageId, plan: &RunPlan) -> Result<PluginReport> {
        let (Some(interface), Some(network)) = (plan.interface(), plan.network()) else {
            return Err(Error::invalid_argument("network_cidr", "a scan stage needs an interface and a network"));
        };

        let report = match self.mapper.scan_network_in(run.id, Some(stage_id), interface, network).await {
            Ok(targets) => PluginReport {
                plugin: MAPPER_CONTRIBUTOR.to_string(),
                outcome: PluginOutcome::Succeeded,
                detail: Some(format!("{} targets in {network}", targets.len())),
                findings: vec![Finding::DeviceInventory { targets }],
            },
            Err(e @ Error::Audit(_)) => return Err(e),
            Err(e) if e.is_rate_limited() => {
                PluginReport::new(MAPPER_CONTRIBUTOR, PluginOutcome::RateLimited, Some(e.to_string()))
            }
            Err(e) => PluginReport::new(MAPPER_CONTRIBUTOR, PluginOutcome::Failed, Some(e.to_string())),
        };
        Ok(report)
    }

    fn run_report_stage(&self, run: &mut Run, index: usize) -> Result<Option<PathBuf>> {
        let stage_id = run.stages[index].id;
        self.move_stage(run, index, StageStatus::Running)?;

        let written = self
            .reports
            .write(run.id, &self.settings.report_dir, self.settings.report_format);
        match written {
            Ok(path) => {
                self.audit.append(
                    run.id,
                    Some(stage_id),
                    Severity::Info,
                    AuditPayload::ReportWritten { path: path.clone() },
                )?;
                self.move_stage(run, index, StageStatus::Succeeded)?;
                Ok(Some(path))
            }
            Err(e @ Error::Audit(_)) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "report could not be written");
                self.audit.append(
                    run.id,
                    Some(stage_id),
                    Severity::Error,
                    AuditPayload::note(format!("report could not be written: {e}")),
                )?;
                self.move_stage(run, index, StageStatus::Failed)?;
                Ok(None)
            }
        }
    }

    /// Best-effort teardown after a fatal error: skip what is left and
    /// abort the run. Further audit failures are only logged.
    fn wind_down(&self, run: &mut Run, cause: &Error) {
        for index in 0..run.stages.len() {
            let status = run.stages[index].status;
            let to = if status == StageStatus::Pending {
                StageStatus::Skipped
            } else if status == StageStatus::Running {
                StageStatus::Failed
            } else {
                continue;
            };
            if let Err(e) = self.move_stage(run, index, to) {
                warn!(run_id = %run.id, error = %e, "could not record stage teardown");
            }
        }

        let reason = format!("unrecoverable: {cause}");
        let moved = if run.state.is_terminal() {
            Ok(Transition::Unchanged)
        } else {
            self.move_run(run, RunState::Aborted, Some(reason.clone()))
        };
        if let Err(e) = moved {
            warn!(run_id = %run.id, error = %e, "could not record run abort");
            run.abort_reason = Some(reason);
        }
    }

    fn render_report(&self, run: &Run) -> Option<PathBuf> {
        match self
            .reports
            .write(run.id, &self.settings.report_dir, self.settings.report_format)
        {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "final report could not be written");
                None
            }
        }
    }

    fn work_dir(&self, run: &Run, kind: StageKind) -> PathBuf {
        self.settings
            .work_dir
            .join(run.id.to_string())
            .join(kind.as_str().to_ascii_lowercase())
    }

    fn move_run(&self, run: &mut Run, to: RunState, reason: Option<String>) -> Result<Transition<RunState>> {
        let from = run.state;
        if from == to {
            return Ok(Transition::Unchanged);
        }
        if !from.can_move_to(to) {
            return Err(Error::IllegalTransition {
                subject: format!("run {}", run.id),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let severity = if to == RunState::Aborted {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.audit.append(
            run.id,
            None,
            severity,
            AuditPayload::RunTransition {
                from,
                to,
                reason: reason.clone(),
            },
        )?;

        run.state = to;
        if to == RunState::Aborted {
            run.abort_reason = reason;
        }
        self.notify(&ProgressEvent::Run {
            run_id: run.id,
            from,
            to,
        });
        Ok(Transition::Moved { from })
    }

    fn move_stage(&self, run: &mut Run, index: usize, to: StageStatus) -> Result<Transition<StageStatus>> {
        let run_id = run.id;
        let stage = &mut run.stages[index];
        let from = stage.status;
        if from == to {
            return Ok(Transition::Unchanged);
        }
        if !from.can_move_to(to) {
            return Err(Error::IllegalTransition {
                subject: format!("stage {}", stage.kind),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let severity = if to == StageStatus::Failed {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.audit.append(
            run_id,
            Some(stage.id),
            severity,
            AuditPayload::StageTransition {
                stage: stage.kind,
                from,
                to,
            },
        )?;

        stage.status = to;
        let now = Utc::now();
        if to == StageStatus::Running {
            stage.started_at = Some(now);
        } else if to.is_terminal() {
            stage.finished_at = Some(now);
        }
        let kind = stage.kind;
        self.notify(&ProgressEvent::Stage {
            run_id,
            stage: kind,
            from,
            to,
        });
        Ok(Transition::Moved { from })
    }

    fn notify(&self, event: &ProgressEvent) {
        for observer in &self.observers {
            observer.on_progress(event);
        }
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
