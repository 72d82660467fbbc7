use std::collections::HashMap;
use std::sync::Arc;

use fortress_common::audit::{AuditPayload, PluginOutcome, RunId, Severity, StageId};
use fortress_common::error::{Error, Result};
use fortress_common::findings::Finding;
use fortress_common::lifecycle::{StageKind, StageStatus};
use fortress_plugins::{Invocation, PluginContext};
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::AttackOrchestrator;
use super::observer::ProgressEvent;

/// How one contributor to a stage ended.
#[derive(Debug, Clone)]
pub(super) struct PluginReport {
    pub plugin: String,
    pub outcome: PluginOutcome,
    pub detail: Option<String>,
    pub findings: Vec<Finding>,
}

impl PluginReport {
    pub(super) fn new(plugin: impl Into<String>, outcome: PluginOutcome, detail: Option<String>) -> Self {
        Self {
            plugin: plugin.into(),
            outcome,
            detail,
            findings: Vec::new(),
        }
    }
}

/// Outcome counts of a stage.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct StageTally {
    succeeded: usize,
    failed: usize,
    rate_limited: usize,
    total: usize,
}

impl StageTally {
    pub(super) fn of(reports: &[PluginReport]) -> Self {
        let mut tally = Self::default();
        for report in reports {
            tally.total += 1;
            match report.outcome {
                PluginOutcome::Succeeded => tally.succeeded += 1,
                PluginOutcome::Failed | PluginOutcome::Cancelled => tally.failed += 1,
                PluginOutcome::RateLimited => tally.rate_limited += 1,
                PluginOutcome::Declined => {}
            }
        }
        tally
    }

    /// One success is enough. Without any, a failure fails the stage and
    /// anything else (declines, refusals, nobody eligible) skips it.
    pub(super) fn status(&self) -> StageStatus {
        if self.succeeded > 0 {
            StageStatus::Succeeded
        } else if self.failed > 0 {
            StageStatus::Failed
        } else {
            StageStatus::Skipped
        }
    }

    /// Every contributor was refused by the action limiter.
    pub(super) fn exhausted(&self) -> bool {
        self.total > 0 && self.rate_limited == self.total
    }
}

impl AttackOrchestrator {
    /// Invokes `names` concurrently and waits for all of them.
    ///
    /// On cancellation, running plugins get `grace_period` to finish on
    /// their own; the rest are aborted and forced into `Failed`. Only audit
    /// failures are returned as errors.
    pub(super) async fn run_plugins(
        &self,
        stage_id: StageId,
        names: &[String],
        ctx: PluginContext,
    ) -> Result<Vec<PluginReport>> {
        let run_id = ctx.run_id;
        let mut reports = Vec::with_capacity(names.len());
        let mut tasks = JoinSet::new();
        let mut running: HashMap<task::Id, String> = HashMap::new();
        let cancel = ctx.cancel_receiver();
        let ctx = Arc::new(ctx);

        for name in names {
            if !self.limiter.allow_request() {
                debug!(plugin = %name, "action limiter refused invocation");
                reports.push(PluginReport::new(
                    name.as_str(),
                    PluginOutcome::RateLimited,
                    Some(format!("{} rate limit exceeded", self.limiter.name())),
                ));
                continue;
            }

            let registry = self.registry.clone();
            let ctx = ctx.clone();
            let plugin = name.clone();
            let handle = tasks.spawn(async move { registry.invoke(stage_id, &plugin, &ctx).await });
            running.insert(handle.id(), name.clone());
        }

        let cancelled = wait_for_cancel(cancel.clone());
        tokio::pin!(cancelled);
        let mut cancel_seen = *cancel.borrow();

        while !cancel_seen && !tasks.is_empty() {
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    if let Some(joined) = joined {
                        reports.push(self.settle(run_id, stage_id, &mut running, joined, false).await?);
                    }
                }
                () = &mut cancelled => cancel_seen = true,
            }
        }

        if cancel_seen && !tasks.is_empty() {
            let grace = self.settings.grace_period;
            warn!(stage = %ctx.stage, ?grace, pending = tasks.len(), "run cancelled, waiting for plugins to wind down");
            let deadline = Instant::now() + grace;
            while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
                reports.push(self.settle(run_id, stage_id, &mut running, joined, true).await?);
            }

            tasks.abort_all();
            while let Some(joined) = tasks.join_next_with_id().await {
                reports.push(self.settle(run_id, stage_id, &mut running, joined, true).await?);
            }
        }

        Ok(reports)
    }

    async fn settle(
        &self,
        run_id: RunId,
        stage_id: StageId,
        running: &mut HashMap<task::Id, String>,
        joined: std::result::Result<(task::Id, Result<Invocation>), JoinError>,
        cancelled: bool,
    ) -> Result<PluginReport> {
        let (id, result) = match joined {
            Ok(joined) => joined,
            Err(join_error) => {
                let name = running.remove(&join_error.id()).unwrap_or_default();
                let (outcome, detail) = if join_error.is_cancelled() {
                    (PluginOutcome::Cancelled, "abandoned after the grace period")
                } else {
                    (PluginOutcome::Failed, "plugin task panicked")
                };
                warn!(plugin = %name, detail, "plugin forced into failed state");
                self.registry.fail(run_id, Some(stage_id), &name).await?;
                return Ok(PluginReport::new(name, outcome, Some(detail.to_string())));
            }
        };

        let name = running.remove(&id).unwrap_or_default();
        let report = match result {
            Ok(Invocation::Completed(output)) => PluginReport {
                plugin: name,
                outcome: PluginOutcome::Succeeded,
                detail: output.summary,
                findings: output.findings,
            },
            Ok(Invocation::Declined) => PluginReport::new(name, PluginOutcome::Declined, None),
            Err(e @ Error::Audit(_)) => return Err(e),
            Err(e) => {
                let outcome = if cancelled {
                    PluginOutcome::Cancelled
                } else {
                    PluginOutcome::Failed
                };
                warn!(plugin = %name, error = %e, "plugin invocation failed");
                PluginReport::new(name, outcome, Some(e.to_string()))
            }
        };
        Ok(report)
    }

    /// Audits each report and tells the observers about it.
    pub(super) fn publish(
        &self,
        run_id: RunId,
        stage_id: StageId,
        stage: StageKind,
        reports: &[PluginReport],
    ) -> Result<()> {
        for report in reports {
            let severity = match report.outcome {
                PluginOutcome::Succeeded | PluginOutcome::Declined => Severity::Info,
                PluginOutcome::RateLimited | PluginOutcome::Cancelled => Severity::Warning,
                PluginOutcome::Failed => Severity::Error,
            };
            self.audit.append(
                run_id,
                Some(stage_id),
                severity,
                AuditPayload::PluginResult {
                    plugin: report.plugin.clone(),
                    stage,
                    outcome: report.outcome,
                    detail: report.detail.clone(),
                    findings: report.findings.clone(),
                },
            )?;
            info!(plugin = %report.plugin, %stage, outcome = %report.outcome, "plugin finished");
            self.notify(&ProgressEvent::Plugin {
                run_id,
                stage,
                plugin: report.plugin.clone(),
                outcome: report.outcome,
            });
        }
        Ok(())
    }
}

/// Resolves once `rx` reads true. A closed channel never cancels.
async fn wait_for_cancel(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
