use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fortress_common::audit::{PlannedStage, RunId, StageId};
use fortress_common::error::{Error, Result};
use fortress_common::findings::{Artifact, Finding};
use fortress_common::lifecycle::{RunState, StageKind, StageStatus};
use fortress_common::network::target::Target;

/// What to execute: an ordered subset of the chain plus its inputs.
#[derive(Debug, Clone)]
pub struct RunPlan {
    stages: Vec<StageKind>,
    interface: Option<String>,
    network: Option<String>,
    targets: Vec<Target>,
}

impl RunPlan {
    /// Scan through Report.
    pub fn full() -> Self {
        Self::with_stages(StageKind::CHAIN.to_vec())
    }

    /// One stage followed by Report, so every run ends with a report.
    pub fn single(kind: StageKind) -> Self {
        let stages = if kind == StageKind::Report {
            vec![StageKind::Report]
        } else {
            vec![kind, StageKind::Report]
        };
        Self::with_stages(stages)
    }

    fn with_stages(stages: Vec<StageKind>) -> Self {
        Self {
            stages,
            interface: None,
            network: None,
            targets: Vec::new(),
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_network(mut self, network_cidr: impl Into<String>) -> Self {
        self.network = Some(network_cidr.into());
        self
    }

    /// Targets known before the run starts. Scan results are added to them.
    pub fn with_targets(mut self, targets: Vec<Target>) -> Self {
        self.targets = targets;
        self
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.stages.contains(&StageKind::Scan) {
            if self.interface.is_none() {
                return Err(Error::invalid_argument("interface", "a scan stage needs an interface"));
            }
            if self.network.is_none() {
                return Err(Error::invalid_argument("network_cidr", "a scan stage needs a network"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub kind: StageKind,
    pub status: StageStatus,
    /// Plugins picked for this stage when it started.
    pub plugins: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Live state of one assessment run, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub state: RunState,
    pub abort_reason: Option<String>,
    pub stages: Vec<Stage>,
    pub targets: Vec<Target>,
    pub artifacts: Vec<Artifact>,
    pub findings: Vec<Finding>,
}

impl Run {
    pub(super) fn planned(plan: &RunPlan) -> Self {
        Self {
            id: RunId::new(),
            state: RunState::Planned,
            abort_reason: None,
            stages: plan
                .stages
                .iter()
                .map(|&kind| Stage {
                    id: StageId::new(),
                    kind,
                    status: StageStatus::Pending,
                    plugins: Vec::new(),
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            targets: plan.targets.clone(),
            artifacts: Vec::new(),
            findings: Vec::new(),
        }
    }

    pub(super) fn planned_stages(&self) -> Vec<PlannedStage> {
        self.stages
            .iter()
            .map(|s| PlannedStage { id: s.id, kind: s.kind })
            .collect()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn status_of(&self, kind: StageKind) -> Option<StageStatus> {
        self.stage(kind).map(|s| s.status)
    }

    /// Adds targets, replacing records with the same address.
    pub(super) fn merge_targets(&mut self, found: &[Target]) {
        for target in found {
            match self.targets.iter_mut().find(|t| t.id == target.id) {
                Some(known) => known.observe(target),
                None => self.targets.push(target.clone()),
            }
        }
    }

    pub(super) fn record(&mut self, findings: &[Finding]) {
        for finding in findings {
            if let Some(artifact) = finding.as_artifact() {
                self.artifacts.push(artifact.clone());
            }
        }
        self.findings.extend(findings.iter().cloned());
    }
}

/// What [`execute`](super::AttackOrchestrator::execute) hands back.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: Run,
    /// The rendered report, if it could be written.
    pub report_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stage_plans_end_with_report() {
        assert_eq!(RunPlan::single(StageKind::Crack).stages(), &[StageKind::Crack, StageKind::Report]);
        assert_eq!(RunPlan::single(StageKind::Report).stages(), &[StageKind::Report]);
        assert_eq!(RunPlan::full().stages().len(), 5);
    }

    #[test]
    fn scanning_plans_need_interface_and_network() {
        assert!(matches!(
            RunPlan::full().validate(),
            Err(Error::InvalidArgument { name: "interface", .. })
        ));
        assert!(matches!(
            RunPlan::full().with_interface("wlan0").validate(),
            Err(Error::InvalidArgument { name: "network_cidr", .. })
        ));
        assert!(RunPlan::full().with_interface("wlan0").with_network("10.0.0.0/24").validate().is_ok());
        assert!(RunPlan::single(StageKind::Capture).validate().is_ok());
    }
}
