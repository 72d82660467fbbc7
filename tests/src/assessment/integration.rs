use std::sync::Arc;
use std::time::Duration;

use fortress_common::audit::{AuditPayload, RunId};
use fortress_common::lifecycle::{PluginState, RunState, StageKind, StageStatus};
use fortress_common::rate_limit::RateLimiter;
use fortress_core::{AttackOrchestrator, OrchestratorSettings, ReportFormat, RunPlan};
use fortress_plugins::PluginRegistry;

use crate::support::{self, LabScanner, ScriptedPlugin};

struct Bench {
    orchestrator: AttackOrchestrator,
    registry: Arc<PluginRegistry>,
    audit: Arc<fortress_core::AuditLog>,
    dir: tempfile::TempDir,
}

fn bench(plugins: Vec<Arc<ScriptedPlugin>>) -> Bench {
    let dir = tempfile::tempdir().unwrap();
    let audit = support::audit_log();
    let mapper = Arc::new(support::mapper(LabScanner::new(Duration::ZERO), audit.clone(), 3));
    let registry = Arc::new(PluginRegistry::new(
        support::registry_settings(&dir.path().join("plugins")),
        audit.clone(),
    ));
    for plugin in plugins {
        registry.register(plugin).unwrap();
    }

    let settings = OrchestratorSettings {
        grace_period: Duration::from_millis(100),
        max_exhausted_stages: 2,
        report_dir: dir.path().join("reports"),
        report_format: ReportFormat::Markdown,
        work_dir: dir.path().join("work"),
    };
    let orchestrator = AttackOrchestrator::new(
        mapper,
        registry.clone(),
        RateLimiter::new("attack", 20, Duration::from_secs(60)),
        audit.clone(),
        settings,
    );
    Bench {
        orchestrator,
        registry,
        audit,
        dir,
    }
}

#[test]
fn manifests_on_disk_load_and_invalid_ones_are_audited() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = |name: &str, stage: &str| {
        format!(
            "[plugin]\nname = \"{name}\"\ndescription = \"d\"\nversion = \"1.0\"\nauthor = \"a\"\nstages = [\"{stage}\"]\n\n[tool]\ncommand = \"true\"\n"
        )
    };
    std::fs::write(dir.path().join("capture.toml"), manifest("handshake", "capture")).unwrap();
    std::fs::write(dir.path().join("crack.toml"), manifest("wordlist", "crack")).unwrap();
    std::fs::write(dir.path().join("report.toml"), manifest("renderer", "report")).unwrap();

    let audit = support::audit_log();
    let registry = PluginRegistry::new(support::registry_settings(dir.path()), audit.clone());

    assert_eq!(registry.discover_plugins().len(), 3);
    assert_eq!(registry.load_all(), 2);
    assert_eq!(registry.state("handshake"), Some(PluginState::Loaded));
    assert_eq!(registry.state("renderer"), None);
    assert_eq!(registry.eligible(StageKind::Crack), vec!["wordlist".to_string()]);

    let invalid: Vec<_> = audit
        .events(RunId::system())
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.payload, AuditPayload::InvalidPlugin { .. }))
        .collect();
    assert_eq!(invalid.len(), 1);
}

#[tokio::test]
async fn failed_capture_skips_the_rest_but_still_reports() {
    let b = bench(vec![
        ScriptedPlugin::failing("deauth", StageKind::Capture),
        ScriptedPlugin::failing("pmkid", StageKind::Capture),
        ScriptedPlugin::succeeding("wordlist", StageKind::Crack),
    ]);
    let plan = RunPlan::full().with_interface("wlan0").with_network("192.168.7.0/24");

    let summary = b.orchestrator.execute(plan).await.unwrap();
    let run = &summary.run;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.status_of(StageKind::Scan), Some(StageStatus::Succeeded));
    assert_eq!(run.status_of(StageKind::Capture), Some(StageStatus::Failed));
    assert_eq!(run.status_of(StageKind::Crack), Some(StageStatus::Skipped));
    assert_eq!(run.status_of(StageKind::Mitm), Some(StageStatus::Skipped));
    assert_eq!(run.status_of(StageKind::Report), Some(StageStatus::Succeeded));
    assert_eq!(b.registry.state("wordlist"), Some(PluginState::Loaded));

    let report = std::fs::read_to_string(summary.report_path.unwrap()).unwrap();
    assert!(report.contains("Completed (partial — stages skipped: Crack, Mitm)"), "{report}");
    assert!(report.contains("guest"));

    // The rebuilt report agrees with what was written.
    let rebuilt = b.orchestrator.reports().build(run.id).unwrap();
    assert_eq!(rebuilt.stages_with(StageStatus::Failed), vec![StageKind::Capture]);
    assert_eq!(rebuilt.inventory.len(), 2);
}

#[tokio::test]
async fn single_stage_run_with_a_failing_plugin_still_completes() {
    let b = bench(vec![ScriptedPlugin::failing("deauth", StageKind::Capture)]);

    let summary = b.orchestrator.execute(RunPlan::single(StageKind::Capture)).await.unwrap();
    let run = &summary.run;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.stages.len(), 2);
    assert_eq!(run.status_of(StageKind::Capture), Some(StageStatus::Failed));
    assert_eq!(run.status_of(StageKind::Report), Some(StageStatus::Succeeded));
    assert_eq!(b.registry.state("deauth"), Some(PluginState::Failed));

    let path = summary.report_path.unwrap();
    assert!(path.starts_with(b.dir.path().join("reports")));
    assert!(path.to_string_lossy().ends_with(".md"));

    let runs = b.audit.runs().unwrap();
    assert!(runs.contains(&run.id));
}

#[tokio::test]
async fn scan_plan_without_network_is_rejected_before_anything_runs() {
    let b = bench(Vec::new());

    let result = b.orchestrator.execute(RunPlan::full().with_interface("wlan0")).await;

    assert!(result.is_err());
    assert!(b.audit.runs().unwrap().is_empty());
}
