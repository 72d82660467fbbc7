use std::sync::Arc;

use anyhow::Context;
use colored::*;
use fortress_common::lifecycle::{RunState, StageKind, StageStatus};
use fortress_common::network::interface::{find_interface, primary_ipv4_network, select_assessment_interface};
use fortress_core::RunPlan;
use pnet::datalink::NetworkInterface;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::app::App;
use crate::terminal::{colors, print, spinner};

pub async fn run(
    app: &mut App,
    interface: Option<String>,
    network: Option<String>,
    stage: Option<StageKind>,
) -> anyhow::Result<()> {
    let mut plan = match stage {
        Some(kind) => RunPlan::single(kind),
        None => RunPlan::full(),
    };
    if plan.stages().contains(&StageKind::Scan) {
        let (interface, network) = resolve_scan_inputs(interface, network)?;
        plan = plan.with_interface(interface).with_network(network);
    } else if let Some(interface) = interface {
        plan = plan.with_interface(interface);
    }

    if !is_root::is_root() {
        warn!("not running as root, most attack tools will decline or fail");
    }
    let orchestrator = app.orchestrator(Arc::new(spinner::SpinnerObserver))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelling run, plugins get their grace period");
            cancel_tx.send_replace(true);
        }
    });

    spinner::start("Planning run...");
    let summary = orchestrator.execute_with_cancel(plan, cancel_rx).await;
    spinner::finish();
    ctrl_c.abort();
    let summary = summary?;
    let run = &summary.run;

    print::header("run summary");
    print::tree_head(0, &run.id.to_string());
    let mut details = Vec::new();
    for stage in &run.stages {
        let status = match stage.status {
            StageStatus::Succeeded => stage.status.to_string().color(colors::SUCCEEDED),
            StageStatus::Failed => stage.status.to_string().color(colors::FAILED),
            _ => stage.status.to_string().color(colors::SKIPPED),
        };
        details.push((stage.kind.to_string(), status));
    }
    details.push(("Findings".to_string(), run.findings.len().to_string().normal()));
    print::as_tree_one_level(details);

    print::fat_separator();
    let state = match run.state {
        RunState::Completed => run.state.to_string().green().bold(),
        _ => run.state.to_string().red().bold(),
    };
    match &run.abort_reason {
        Some(reason) => print::centerln(&format!("Run {state}: {reason}")),
        None => print::centerln(&format!("Run {state}")),
    }
    match &summary.report_path {
        Some(path) => info!("report written to {}", path.display()),
        None => warn!("no report could be written, use `fortress report {}` to retry", run.id),
    }
    Ok(())
}

/// Fills in whatever the operator left out from the best local interface.
fn resolve_scan_inputs(interface: Option<String>, network: Option<String>) -> anyhow::Result<(String, String)> {
    if let (Some(interface), Some(network)) = (&interface, &network) {
        return Ok((interface.clone(), network.clone()));
    }

    let device: NetworkInterface = match &interface {
        Some(name) => find_interface(name).with_context(|| format!("no interface named {name}"))?,
        None => select_assessment_interface()?,
    };
    let network = match network {
        Some(network) => network,
        None => primary_ipv4_network(&device)
            .map(|net| format!("{}/{}", net.network(), net.prefix()))
            .with_context(|| format!("{} has no private IPv4 network, pass --network", device.name))?,
    };
    info!("assessing {network} from {}", device.name);
    Ok((device.name, network))
}
