use std::fmt::Write;

use fortress_common::error::{Error, Result};
use fortress_common::findings::Finding;
use fortress_common::lifecycle::StageStatus;

use super::{EventLine, Report, join_kinds};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub(super) fn json(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(|e| Error::Io(e.into()))
}

// `write!` into a String cannot fail, the results are discarded.
pub(super) fn markdown(report: &Report) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Wireless Assessment Report");
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Run:** `{}`", report.run_id);
    let _ = writeln!(out, "- **Status:** {}", report.status_line());
    let failed = report.stages_with(StageStatus::Failed);
    if !failed.is_empty() {
        let _ = writeln!(out, "- **Failed stages:** {}", join_kinds(&failed));
    }
    let _ = writeln!(out, "- **Generated:** {}", report.generated_at.format(TIME_FORMAT));
    let _ = writeln!(
        out,
        "- **Security score:** {}/100 (grade {})",
        report.security.score, report.security.grade
    );
    if report.unreadable > 0 {
        let _ = writeln!(
            out,
            "- **Warning:** {} audit record(s) could not be read and are missing below",
            report.unreadable
        );
    }
    let _ = writeln!(out);

    if report.stages.is_empty() {
        let _ = writeln!(out, "_No stage was planned for this run._");
        let _ = writeln!(out);
    }
    for stage in &report.stages {
        let _ = writeln!(out, "## {}", stage.kind);
        let _ = writeln!(out);
        let _ = write!(out, "Status: **{}**", stage.status);
        if let Some(started) = stage.started_at {
            let _ = write!(out, ", started {}", started.format(TIME_FORMAT));
        }
        if let Some(finished) = stage.finished_at {
            let _ = write!(out, ", finished {}", finished.format(TIME_FORMAT));
        }
        let _ = writeln!(out);
        let _ = writeln!(out);
        events(&mut out, &stage.events);
        if !stage.findings.is_empty() {
            let _ = writeln!(out, "Findings:");
            for finding in &stage.findings {
                let _ = writeln!(out, "- {}", finding_line(finding));
            }
            let _ = writeln!(out);
        }
    }

    if !report.inventory.is_empty() {
        let _ = writeln!(out, "## Device Inventory");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Address | Name | Security | Channel | Signal | Vendor |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for target in &report.inventory {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                target.id,
                target.name.as_deref().unwrap_or("-"),
                target.security,
                target.channel.map_or("-".to_string(), |c| c.to_string()),
                target.signal_dbm.map_or("-".to_string(), |s| format!("{s} dBm")),
                target.vendor.as_deref().unwrap_or("-"),
            );
        }
        let _ = writeln!(out);
    }

    if !report.credentials.is_empty() {
        let _ = writeln!(out, "## Credentials");
        let _ = writeln!(out);
        for c in &report.credentials {
            let _ = writeln!(
                out,
                "- **{}** ({}, {} via {}): {}",
                c.target, c.credential_type, c.stage, c.plugin, c.detail
            );
        }
        let _ = writeln!(out);
    }

    if !report.recommendations.is_empty() {
        let _ = writeln!(out, "## Recommendations");
        let _ = writeln!(out);
        for advice in &report.recommendations {
            let _ = writeln!(out, "- {advice}");
        }
        let _ = writeln!(out);
    }

    if !report.run_events.is_empty() {
        let _ = writeln!(out, "## Run Events");
        let _ = writeln!(out);
        events(&mut out, &report.run_events);
    }

    out
}

fn events(out: &mut String, events: &[EventLine]) {
    if events.is_empty() {
        let _ = writeln!(out, "_No events recorded._");
        let _ = writeln!(out);
        return;
    }
    for event in events {
        let _ = writeln!(
            out,
            "- `#{}` {} [{}] {}",
            event.seq,
            event.timestamp.format("%H:%M:%S"),
            event.severity,
            event.message
        );
    }
    let _ = writeln!(out);
}

fn finding_line(finding: &Finding) -> String {
    match finding {
        Finding::DeviceInventory { targets } => {
            let names: Vec<String> = targets.iter().map(|t| t.display_name()).collect();
            format!("{} devices: {}", targets.len(), names.join(", "))
        }
        other => other.to_string(),
    }
}
