use std::path::PathBuf;

use colored::*;
use fortress_common::audit::RunId;
use fortress_core::{OrchestratorSettings, ReportBuilder, ReportFormat};
use tracing::info;

use crate::app::App;
use crate::terminal::print;

pub fn report(app: &mut App, run: RunId, format: Option<ReportFormat>, output: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = OrchestratorSettings::from_config(&app.cfg)?;
    let builder = ReportBuilder::new(app.audit()?);

    let report = builder.build(run)?;
    let format = format.unwrap_or(settings.report_format);
    let dir = output.unwrap_or(settings.report_dir);
    let path = report.write_to(&dir, format)?;

    info!("{}", report.status_line());
    info!("report written to {}", path.display());
    Ok(())
}

pub fn runs(app: &mut App) -> anyhow::Result<()> {
    let audit = app.audit()?;
    let builder = ReportBuilder::new(audit.clone());
    let runs: Vec<RunId> = audit.runs()?.into_iter().filter(|r| !r.is_system()).collect();

    if runs.is_empty() {
        print::header("no runs recorded");
        print::no_results("runs");
        return Ok(());
    }

    print::header("recorded runs");
    for (idx, run) in runs.iter().enumerate() {
        let report = builder.build(*run)?;
        print::tree_head(idx, &run.to_string());
        print::as_tree_one_level(vec![
            ("Status".to_string(), report.status_line().normal()),
            ("Stages".to_string(), report.stages.len().to_string().normal()),
            ("Targets".to_string(), report.inventory.len().to_string().normal()),
            (
                "Score".to_string(),
                format!("{} ({})", report.security.score, report.security.grade).normal(),
            ),
        ]);
    }
    Ok(())
}
