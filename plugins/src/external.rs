use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use fortress_common::findings::{Artifact, Finding};
use fortress_common::lifecycle::StageKind;
use tracing::{debug, info};

use crate::contract::{Plugin, PluginContext, PluginMetadata, PluginOutput};
use crate::manifest::{PluginManifest, ToolSpec};
use crate::tool::{JobOutcome, JobParams, ToolJob};

/// A plugin backed by a manifest and an external program.
pub struct ExternalToolPlugin {
    metadata: PluginMetadata,
    stages: Vec<StageKind>,
    tool: ToolSpec,
    job: Arc<dyn ToolJob>,
    default_timeout: Duration,
}

impl ExternalToolPlugin {
    pub fn new(manifest: PluginManifest, job: Arc<dyn ToolJob>, default_timeout: Duration) -> Self {
        Self {
            metadata: manifest.plugin.metadata,
            stages: manifest.plugin.stages,
            tool: manifest.tool,
            job,
            default_timeout,
        }
    }

    fn expand(&self, template: &str, ctx: &PluginContext) -> anyhow::Result<String> {
        let mut out = template.to_string();
        if out.contains("{interface}") {
            let interface = ctx
                .interface
                .as_deref()
                .context("no interface selected for this run")?;
            out = out.replace("{interface}", interface);
        }
        if out.contains("{bssid}") {
            let first = ctx.targets.first().context("no targets in scope")?;
            out = out.replace("{bssid}", &first.id.to_string());
        }
        if out.contains("{artifact}") {
            let artifact = ctx
                .artifacts
                .last()
                .context("no artifact from an earlier stage")?;
            out = out.replace("{artifact}", &artifact.path.to_string_lossy());
        }
        let targets = ctx
            .targets
            .iter()
            .map(|t| t.id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(out
            .replace("{targets}", &targets)
            .replace("{work_dir}", &ctx.work_dir.to_string_lossy())
            .replace("{run_id}", &ctx.run_id.to_string()))
    }

    fn credentials(&self, stdout: &str, ctx: &PluginContext) -> Vec<Finding> {
        let Some(marker) = self.tool.credential_marker.as_deref() else {
            return Vec::new();
        };
        let target = ctx
            .targets
            .first()
            .map(|t| t.display_name())
            .unwrap_or_else(|| "unknown".to_string());

        stdout
            .lines()
            .filter_map(|line| line.split_once(marker))
            .map(|(_, rest)| Finding::Credential {
                target: target.clone(),
                credential_type: self.metadata.name.clone(),
                detail: rest.trim().trim_matches(|c: char| c == '[' || c == ']').trim().to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl Plugin for ExternalToolPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    /// Declines the run when the tool is not installed.
    async fn initialize(&self) -> anyhow::Result<bool> {
        let found = resolve_program(&self.tool.command).is_some();
        if !found {
            info!(plugin = %self.metadata.name, command = %self.tool.command, "tool not installed, declining");
        }
        Ok(found)
    }

    async fn run(&self, ctx: &PluginContext) -> anyhow::Result<PluginOutput> {
        let args = self
            .tool
            .args
            .iter()
            .map(|arg| self.expand(arg, ctx))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let expected_artifact = self
            .tool
            .artifact
            .as_deref()
            .map(|a| self.expand(a, ctx).map(PathBuf::from))
            .transpose()?;

        let params = JobParams {
            program: self.tool.command.clone(),
            args,
            work_dir: ctx.work_dir.clone(),
            timeout: self
                .tool
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout),
            expected_artifact,
        };
        debug!(plugin = %self.metadata.name, ?params, "submitting job");

        match self.job.submit(params, ctx.cancel_receiver()).await {
            JobOutcome::Success { artifact, stdout } => {
                let mut output = PluginOutput::with_summary(format!("{} finished", self.tool.command));
                for finding in self.credentials(&stdout, ctx) {
                    output.push(finding);
                }
                if let Some(path) = artifact {
                    output.push(Finding::Artifact(Artifact {
                        producer: self.metadata.name.clone(),
                        stage: ctx.stage,
                        path,
                    }));
                }
                Ok(output)
            }
            JobOutcome::Failure { error } => bail!(error),
        }
    }

    async fn cleanup(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Locates `program` either as a path or on `PATH`.
fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}
