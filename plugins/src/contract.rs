//! The contract every attack module implements.

use std::path::PathBuf;

use async_trait::async_trait;
use fortress_common::audit::RunId;
use fortress_common::findings::{Artifact, Finding};
use fortress_common::lifecycle::StageKind;
use fortress_common::network::target::Target;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
}

impl PluginMetadata {
    /// Structural check run once before a plugin is accepted.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("name", &self.name),
            ("description", &self.description),
            ("version", &self.version),
            ("author", &self.author),
        ] {
            if value.trim().is_empty() {
                return Err(format!("metadata field '{field}' is empty"));
            }
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!(
                "plugin name '{}' may only contain letters, digits, '-' and '_'",
                self.name
            ));
        }
        Ok(())
    }
}

/// Everything a plugin gets to see for one invocation.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub run_id: RunId,
    pub stage: StageKind,
    pub interface: Option<String>,
    pub targets: Vec<Target>,
    /// Artifacts produced by earlier stages of the same run, oldest first.
    pub artifacts: Vec<Artifact>,
    /// Scratch directory where the plugin may leave artifacts. Always
    /// absolute, so it stays valid inside a tool's own working directory.
    pub work_dir: PathBuf,
    cancel: watch::Receiver<bool>,
}

impl PluginContext {
    pub fn new(
        run_id: RunId,
        stage: StageKind,
        work_dir: PathBuf,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run_id,
            stage,
            interface: None,
            targets: Vec::new(),
            artifacts: Vec::new(),
            work_dir: std::path::absolute(&work_dir).unwrap_or(work_dir),
            cancel,
        }
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_targets(mut self, targets: Vec<Target>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the run is cancelled. Never resolves if the
    /// orchestrator goes away without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    /// The most recent artifact left by `stage`, if any.
    pub fn latest_artifact(&self, stage: StageKind) -> Option<&Artifact> {
        self.artifacts.iter().rev().find(|a| a.stage == stage)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginOutput {
    pub summary: Option<String>,
    pub findings: Vec<Finding>,
}

impl PluginOutput {
    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            findings: Vec::new(),
        }
    }

    pub fn push(&mut self, finding: Finding) {
        self.findings.push(finding);
    }
}

/// An attack module.
///
/// The registry calls `initialize`, `run` and `cleanup` in that order and
/// never concurrently for the same plugin. Returning `Ok(false)` from
/// `initialize` declines the current run without counting as a failure.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    /// Stages this plugin serves.
    fn stages(&self) -> &[StageKind];

    async fn initialize(&self) -> anyhow::Result<bool>;

    async fn run(&self, ctx: &PluginContext) -> anyhow::Result<PluginOutput>;

    async fn cleanup(&self) -> anyhow::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(name: &str) -> PluginMetadata {
        PluginMetadata {
            name: name.into(),
            description: "captures handshakes".into(),
            version: "1.0.0".into(),
            author: "fortress".into(),
        }
    }

    #[test]
    fn metadata_requires_every_field() {
        assert!(metadata("handshake-capture").validate().is_ok());

        let mut missing = metadata("handshake-capture");
        missing.author = "  ".into();
        assert!(missing.validate().unwrap_err().contains("author"));

        assert!(metadata("bad name").validate().is_err());
        assert!(metadata("../escape").validate().is_err());
    }

    #[tokio::test]
    async fn context_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        let ctx = PluginContext::new(RunId::new(), StageKind::Capture, PathBuf::from("/tmp"), rx);
        assert!(!ctx.is_cancelled());

        tx.send(true).unwrap();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn latest_artifact_picks_newest_of_stage() {
        let (_tx, rx) = watch::channel(false);
        let artifact = |producer: &str, stage, path: &str| Artifact {
            producer: producer.into(),
            stage,
            path: PathBuf::from(path),
        };
        let ctx = PluginContext::new(RunId::new(), StageKind::Crack, PathBuf::from("/tmp"), rx)
            .with_artifacts(vec![
                artifact("a", StageKind::Capture, "/tmp/one.cap"),
                artifact("b", StageKind::Capture, "/tmp/two.cap"),
                artifact("c", StageKind::Mitm, "/tmp/portal.log"),
            ]);

        assert_eq!(
            ctx.latest_artifact(StageKind::Capture).map(|a| a.producer.as_str()),
            Some("b")
        );
        assert!(ctx.latest_artifact(StageKind::Crack).is_none());
    }
}
