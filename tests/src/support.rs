//! Doubles shared by the integration suites.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use fortress_common::lifecycle::StageKind;
use fortress_common::network::range::ScanNetwork;
use fortress_common::network::target::{MacAddr, SecurityMode, Target};
use fortress_common::rate_limit::RateLimiter;
use fortress_common::scanning::NetworkScanner;
use fortress_core::{AuditKey, AuditLog, MapperSettings, NetworkMapper};
use fortress_plugins::manifest::IntegrityPolicy;
use fortress_plugins::{Plugin, PluginContext, PluginMetadata, PluginOutput, RegistrySettings};

/// Answers every sweep with the same two access points after `delay`.
pub struct LabScanner {
    pub delay: Duration,
    pub sweeps: AtomicUsize,
}

impl LabScanner {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            sweeps: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NetworkScanner for LabScanner {
    async fn scan(&self, _interface: &str, _network: &ScanNetwork) -> anyhow::Result<Vec<Target>> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(vec![
            Target::new(MacAddr(2, 0, 0, 0, 0, 1))
                .with_name("lab-ap")
                .with_security(SecurityMode::Wpa2),
            Target::new(MacAddr(2, 0, 0, 0, 0, 2))
                .with_name("guest")
                .with_security(SecurityMode::Open),
        ])
    }
}

pub fn mapper(scanner: Arc<LabScanner>, audit: Arc<AuditLog>, max_concurrent: usize) -> NetworkMapper {
    NetworkMapper::new(
        scanner,
        RateLimiter::new("scan", 100, Duration::from_secs(60)),
        audit,
        MapperSettings {
            max_concurrent,
            ..MapperSettings::default()
        },
    )
}

pub fn audit_log() -> Arc<AuditLog> {
    Arc::new(AuditLog::in_memory(&AuditKey::generate()))
}

pub fn registry_settings(dir: &Path) -> RegistrySettings {
    RegistrySettings {
        dir: dir.to_path_buf(),
        enabled: Vec::new(),
        integrity: IntegrityPolicy::default(),
        job_timeout: Duration::from_secs(5),
    }
}

/// In-process plugin that always succeeds or always fails.
pub struct ScriptedPlugin {
    metadata: PluginMetadata,
    stages: Vec<StageKind>,
    fails: bool,
}

impl ScriptedPlugin {
    pub fn succeeding(name: &str, stage: StageKind) -> Arc<Self> {
        Self::build(name, stage, false)
    }

    pub fn failing(name: &str, stage: StageKind) -> Arc<Self> {
        Self::build(name, stage, true)
    }

    fn build(name: &str, stage: StageKind, fails: bool) -> Arc<Self> {
        Arc::new(Self {
            metadata: PluginMetadata {
                name: name.into(),
                description: "integration double".into(),
                version: "1.0.0".into(),
                author: "tests".into(),
            },
            stages: vec![stage],
            fails,
        })
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    async fn initialize(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn run(&self, ctx: &PluginContext) -> anyhow::Result<PluginOutput> {
        if self.fails {
            return Err(anyhow!("adapter refused monitor mode"));
        }
        Ok(PluginOutput::with_summary(format!("{} targets seen", ctx.targets.len())))
    }

    async fn cleanup(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}
