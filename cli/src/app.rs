use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fortress_common::config::ConfigStore;
use fortress_common::rate_limit::RateLimiter;
use fortress_core::orchestrator::ProgressObserver;
use fortress_core::scanner::ArpScanner;
use fortress_core::vendors::MacOuiRepo;
use fortress_core::{AttackOrchestrator, AuditLog, MapperSettings, NetworkMapper, OrchestratorSettings};
use fortress_plugins::{PluginRegistry, RegistrySettings};
use tracing::{info, warn};

/// Components wired from one configuration.
pub struct App {
    pub cfg: ConfigStore,
    audit: Option<Arc<AuditLog>>,
}

impl App {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let cfg = ConfigStore::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        Ok(Self { cfg, audit: None })
    }

    /// The audit log is opened lazily; commands that never touch it work
    /// without a key.
    pub fn audit(&mut self) -> anyhow::Result<Arc<AuditLog>> {
        if let Some(audit) = &self.audit {
            return Ok(audit.clone());
        }
        let audit = Arc::new(AuditLog::from_config(&self.cfg).context(
            "cannot open the audit log (set security.encryption_key or FORTRESS_AUDIT_KEY)",
        )?);
        self.audit = Some(audit.clone());
        Ok(audit)
    }

    pub fn mapper(&mut self) -> anyhow::Result<Arc<NetworkMapper>> {
        let audit = self.audit()?;
        let limiter = RateLimiter::from_config("scan", &self.cfg, "scan.rate_limit")?;
        let mapper = NetworkMapper::builder(
            Arc::new(ArpScanner::from_config(&self.cfg)),
            limiter,
            audit,
            MapperSettings::from_config(&self.cfg),
        )
        .vendors(Arc::new(MacOuiRepo))
        .build();
        Ok(Arc::new(mapper))
    }

    pub fn registry(&mut self) -> anyhow::Result<Arc<PluginRegistry>> {
        let audit = self.audit()?;
        let registry = PluginRegistry::new(RegistrySettings::from_config(&self.cfg), audit);
        let discovered = registry.discover_plugins().len();
        let loaded = registry.load_all();
        if loaded < discovered {
            warn!(loaded, discovered, "some plugins were rejected, see the system audit trail");
        } else {
            info!(loaded, "plugins loaded");
        }
        Ok(Arc::new(registry))
    }

    pub fn orchestrator(&mut self, observer: Arc<dyn ProgressObserver>) -> anyhow::Result<AttackOrchestrator> {
        let mapper = self.mapper()?;
        let registry = self.registry()?;
        let limiter = RateLimiter::from_config("attack", &self.cfg, "attack.rate_limit")?;
        let settings = OrchestratorSettings::from_config(&self.cfg)?;
        Ok(AttackOrchestrator::new(mapper, registry, limiter, self.audit()?, settings).with_observer(observer))
    }
}
