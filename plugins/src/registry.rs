//! # Plugin Registry
//!
//! Owns every plugin and its lifecycle state. Callers refer to plugins by
//! name; only the registry moves a plugin between states, and each move is
//! appended to the audit log before it takes effect.
//!
//! Invocations of one plugin are serialized through a per-plugin gate.
//! Different plugins run concurrently.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fortress_common::audit::{AuditPayload, AuditSink, RunId, Severity, StageId};
use fortress_common::config::ConfigStore;
use fortress_common::error::{Error, Result};
use fortress_common::lifecycle::{PluginState, StageKind, Transition};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::contract::{Plugin, PluginContext, PluginMetadata, PluginOutput};
use crate::external::ExternalToolPlugin;
use crate::manifest::{IntegrityPolicy, parse_manifest};
use crate::tool::{CommandJob, ToolJob};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub dir: PathBuf,
    /// Names eligible for invocation. Empty admits every loaded plugin.
    pub enabled: Vec<String>,
    pub integrity: IntegrityPolicy,
    pub job_timeout: Duration,
}

impl RegistrySettings {
    pub fn from_config(cfg: &ConfigStore) -> Self {
        Self {
            dir: PathBuf::from(cfg.get_or("plugins.dir", "plugins".to_string())),
            enabled: cfg.get_or("plugins.enabled", Vec::new()),
            integrity: IntegrityPolicy::from_config(cfg),
            job_timeout: cfg.get_secs("attack.job_timeout", 600),
        }
    }
}

/// Where a plugin came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    Manifest(PathBuf),
    InProcess,
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginSource::Manifest(path) => write!(f, "{}", path.display()),
            PluginSource::InProcess => f.write_str("in-process"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub metadata: PluginMetadata,
    pub stages: Vec<StageKind>,
    pub state: PluginState,
    pub source: PluginSource,
    pub enabled: bool,
}

/// Result of a single invocation that did not fail.
#[derive(Debug)]
pub enum Invocation {
    /// `initialize()` returned false.
    Declined,
    Completed(PluginOutput),
}

struct PluginSlot {
    plugin: Arc<dyn Plugin>,
    source: PluginSource,
    gate: tokio::sync::Mutex<()>,
}

struct PluginEntry {
    state: PluginState,
    slot: Arc<PluginSlot>,
}

pub struct PluginRegistry {
    settings: RegistrySettings,
    audit: Arc<dyn AuditSink>,
    job: Arc<dyn ToolJob>,
    entries: RwLock<BTreeMap<String, PluginEntry>>,
}

impl PluginRegistry {
    pub fn new(settings: RegistrySettings, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_job_runner(settings, audit, Arc::new(CommandJob))
    }

    pub fn with_job_runner(
        settings: RegistrySettings,
        audit: Arc<dyn AuditSink>,
        job: Arc<dyn ToolJob>,
    ) -> Self {
        Self {
            settings,
            audit,
            job,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Candidate manifests in the plugin directory, sorted. Nothing is read
    /// or validated here.
    pub fn discover_plugins(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.settings.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.settings.dir.display(), error = %e, "plugin directory unreadable");
                return Vec::new();
            }
        };

        let mut found: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_candidate(path))
            .collect();
        found.sort();
        found
    }

    /// Validates and loads one manifest. An invalid source is reported as
    /// an `InvalidPlugin` audit event and never reaches `Loaded`.
    pub fn load_plugin(&self, path: &Path) -> bool {
        match self.try_load(path) {
            Ok(name) => {
                info!(plugin = %name, source = %path.display(), "plugin loaded");
                true
            }
            Err(Error::InvalidPlugin { source_path, reason }) => {
                self.report_invalid(source_path, reason);
                false
            }
            Err(e) => {
                error!(source = %path.display(), error = %e, "plugin could not be loaded");
                false
            }
        }
    }

    /// Discovers and loads everything in the plugin directory. Returns the
    /// number of plugins that reached `Loaded`.
    pub fn load_all(&self) -> usize {
        self.discover_plugins()
            .iter()
            .filter(|path| self.load_plugin(path))
            .count()
    }

    /// Adds a plugin implemented in-process. Subject to the same metadata
    /// validation as manifests.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.metadata().name.clone();
        let checked = plugin
            .metadata()
            .validate()
            .and_then(|()| {
                if plugin.stages().is_empty() {
                    Err("plugin serves no stages".to_string())
                } else if plugin.stages().contains(&StageKind::Report) {
                    Err("the report stage cannot be served by plugins".to_string())
                } else {
                    Ok(())
                }
            });

        if let Err(reason) = checked {
            let source_path = PathBuf::from(format!("in-process:{name}"));
            self.report_invalid(source_path.clone(), reason.clone());
            return Err(Error::InvalidPlugin { source_path, reason });
        }

        self.insert(name, plugin, PluginSource::InProcess)
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.entries.read().get(name).map(|e| e.state)
    }

    pub fn loaded_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.state != PluginState::Unloaded)
            .count()
    }

    pub fn plugin_info(&self) -> Vec<PluginInfo> {
        self.entries
            .read()
            .iter()
            .map(|(name, entry)| PluginInfo {
                metadata: entry.slot.plugin.metadata().clone(),
                stages: entry.slot.plugin.stages().to_vec(),
                state: entry.state,
                source: entry.slot.source.clone(),
                enabled: self.is_enabled(name),
            })
            .collect()
    }

    /// Names of the plugins that may be invoked for `stage` right now.
    pub fn eligible(&self, stage: StageKind) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(name, entry)| {
                entry.state.is_invocable()
                    && self.is_enabled(name)
                    && entry.slot.plugin.stages().contains(&stage)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Re-arms plugins that finished or failed in an earlier run.
    pub fn prepare_run(&self, run_id: RunId) -> Result<()> {
        let rearm: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| matches!(e.state, PluginState::Cleaned | PluginState::Failed))
            .map(|(name, _)| name.clone())
            .collect();

        for name in rearm {
            self.transition(run_id, None, &name, PluginState::Loaded)?;
        }
        Ok(())
    }

    /// Runs one full `initialize -> run -> cleanup` cycle of `name`.
    ///
    /// Any error from plugin code moves the plugin to `Failed`, triggers a
    /// best-effort cleanup and comes back as [`Error::PluginExecution`].
    /// Audit failures are returned as they are.
    pub async fn invoke(
        &self,
        stage_id: StageId,
        name: &str,
        ctx: &PluginContext,
    ) -> Result<Invocation> {
        let slot = self.slot(name)?;
        let _gate = slot.gate.lock().await;
        let run_id = ctx.run_id;
        let stage = Some(stage_id);

        let current = self.state(name).ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        if !current.is_invocable() {
            return Err(Error::plugin_execution(
                name,
                "initialize",
                format!("plugin is {current} and cannot be invoked"),
            ));
        }

        match slot.plugin.initialize().await {
            Ok(true) => {
                self.transition(run_id, stage, name, PluginState::Initialized)?;
            }
            Ok(false) => {
                info!(plugin = name, stage = %ctx.stage, "plugin declined the run");
                return Ok(Invocation::Declined);
            }
            Err(e) => {
                self.fail_locked(run_id, stage, name, &slot).await?;
                return Err(Error::plugin_execution(name, "initialize", format!("{e:#}")));
            }
        }

        self.transition(run_id, stage, name, PluginState::Running)?;

        let output = match slot.plugin.run(ctx).await {
            Ok(output) => output,
            Err(e) => {
                self.fail_locked(run_id, stage, name, &slot).await?;
                return Err(Error::plugin_execution(name, "run", format!("{e:#}")));
            }
        };

        match slot.plugin.cleanup().await {
            Ok(released) => {
                if !released {
                    warn!(plugin = name, "cleanup reported unreleased resources");
                }
                self.transition(run_id, stage, name, PluginState::Cleaned)?;
            }
            Err(e) => {
                self.transition(run_id, stage, name, PluginState::Failed)?;
                return Err(Error::plugin_execution(name, "cleanup", format!("{e:#}")));
            }
        }

        Ok(Invocation::Completed(output))
    }

    /// Forces `name` into `Failed` after its invocation was abandoned and
    /// runs a best-effort cleanup. Returns whether the state changed.
    pub async fn fail(&self, run_id: RunId, stage_id: Option<StageId>, name: &str) -> Result<bool> {
        let slot = self.slot(name)?;
        let _gate = slot.gate.lock().await;
        match self.state(name) {
            Some(PluginState::Initialized | PluginState::Running) => {
                self.fail_locked(run_id, stage_id, name, &slot).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Applies a lifecycle transition. The audit event is written first;
    /// if that fails the state is left untouched. No registry lock is held
    /// while the audit sink runs.
    pub fn transition(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        name: &str,
        to: PluginState,
    ) -> Result<Transition<PluginState>> {
        let from = self
            .state(name)
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        if from == to {
            return Ok(Transition::Unchanged);
        }
        if !from.can_move_to(to) {
            return Err(Error::IllegalTransition {
                subject: format!("plugin {name}"),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let severity = if to == PluginState::Failed {
            Severity::Error
        } else {
            Severity::Info
        };
        self.audit.append(
            run_id,
            stage_id,
            severity,
            AuditPayload::PluginTransition {
                plugin: name.to_string(),
                from,
                to,
            },
        )?;

        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        if entry.state != from {
            warn!(plugin = name, %from, %to, now = %entry.state, "plugin moved while its transition was audited");
            return Err(Error::IllegalTransition {
                subject: format!("plugin {name}"),
                from: entry.state.to_string(),
                to: to.to_string(),
            });
        }

        entry.state = to;
        debug!(plugin = name, %from, %to, "plugin transition");
        Ok(Transition::Moved { from })
    }

    async fn fail_locked(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        name: &str,
        slot: &PluginSlot,
    ) -> Result<()> {
        self.transition(run_id, stage_id, name, PluginState::Failed)?;
        match slot.plugin.cleanup().await {
            Ok(true) => {}
            Ok(false) => warn!(plugin = name, "cleanup after failure left resources behind"),
            Err(e) => warn!(plugin = name, error = %e, "cleanup after failure errored"),
        }
        Ok(())
    }

    fn try_load(&self, path: &Path) -> Result<String> {
        let invalid = |reason: String| Error::InvalidPlugin {
            source_path: path.to_path_buf(),
            reason,
        };

        let bytes = std::fs::read(path).map_err(|e| invalid(format!("unreadable: {e}")))?;
        let manifest = parse_manifest(path, &bytes, &self.settings.integrity).map_err(invalid)?;
        let name = manifest.plugin.metadata.name.clone();

        if self.entries.read().contains_key(&name) {
            return Err(invalid(format!("a plugin named '{name}' is already registered")));
        }

        let plugin = Arc::new(ExternalToolPlugin::new(
            manifest,
            self.job.clone(),
            self.settings.job_timeout,
        ));
        self.insert(name.clone(), plugin, PluginSource::Manifest(path.to_path_buf()))?;
        Ok(name)
    }

    fn insert(&self, name: String, plugin: Arc<dyn Plugin>, source: PluginSource) -> Result<()> {
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&name) {
                drop(entries);
                let reason = format!("a plugin named '{name}' is already registered");
                let source_path = PathBuf::from(source.to_string());
                return Err(Error::InvalidPlugin { source_path, reason });
            }
            entries.insert(
                name.clone(),
                PluginEntry {
                    state: PluginState::Unloaded,
                    slot: Arc::new(PluginSlot {
                        plugin,
                        source,
                        gate: tokio::sync::Mutex::new(()),
                    }),
                },
            );
        }

        if let Err(e) = self.transition(RunId::system(), None, &name, PluginState::Loaded) {
            self.entries.write().remove(&name);
            return Err(e);
        }
        Ok(())
    }

    fn report_invalid(&self, source: PathBuf, reason: String) {
        warn!(source = %source.display(), %reason, "invalid plugin rejected");
        let payload = AuditPayload::InvalidPlugin { source, reason };
        if let Err(e) = self.audit.append(RunId::system(), None, Severity::Warning, payload) {
            error!(error = %e, "failed to audit invalid plugin");
        }
    }

    fn slot(&self, name: &str) -> Result<Arc<PluginSlot>> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.slot.clone())
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.settings.enabled.is_empty() || self.settings.enabled.iter().any(|n| n == name)
    }
}

fn is_candidate(path: &Path) -> bool {
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_none_or(|n| n.starts_with('_') || n.starts_with('.'));
    is_toml && !hidden
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
