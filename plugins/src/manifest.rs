//! # Plugin Manifests
//!
//! A plugin source is a TOML file describing the module and the external
//! tool it drives:
//!
//! ```toml
//! [plugin]
//! name = "handshake-capture"
//! description = "Captures WPA handshakes"
//! version = "1.0.0"
//! author = "fortress"
//! stages = ["capture"]
//!
//! [tool]
//! command = "airodump-ng"
//! args = ["--bssid", "{bssid}", "-w", "{work_dir}/handshake", "{interface}"]
//! artifact = "{work_dir}/handshake-01.cap"
//! timeout = 300
//! ```
//!
//! Validation is purely structural. Nothing named by a manifest is executed
//! while it is being loaded.

use std::collections::HashSet;
use std::path::Path;

use fortress_common::config::ConfigStore;
use fortress_common::lifecycle::StageKind;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::contract::PluginMetadata;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginManifest {
    pub plugin: ManifestHeader,
    pub tool: ToolSpec,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestHeader {
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    pub stages: Vec<StageKind>,
}

/// How to invoke the external tool. Arguments may use the placeholders
/// `{interface}`, `{work_dir}`, `{run_id}`, `{bssid}`, `{targets}` and
/// `{artifact}` (newest artifact of the previous stages).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Path the tool is expected to leave behind on success.
    pub artifact: Option<String>,
    /// Seconds; falls back to `attack.job_timeout`.
    pub timeout: Option<u64>,
    /// Stdout lines containing this marker are reported as recovered
    /// credentials.
    pub credential_marker: Option<String>,
}

/// SHA-256 allow/deny lists applied to manifest bytes.
#[derive(Debug, Clone, Default)]
pub struct IntegrityPolicy {
    allowlist: HashSet<String>,
    denylist: HashSet<String>,
}

impl IntegrityPolicy {
    pub fn new(
        allowlist: impl IntoIterator<Item = String>,
        denylist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            allowlist: allowlist.into_iter().map(|d| d.to_ascii_lowercase()).collect(),
            denylist: denylist.into_iter().map(|d| d.to_ascii_lowercase()).collect(),
        }
    }

    pub fn from_config(cfg: &ConfigStore) -> Self {
        Self::new(
            cfg.get_or::<Vec<String>>("plugins.allowlist", Vec::new()),
            cfg.get_or::<Vec<String>>("plugins.denylist", Vec::new()),
        )
    }

    /// Denylist always wins; an empty allowlist admits everything else.
    pub fn check(&self, digest: &str) -> Result<(), String> {
        if self.denylist.contains(digest) {
            return Err(format!("digest {digest} is denylisted"));
        }
        if !self.allowlist.is_empty() && !self.allowlist.contains(digest) {
            return Err(format!("digest {digest} is not allowlisted"));
        }
        Ok(())
    }
}

pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Parses and validates manifest bytes read from `path`.
pub fn parse_manifest(
    path: &Path,
    bytes: &[u8],
    policy: &IntegrityPolicy,
) -> Result<PluginManifest, String> {
    policy.check(&digest(bytes))?;

    let text = std::str::from_utf8(bytes).map_err(|_| "manifest is not valid UTF-8".to_string())?;
    let manifest: PluginManifest =
        toml::from_str(text).map_err(|e| format!("malformed manifest: {}", e.message()))?;

    manifest.plugin.metadata.validate()?;

    if manifest.plugin.stages.is_empty() {
        return Err("manifest declares no stages".into());
    }
    if manifest.plugin.stages.contains(&StageKind::Report) {
        return Err("the report stage cannot be served by plugins".into());
    }
    if manifest.tool.command.trim().is_empty() {
        return Err("tool command is empty".into());
    }
    if manifest.tool.timeout == Some(0) {
        return Err("tool timeout must be positive".into());
    }

    tracing::debug!(
        path = %path.display(),
        plugin = %manifest.plugin.metadata.name,
        "manifest validated"
    );
    Ok(manifest)
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[plugin]
name = "handshake-capture"
description = "Captures WPA handshakes"
version = "1.0.0"
author = "fortress"
stages = ["capture"]

[tool]
command = "airodump-ng"
args = ["-w", "{work_dir}/hs", "{interface}"]
artifact = "{work_dir}/hs-01.cap"
"#;

    fn parse(text: &str, policy: &IntegrityPolicy) -> Result<PluginManifest, String> {
        parse_manifest(Path::new("test.toml"), text.as_bytes(), policy)
    }

    #[test]
    fn accepts_complete_manifest() {
        let manifest = parse(VALID, &IntegrityPolicy::default()).unwrap();
        assert_eq!(manifest.plugin.metadata.name, "handshake-capture");
        assert_eq!(manifest.plugin.stages, vec![StageKind::Capture]);
        assert_eq!(manifest.tool.args.len(), 3);
        assert_eq!(manifest.tool.timeout, None);
    }

    #[test]
    fn rejects_missing_metadata() {
        let without_author = VALID.replace("author = \"fortress\"\n", "");
        let err = parse(&without_author, &IntegrityPolicy::default()).unwrap_err();
        assert!(err.contains("author"), "{err}");
    }

    #[test]
    fn rejects_report_stage_and_empty_stage_list() {
        let report = VALID.replace("[\"capture\"]", "[\"report\"]");
        assert!(parse(&report, &IntegrityPolicy::default()).is_err());

        let none = VALID.replace("[\"capture\"]", "[]");
        assert!(parse(&none, &IntegrityPolicy::default()).is_err());

        let unknown = VALID.replace("[\"capture\"]", "[\"deauth\"]");
        assert!(parse(&unknown, &IntegrityPolicy::default()).is_err());
    }

    #[test]
    fn integrity_lists_are_enforced() {
        let hash = digest(VALID.as_bytes());

        let deny = IntegrityPolicy::new(Vec::new(), vec![hash.clone()]);
        assert!(parse(VALID, &deny).unwrap_err().contains("denylisted"));

        let allow_other = IntegrityPolicy::new(vec!["00".repeat(32)], Vec::new());
        assert!(parse(VALID, &allow_other).unwrap_err().contains("not allowlisted"));

        let allow = IntegrityPolicy::new(vec![hash.to_uppercase()], Vec::new());
        assert!(parse(VALID, &allow).is_ok());
    }
}
