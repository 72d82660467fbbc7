//! # Configuration Store
//!
//! A single [`ConfigStore`] is created at startup and handed to every
//! component that needs tunables. Values live in a TOML table and are
//! addressed by dotted paths (`scan.rate_limit.max_requests`).
//!
//! Files written by older versions may miss keys; [`ConfigStore::load`]
//! fills them from the built-in defaults without touching the values the
//! operator set. Every successful [`ConfigStore::set`] is written back to
//! disk atomically (temporary file + rename).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use toml::{Table, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "fortress.toml";

const DEFAULTS: &str = r#"
[logging]
level = "info"

[scan]
interval = 300
timeout = 30
max_addresses = 256
max_concurrent = 3
stale_after = 3600
command = "arp-scan"

[scan.rate_limit]
max_requests = 5
time_window = 60

[security]
encryption_key = ""

[plugins]
dir = "plugins"
enabled = []
allowlist = []
denylist = []

[audit]
dir = "audit"
write_timeout_ms = 2000

[attack]
max_exhausted_stages = 2
grace_period = 10
job_timeout = 600
work_dir = "work"

[attack.rate_limit]
max_requests = 20
time_window = 60

[report]
dir = "reports"
format = "markdown"
"#;

#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    values: RwLock<Table>,
}

impl ConfigStore {
    /// Built-in defaults only, never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: RwLock::new(default_table()),
        }
    }

    /// Reads `path`, merging it over the defaults. A missing file yields the
    /// defaults; the file is created on the first `set`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut table = if path.exists() {
            let raw = fs::read_to_string(path)?;
            raw.parse::<Table>()
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            debug!(path = %path.display(), "config file missing, using defaults");
            Table::new()
        };
        merge_missing(&mut table, &default_table());

        Ok(Self {
            path: Some(path.to_path_buf()),
            values: RwLock::new(table),
        })
    }

    /// Parses TOML text over the defaults. Used for overrides and tests.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut table = raw
            .parse::<Table>()
            .map_err(|e| Error::Config(e.to_string()))?;
        merge_missing(&mut table, &default_table());
        Ok(Self {
            path: None,
            values: RwLock::new(table),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Typed lookup. `None` when the key is absent or has another type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.read();
        let value = lookup(&values, key)?.clone();
        match value.try_into::<T>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "config value has unexpected type");
                None
            }
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Reads a whole-seconds value as a [`Duration`].
    pub fn get_secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.get_or(key, default))
    }

    /// Stores `value` under `key`, creating intermediate tables, and
    /// persists the file. Returns true only once the value is on disk.
    ///
    /// On failure the store is left untouched. A store without a file
    /// still takes the value in memory but returns false, since nothing
    /// was persisted.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> bool {
        let value = match Value::try_from(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "config value is not representable");
                return false;
            }
        };

        let mut values = self.values.write();
        let mut updated = values.clone();
        if !insert(&mut updated, key, value) {
            warn!(key, "config key collides with a non-table value");
            return false;
        }

        let Some(path) = &self.path else {
            debug!(key, "config has no backing file, value kept in memory only");
            *values = updated;
            return false;
        };
        if let Err(e) = persist(path, &updated) {
            warn!(key, path = %path.display(), error = %e, "failed to persist config");
            return false;
        }

        *values = updated;
        true
    }

    /// Current contents rendered as TOML.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(&*self.values.read()).unwrap_or_default()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn default_table() -> Table {
    DEFAULTS.parse::<Table>().unwrap_or_default()
}

fn lookup<'a>(table: &'a Table, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = table.get(segments.next()?)?;
    for segment in segments {
        current = current.as_table()?.get(segment)?;
    }
    Some(current)
}

fn insert(table: &mut Table, key: &str, value: Value) -> bool {
    let segments: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    if last.is_empty() || parents.iter().any(|s| s.is_empty()) {
        return false;
    }

    let mut current = table;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert(Value::Table(Table::new()));
        match entry {
            Value::Table(next) => current = next,
            _ => return false,
        }
    }
    current.insert(last.to_string(), value);
    true
}

fn merge_missing(target: &mut Table, defaults: &Table) {
    for (key, default) in defaults {
        match target.get_mut(key) {
            Some(Value::Table(existing)) => {
                if let Value::Table(nested) = default {
                    merge_missing(existing, nested);
                }
            }
            Some(_) => {}
            None => {
                target.insert(key.clone(), default.clone());
            }
        }
    }
}

fn persist(path: &Path, table: &Table) -> std::io::Result<()> {
    let rendered = toml::to_string_pretty(table)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("toml.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(rendered.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
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

    #[test]
    fn defaults_parse() {
        assert!(!DEFAULTS.parse::<Table>().unwrap().is_empty());
        let cfg = ConfigStore::in_memory();
        assert_eq!(cfg.get::<u64>("scan.rate_limit.max_requests"), Some(5));
        assert_eq!(cfg.get::<String>("logging.level").as_deref(), Some("info"));
        assert_eq!(cfg.get::<Vec<String>>("plugins.enabled"), Some(vec![]));
    }

    #[test]
    fn missing_keys_fall_back() {
        let cfg = ConfigStore::in_memory();
        assert_eq!(cfg.get::<u64>("scan.nope"), None);
        assert_eq!(cfg.get_or("scan.nope", 7u64), 7);
        // Wrong type is treated as absent.
        assert_eq!(cfg.get::<u64>("logging.level"), None);
        assert_eq!(cfg.get_secs("scan.interval", 1), Duration::from_secs(300));
    }

    #[test]
    fn user_values_win_and_gaps_are_filled() {
        let cfg = ConfigStore::from_toml_str(
            r#"
            [scan]
            interval = 90
            [scan.rate_limit]
            max_requests = 2
            "#,
        )
        .unwrap();

        assert_eq!(cfg.get::<u64>("scan.interval"), Some(90));
        assert_eq!(cfg.get::<u64>("scan.rate_limit.max_requests"), Some(2));
        assert_eq!(cfg.get::<u64>("scan.rate_limit.time_window"), Some(60));
        assert_eq!(cfg.get::<u64>("scan.max_addresses"), Some(256));
    }

    #[test]
    fn set_creates_nested_tables() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConfigStore::load(dir.path().join("fortress.toml")).unwrap();
        assert!(cfg.set("custom.deep.value", 42));
        assert_eq!(cfg.get::<i64>("custom.deep.value"), Some(42));

        // A scalar cannot become a table.
        assert!(!cfg.set("logging.level.inner", 1));
        assert_eq!(cfg.get::<String>("logging.level").as_deref(), Some("info"));
        assert!(!cfg.set("", 1));
    }

    #[test]
    fn in_memory_set_is_not_reported_as_persisted() {
        let cfg = ConfigStore::in_memory();
        assert!(!cfg.set("scan.interval", 30));
        assert_eq!(cfg.get::<u64>("scan.interval"), Some(30));
    }

    #[test]
    fn set_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fortress.toml");

        let cfg = ConfigStore::load(&path).unwrap();
        assert!(!path.exists());
        assert!(cfg.set("plugins.enabled", vec!["evil-twin"]));
        assert!(path.exists());

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(
            reloaded.get::<Vec<String>>("plugins.enabled"),
            Some(vec!["evil-twin".to_string()])
        );
        assert_eq!(reloaded.get::<u64>("scan.interval"), Some(300));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[scan\ninterval = ").unwrap();
        assert!(matches!(ConfigStore::load(&path), Err(Error::Config(_))));
    }
}
