//! Configuration file handling.
//!
//! Worker processes read a `purser.toml` describing the control-plane site
//! root, the job-broker address, the plugin layout, hook wiring, and the
//! handful of install-wide flags that are not served by the control-plane
//! API. Missing sections fall back to defaults; `PURSER_CONFIG` overrides
//! the file path.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/purser/purser.toml";

/// Environment variable overriding the config file path.
pub const CONFIG_ENV: &str = "PURSER_CONFIG";

/// One user-configured command attached to a post hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookCommand {
    /// Display name, used in failure reasons.
    pub name: String,
    /// argv, tokens substituted before execution.
    pub command: Vec<String>,
}

/// Command list for a hook, optionally scoped to one collection system
/// transfer by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookCommandSet {
    #[serde(default, rename = "collectionSystemTransferName")]
    pub collection_system_transfer_name: Option<String>,
    #[serde(default, rename = "commandList")]
    pub command_list: Vec<HookCommand>,
}

/// Complete worker-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurserConfig {
    /// Base URL of the control-plane API, e.g. `http://127.0.0.1/`.
    pub site_root: String,
    /// host:port of the job broker.
    pub broker: String,
    /// Directory holding the data-dashboard parser plugins.
    pub plugin_dir: PathBuf,
    /// Filename suffix of the parser plugins.
    pub plugin_suffix: String,
    /// Mirror the PublicData share into the cruise tree.
    pub transfer_public_data: bool,
    /// Lock down sibling cruise directories so only the current cruise is
    /// readable.
    pub show_only_current_cruise_dir: bool,
    /// Default scheduler interval in minutes.
    pub transfer_interval: u64,
    /// Fallback transfer-log purge age when the control plane has none
    /// configured, e.g. `"12 hours"`.
    pub logfile_purge_timedelta: Option<String>,
    /// Follow-on job queues submitted when a hook-bearing task passes.
    pub hooks: BTreeMap<String, Vec<String>>,
    /// User-configured commands behind the post*/pre* hook queues.
    pub post_hook_commands: BTreeMap<String, Vec<HookCommandSet>>,
}

impl Default for PurserConfig {
    fn default() -> Self {
        Self {
            site_root: "http://127.0.0.1/".to_string(),
            broker: "127.0.0.1:4730".to_string(),
            plugin_dir: PathBuf::from("/opt/purser/plugins"),
            plugin_suffix: "_parser".to_string(),
            transfer_public_data: false,
            show_only_current_cruise_dir: false,
            transfer_interval: 5,
            logfile_purge_timedelta: Some("12 hours".to_string()),
            hooks: BTreeMap::new(),
            post_hook_commands: BTreeMap::new(),
        }
    }
}

impl PurserConfig {
    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Load from `path` if given, else `PURSER_CONFIG`, else the default
    /// location.
    pub fn load_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => env::var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        Self::load(&path)
    }

    /// Follow-on job queues registered for `task_name`.
    pub fn tasks_for_hook(&self, task_name: &str) -> &[String] {
        self.hooks.get(task_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Command sets configured behind the given post-hook queue name.
    pub fn post_hook_command_sets(&self, hook_name: &str) -> &[HookCommandSet] {
        self.post_hook_commands
            .get(hook_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = PurserConfig::default();
        assert_eq!(config.transfer_interval, 5);
        assert_eq!(config.broker, "127.0.0.1:4730");
        assert!(config.tasks_for_hook("runCollectionSystemTransfer").is_empty());
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
            site_root = "http://warehouse.ship.local/"
            broker = "warehouse.ship.local:4730"
            plugin_dir = "/opt/purser/plugins"
            plugin_suffix = "_parser.py"
            transfer_public_data = true
            show_only_current_cruise_dir = true
            transfer_interval = 10
            logfile_purge_timedelta = "3 days 6 hours"

            [hooks]
            runCollectionSystemTransfer = ["updateDataDashboard", "updateMD5Summary"]
            setupNewCruise = ["postSetupNewCruise"]

            [[post_hook_commands.postCollectionSystemTransfer]]
            collectionSystemTransferName = "SCS"
            [[post_hook_commands.postCollectionSystemTransfer.commandList]]
            name = "notify"
            command = ["/usr/local/bin/notify", "{cruiseID}"]
        "#;

        let config: PurserConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.site_root, "http://warehouse.ship.local/");
        assert!(config.transfer_public_data);
        assert_eq!(
            config.tasks_for_hook("runCollectionSystemTransfer"),
            ["updateDataDashboard", "updateMD5Summary"]
        );

        let sets = config.post_hook_command_sets("postCollectionSystemTransfer");
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].collection_system_transfer_name.as_deref(), Some("SCS"));
        assert_eq!(sets[0].command_list[0].command[1], "{cruiseID}");
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "site_root = \"http://10.0.0.2/\"").unwrap();
        let config = PurserConfig::load(file.path()).unwrap();
        assert_eq!(config.site_root, "http://10.0.0.2/");
        // Unlisted keys keep their defaults.
        assert_eq!(config.transfer_interval, 5);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(PurserConfig::load(Path::new("/nonexistent/purser.toml")).is_err());
    }
}
