//! Data-dashboard manifest index and parser-plugin invocation.
//!
//! The manifest is a JSON array mapping each raw data file (`raw_data`,
//! relative to the warehouse base) to the parsed summary the dashboard
//! serves (`dd_json`). It is rewritten wholesale on every mutation; removing
//! an entry also removes the orphaned `dd_json` file.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub dd_json: String,
    pub raw_data: String,
}

/// The manifest file, keyed by `raw_data`.
#[derive(Debug, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an existing manifest. A missing file is an empty manifest;
    /// malformed JSON is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("manifest file not found, starting empty: {}", path.display());
                return Ok(Self::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("error reading manifest file {}", path.display()));
            }
        };

        let entries = serde_json::from_str(&content)
            .with_context(|| format!("error parsing manifest file {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn contains(&self, raw_data: &str) -> bool {
        self.entries.iter().any(|e| e.raw_data == raw_data)
    }

    /// Add the entry unless a row for the same `raw_data` already exists.
    /// Returns true when the entry was appended (new), false when an entry
    /// was already present (treated as an update of the dd_json contents).
    pub fn upsert(&mut self, entry: ManifestEntry) -> bool {
        if self.contains(&entry.raw_data) {
            false
        } else {
            self.entries.push(entry);
            true
        }
    }

    /// Remove rows matching `raw_data` values, deleting each orphaned
    /// `dd_json` file under `base_dir`. Returns the number of rows removed.
    pub fn remove(&mut self, removals: &[ManifestEntry], base_dir: &Path) -> usize {
        let mut removed = 0;
        for removal in removals {
            let before = self.entries.len();
            self.entries.retain(|e| e.raw_data != removal.raw_data);
            if self.entries.len() == before {
                continue;
            }
            removed += before - self.entries.len();

            let dd_json_path = base_dir.join(&removal.dd_json);
            if dd_json_path.is_file() {
                info!("deleting orphaned dd_json file {}", dd_json_path.display());
                if let Err(err) = fs::remove_file(&dd_json_path) {
                    warn!("could not delete {}: {err}", dd_json_path.display());
                }
            }
        }
        removed
    }

    /// Rewrite the manifest atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        crate::fsutil::write_json_atomic(path, &self.entries)
    }
}

/// A collection system's parser plugin:
/// `{plugin_dir}/{collection_system_name.lower()}{plugin_suffix}`.
#[derive(Debug, Clone)]
pub struct Plugin {
    path: PathBuf,
}

/// Output of one plugin invocation.
#[derive(Debug)]
pub struct PluginOutput {
    pub stdout: String,
    pub stderr: String,
    /// Rendered command line, used in operator-facing failure messages.
    pub command: String,
}

impl Plugin {
    /// Locate the plugin for a collection system; `None` when the file does
    /// not exist.
    pub fn locate(plugin_dir: &Path, collection_system_name: &str, suffix: &str) -> Option<Self> {
        let path = plugin_dir.join(format!("{}{suffix}", collection_system_name.to_lowercase()));
        debug!("processing script filename: {}", path.display());
        path.is_file().then_some(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn run(&self, args: &[&str]) -> Result<PluginOutput> {
        let output = Command::new(&self.path)
            .args(args)
            .output()
            .with_context(|| format!("failed to run plugin {}", self.path.display()))?;

        Ok(PluginOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            command: format!("{} {}", self.path.display(), args.join(" ")),
        })
    }

    /// First invocation: ask the plugin for the file's semantic data type.
    pub fn data_type(&self, raw_path: &Path) -> Result<PluginOutput> {
        self.run(&["--dataType", &raw_path.to_string_lossy()])
    }

    /// Second invocation: parse the file into dashboard JSON.
    pub fn process(&self, raw_path: &Path) -> Result<PluginOutput> {
        self.run(&[&raw_path.to_string_lossy()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn entry(data_type: &str, dd_json: &str, raw_data: &str) -> ManifestEntry {
        ManifestEntry {
            data_type: Some(data_type.to_string()),
            dd_json: dd_json.to_string(),
            raw_data: raw_data.to_string(),
        }
    }

    #[test]
    fn load_missing_manifest_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(&tmp.path().join("manifest.json")).unwrap();
        assert!(manifest.entries().is_empty());
    }

    #[test]
    fn load_malformed_manifest_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        fs::write(&path, "not json").unwrap();
        assert!(Manifest::load(&path).is_err());
    }

    #[test]
    fn upsert_distinguishes_new_from_update() {
        let mut manifest = Manifest::new();
        assert!(manifest.upsert(entry("gga", "FK/DD/nav.json", "FK/SCS/nav.raw")));
        assert!(!manifest.upsert(entry("gga", "FK/DD/nav.json", "FK/SCS/nav.raw")));
        assert_eq!(manifest.entries().len(), 1);
    }

    #[test]
    fn remove_deletes_orphaned_dd_json() {
        let tmp = tempfile::tempdir().unwrap();
        let dd_json_rel = "FK/Dashboard_Data/nav.json";
        let dd_json_abs = tmp.path().join(dd_json_rel);
        fs::create_dir_all(dd_json_abs.parent().unwrap()).unwrap();
        fs::write(&dd_json_abs, b"{}").unwrap();

        let mut manifest = Manifest::new();
        manifest.upsert(entry("gga", dd_json_rel, "FK/SCS/nav.raw"));

        let removed = manifest.remove(
            &[entry("gga", dd_json_rel, "FK/SCS/nav.raw")],
            tmp.path(),
        );

        assert_eq!(removed, 1);
        assert!(manifest.entries().is_empty());
        assert!(!dd_json_abs.exists());
    }

    #[test]
    fn write_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");

        let mut manifest = Manifest::new();
        manifest.upsert(entry("geotiff", "FK/DD/m.json", "FK/EM124/m.tif"));
        manifest.write(&path).unwrap();

        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.entries(), manifest.entries());
        // Wire field name is `type`.
        assert!(fs::read_to_string(&path).unwrap().contains("\"type\""));
    }

    #[test]
    fn plugin_locate_lowercases_name() {
        let tmp = tempfile::tempdir().unwrap();
        let plugin_path = tmp.path().join("scs_parser");
        fs::write(&plugin_path, "#!/bin/sh\necho gga\n").unwrap();
        fs::set_permissions(&plugin_path, fs::Permissions::from_mode(0o755)).unwrap();

        let plugin = Plugin::locate(tmp.path(), "SCS", "_parser").unwrap();
        assert_eq!(plugin.path(), plugin_path);
        assert!(Plugin::locate(tmp.path(), "EM124", "_parser").is_none());
    }

    #[test]
    fn plugin_invocations_capture_output() {
        let tmp = tempfile::tempdir().unwrap();
        let plugin_path = tmp.path().join("scs_parser");
        fs::write(
            &plugin_path,
            "#!/bin/sh\nif [ \"$1\" = \"--dataType\" ]; then echo gga; else echo '{\"ok\":true}'; fi\n",
        )
        .unwrap();
        fs::set_permissions(&plugin_path, fs::Permissions::from_mode(0o755)).unwrap();

        let plugin = Plugin::locate(tmp.path(), "SCS", "_parser").unwrap();
        let raw = tmp.path().join("nav.raw");

        let probe = plugin.data_type(&raw).unwrap();
        assert_eq!(probe.stdout, "gga");
        assert!(probe.command.contains("--dataType"));

        let parsed = plugin.process(&raw).unwrap();
        assert_eq!(parsed.stdout, "{\"ok\":true}");
    }
}
