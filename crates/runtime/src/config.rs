//! Runtime configuration.
//!
//! Loaded from a TOML, YAML or JSON file (chosen by extension), then
//! overridden by `WARDEN_*` environment variables. A `.env` file in the
//! working directory is honoured.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use warden_engine::bundle::VerificationConfig;
use warden_engine::EngineConfig;

use crate::error::{Result, RuntimeError};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_opt(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_u64(key: &str) -> Option<u64> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifies this runtime in logs and status reports.
    pub instance_id: String,
    /// Maximum compile errors reported per compilation; 0 means unlimited.
    pub plugins_error_limit: usize,
    pub graceful_shutdown_period_seconds: u64,
    pub max_plugin_wait_time_seconds: u64,
    pub store: StoreKind,
    pub flags: Flags,
    pub local_bundles: LocalBundlesConfig,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            plugins_error_limit: 0,
            graceful_shutdown_period_seconds: 5,
            max_plugin_wait_time_seconds: 30,
            store: StoreKind::default(),
            flags: Flags::default(),
            local_bundles: LocalBundlesConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Inmem,
    /// In-memory store wrapped in a decorator that traces every operation.
    Traced,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    pub enable_status_plugin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBundlesConfig {
    /// Reload on filesystem changes under `paths`.
    pub watch: bool,
    /// Reference of an OCI-layout policy image to load from the file store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_policy_image: Option<String>,
    /// Root of the OCI file store; defaults to `~/.policy`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_store_root: Option<PathBuf>,
    pub paths: Vec<PathBuf>,
    pub ignore: Vec<String>,
    pub skip_verification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationConfig>,
}

impl LocalBundlesConfig {
    pub fn file_store_root(&self) -> PathBuf {
        self.file_store_root
            .clone()
            .unwrap_or_else(crate::image::default_file_store_root)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.local_policy_image.is_none()
    }
}

impl Config {
    /// Parse a config file, picking the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let config = match ext.as_str() {
            "toml" => toml::from_str(&raw).map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?,
            "yaml" | "yml" => serde_yaml::from_str(&raw)
                .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?,
            "json" => serde_json::from_str(&raw)
                .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?,
            other => {
                return Err(RuntimeError::Config(format!(
                    "{}: unsupported config format {other:?}",
                    path.display()
                )))
            }
        };
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// `.env`, then the optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_dotenv();
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Override fields from `WARDEN_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Some(id) = env_opt("WARDEN_INSTANCE_ID") {
            self.instance_id = id;
        }
        if let Some(paths) = env_opt("WARDEN_LOCAL_BUNDLE_PATHS") {
            self.local_bundles.paths = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(image) = env_opt("WARDEN_LOCAL_POLICY_IMAGE") {
            self.local_bundles.local_policy_image = Some(image);
        }
        if let Some(watch) = env_bool("WARDEN_WATCH") {
            self.local_bundles.watch = watch;
        }
        if let Some(enabled) = env_bool("WARDEN_ENABLE_STATUS_PLUGIN") {
            self.flags.enable_status_plugin = enabled;
        }
        if let Some(secs) = env_u64("WARDEN_MAX_PLUGIN_WAIT_TIME_SECONDS") {
            self.max_plugin_wait_time_seconds = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mint_an_instance_id() {
        let a = Config::default();
        let b = Config::default();
        assert!(uuid::Uuid::parse_str(&a.instance_id).is_ok());
        assert_ne!(a.instance_id, b.instance_id);
        assert_eq!(a.store, StoreKind::Inmem);
    }

    #[test]
    fn parses_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("c.toml");
        fs::write(
            &toml_path,
            r#"
instance_id = "t1"
store = "traced"

[local_bundles]
watch = true
paths = ["./policies"]

[engine.services.acme]
url = "https://bundles.example.com"

[engine.bundles.main]
service = "acme"
"#,
        )
        .unwrap();
        let c = Config::from_file(&toml_path).unwrap();
        assert_eq!(c.instance_id, "t1");
        assert_eq!(c.store, StoreKind::Traced);
        assert!(c.local_bundles.watch);
        assert_eq!(c.engine.bundles["main"].service.as_deref(), Some("acme"));

        let yaml_path = dir.path().join("c.yaml");
        fs::write(
            &yaml_path,
            "instance_id: t2\nflags:\n  enable_status_plugin: true\nlocal_bundles:\n  local_policy_image: acme/policy:1\n",
        )
        .unwrap();
        let c = Config::from_file(&yaml_path).unwrap();
        assert!(c.flags.enable_status_plugin);
        assert_eq!(c.local_bundles.local_policy_image.as_deref(), Some("acme/policy:1"));

        let json_path = dir.path().join("c.json");
        fs::write(&json_path, r#"{"instance_id": "t3", "max_plugin_wait_time_seconds": 5}"#).unwrap();
        let c = Config::from_file(&json_path).unwrap();
        assert_eq!(c.max_plugin_wait_time_seconds, 5);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.ini");
        fs::write(&path, "x=1").unwrap();
        assert!(matches!(Config::from_file(&path), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn file_store_root_defaults_under_home() {
        let cfg = LocalBundlesConfig::default();
        assert!(cfg.file_store_root().ends_with(".policy"));
        let cfg = LocalBundlesConfig {
            file_store_root: Some(PathBuf::from("/srv/oci")),
            ..LocalBundlesConfig::default()
        };
        assert_eq!(cfg.file_store_root(), PathBuf::from("/srv/oci"));
    }
}
