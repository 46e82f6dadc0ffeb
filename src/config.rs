use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sandbox::error::{Error, Result};
use crate::util::fs::atomic_write;

/// Which isolation backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pick per platform: docker on Linux, vm on macOS.
    #[default]
    Auto,
    Docker,
    Vm,
    Seatbelt,
}

impl BackendKind {
    /// Resolve `auto` to a concrete backend for this host.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto => {
                if cfg!(target_os = "macos") {
                    BackendKind::Vm
                } else {
                    BackendKind::Docker
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Auto => "auto",
            BackendKind::Docker => "docker",
            BackendKind::Vm => "vm",
            BackendKind::Seatbelt => "seatbelt",
        })
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(BackendKind::Auto),
            "docker" => Ok(BackendKind::Docker),
            "vm" => Ok(BackendKind::Vm),
            "seatbelt" => Ok(BackendKind::Seatbelt),
            other => Err(Error::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Which tmux configuration the in-instance session sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TmuxConfPolicy {
    /// The packaged configuration.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// The user's own `~/.tmux.conf`.
    #[serde(rename = "host")]
    Host,
    /// Both, host last so it wins.
    #[serde(rename = "default+host")]
    DefaultPlusHost,
    #[serde(rename = "none")]
    None,
}

impl TmuxConfPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TmuxConfPolicy::Default => "default",
            TmuxConfPolicy::Host => "host",
            TmuxConfPolicy::DefaultPlusHost => "default+host",
            TmuxConfPolicy::None => "none",
        }
    }
}

/// Strategy for materializing copy-mode directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStrategy {
    /// Currently resolves to `full`.
    #[default]
    Auto,
    Full,
    /// Reserved: read-only lower + upper dir, mounted by the entrypoint.
    Overlay,
}

/// User configuration, read from `profiles/<profile>/config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub backend: BackendKind,
    /// Override for the instance image reference.
    pub image: Option<String>,
    /// CLI used by the VM driver.
    pub vm_cli: Option<String>,
    pub tmux_conf: TmuxConfPolicy,
    pub copy_strategy: CopyStrategy,
    pub cpus: Option<f64>,
    pub memory: Option<String>,
    pub debug: bool,
}

impl UserConfig {
    pub fn config_path(profile_dir: &Path) -> PathBuf {
        profile_dir.join("config.yaml")
    }

    /// Load the profile config; absent file yields defaults.
    pub fn load(profile_dir: &Path) -> Result<UserConfig> {
        let path = Self::config_path(profile_dir);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_yaml(&text)
                .map_err(|e| Error::Config(format!("parse {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UserConfig::default()),
            Err(e) => Err(Error::Config(format!("read {}: {e}", path.display()))),
        }
    }

    /// Parse from raw YAML. Split out so tests never touch the filesystem.
    pub fn from_yaml(text: &str) -> std::result::Result<UserConfig, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(UserConfig::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn save(&self, profile_dir: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| Error::Other(format!("serialize config: {e}")))?;
        std::fs::create_dir_all(profile_dir)
            .map_err(|e| Error::io("create profile dir", e))?;
        atomic_write(&Self::config_path(profile_dir), yaml.as_bytes())
            .map_err(|e| Error::io("write config.yaml", e))
    }

    /// Read one field by key, rendered as YAML scalar text.
    pub fn get(&self, key: &str) -> Result<String> {
        let value = self.as_value()?;
        match value.get(key) {
            Some(v) => Ok(serde_yaml::to_string(v)
                .map(|s| s.trim_end().to_string())
                .unwrap_or_default()),
            None => Err(Error::Config(format!("unknown config key '{key}'"))),
        }
    }

    /// Set one field by key from YAML scalar text, validating the result.
    pub fn set(&self, key: &str, raw: &str) -> Result<UserConfig> {
        let mut value = self.as_value()?;
        let map = value
            .as_mapping_mut()
            .ok_or_else(|| Error::Config("config is not a mapping".into()))?;
        let yaml_key = serde_yaml::Value::String(key.to_string());
        if !map.contains_key(&yaml_key) {
            return Err(Error::Config(format!("unknown config key '{key}'")));
        }
        let parsed: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid value for '{key}': {e}")))?;
        map.insert(yaml_key, parsed);
        serde_yaml::from_value(value)
            .map_err(|e| Error::Config(format!("invalid value for '{key}': {e}")))
    }

    fn as_value(&self) -> Result<serde_yaml::Value> {
        serde_yaml::to_value(self).map_err(|e| Error::Other(format!("serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_is_defaults() {
        let cfg = UserConfig::from_yaml("").unwrap();
        assert_eq!(cfg.backend, BackendKind::Auto);
        assert_eq!(cfg.tmux_conf, TmuxConfPolicy::Default);
        assert!(!cfg.debug);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg = UserConfig::from_yaml("backend: docker\ndebug: true\n").unwrap();
        assert_eq!(cfg.backend, BackendKind::Docker);
        assert!(cfg.debug);
        assert_eq!(cfg.copy_strategy, CopyStrategy::Auto);
    }

    #[test]
    fn tmux_policy_spelling() {
        let cfg = UserConfig::from_yaml("tmux_conf: default+host\n").unwrap();
        assert_eq!(cfg.tmux_conf, TmuxConfPolicy::DefaultPlusHost);
        assert_eq!(cfg.tmux_conf.as_str(), "default+host");
    }

    #[test]
    fn auto_backend_resolves_per_platform() {
        let resolved = BackendKind::Auto.resolve();
        if cfg!(target_os = "macos") {
            assert_eq!(resolved, BackendKind::Vm);
        } else {
            assert_eq!(resolved, BackendKind::Docker);
        }
        assert_eq!(BackendKind::Seatbelt.resolve(), BackendKind::Seatbelt);
    }

    #[test]
    fn get_set_round_trip() {
        let cfg = UserConfig::default();
        let updated = cfg.set("backend", "seatbelt").unwrap();
        assert_eq!(updated.backend, BackendKind::Seatbelt);
        assert_eq!(updated.get("backend").unwrap(), "seatbelt");
    }

    #[test]
    fn set_unknown_key_fails() {
        let cfg = UserConfig::default();
        let err = cfg.set("no_such_key", "1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn set_invalid_value_fails() {
        let cfg = UserConfig::default();
        let err = cfg.set("backend", "warpdrive").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = UserConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.backend, BackendKind::Auto);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = UserConfig::default();
        cfg.backend = BackendKind::Docker;
        cfg.memory = Some("4g".into());
        cfg.save(dir.path()).unwrap();

        let loaded = UserConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.backend, BackendKind::Docker);
        assert_eq!(loaded.memory.as_deref(), Some("4g"));
    }
}
