//! Instance config file
//!
//! An INI-style file lets an operator pin behavior locally, ahead of
//! anything the metadata service says. Sections and keys are
//! case-insensitive; a missing file is not an error, it just means every
//! lookup misses and the metadata layers decide.

use std::path::Path;

use configparser::ini::Ini;
use tracing::warn;

/// Host-specific location of the instance config file.
#[cfg(windows)]
pub const DEFAULT_CONFIG_PATH: &str =
    r"C:\Program Files\Google\Compute Engine\instance_configs.cfg";
#[cfg(not(windows))]
pub const DEFAULT_CONFIG_PATH: &str = "/etc/default/instance_configs.cfg";

/// Parsed instance config with typed, defaulting lookups.
#[derive(Debug)]
pub struct InstanceConfig {
    ini: Ini,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self { ini: Ini::new() }
    }
}

impl InstanceConfig {
    /// Loads the config file at `path`. A missing file yields an empty
    /// config; an unreadable or malformed one is logged and also yields
    /// an empty config, since local config must never stop the agent.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut ini = Ini::new();
        if path.exists() {
            if let Err(err) = ini.load(path) {
                warn!("failed to parse config file {}: {err}", path.display());
                ini = Ini::new();
            }
        }
        Self { ini }
    }

    /// Parses config from a string (tests).
    pub fn from_str(content: &str) -> Self {
        let mut ini = Ini::new();
        if let Err(err) = ini.read(content.to_string()) {
            warn!("failed to parse config: {err}");
            ini = Ini::new();
        }
        Self { ini }
    }

    pub fn get_str(&self, section: &str, key: &str) -> Option<String> {
        self.ini.get(section, key)
    }

    /// Boolean lookup accepting 1/0/true/false spellings. Values that do
    /// not parse count as unset.
    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.ini.getboolcoerce(section, key).ok().flatten()
    }

    pub fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        self.ini.getint(section, key).ok().flatten()
    }
}

/// The precedence walk every manager uses for its enable flags:
/// config file, then instance attribute, then project attribute, then
/// the built-in default. A layer only resolves the question when it
/// holds a parseable boolean; anything else defers downward.
pub fn resolve_flag(
    config: Option<bool>,
    instance: Option<bool>,
    project: Option<bool>,
    default: bool,
) -> bool {
    config.or(instance).or(project).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let cfg = InstanceConfig::from_str("[AccountManager]\nDisable = true\nPort = COM3\n");
        assert_eq!(cfg.get_bool("accountmanager", "disable"), Some(true));
        assert_eq!(cfg.get_str("ACCOUNTMANAGER", "port").as_deref(), Some("COM3"));
    }

    #[test]
    fn test_typed_coercions() {
        let cfg = InstanceConfig::from_str("[snapshots]\ntimeout_in_seconds = 30\nenabled = 1\n");
        assert_eq!(cfg.get_int("snapshots", "timeout_in_seconds"), Some(30));
        assert_eq!(cfg.get_bool("snapshots", "enabled"), Some(true));
        assert_eq!(cfg.get_bool("snapshots", "missing"), None);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let cfg = InstanceConfig::load("/nonexistent/instance_configs.cfg");
        assert_eq!(cfg.get_str("any", "thing"), None);
    }

    #[test]
    fn test_resolve_flag_precedence() {
        // Config wins over everything.
        assert!(resolve_flag(Some(true), Some(false), Some(false), false));
        // Instance wins over project.
        assert!(!resolve_flag(None, Some(false), Some(true), true));
        // Project wins over the default.
        assert!(resolve_flag(None, None, Some(true), false));
        // Nothing set: built-in default.
        assert!(resolve_flag(None, None, None, true));
        assert!(!resolve_flag(None, None, None, false));
    }
}
