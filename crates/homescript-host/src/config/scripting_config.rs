use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::project_dirs;
use crate::reload::ReloadSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Whether scripting is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory containing scripts (default: <data_dir>/scripts)
    #[serde(default)]
    pub script_dir: Option<PathBuf>,

    /// Per-script configuration (script ID -> config values)
    #[serde(default)]
    pub config: HashMap<String, toml::Value>,

    /// Whether hot reload is enabled (default: true)
    #[serde(default = "default_true")]
    pub hot_reload: bool,

    /// Hot reload scan interval in milliseconds (default: 1000ms)
    #[serde(default = "default_hot_reload_interval")]
    pub hot_reload_interval_ms: u64,

    /// How long a reload waits for running work to stop (default: 2000ms)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,

    /// Quiet period before a requested reload starts (default: 250ms)
    #[serde(default = "default_reload_debounce")]
    pub reload_debounce_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_hot_reload_interval() -> u64 {
    1000
}

fn default_stop_grace() -> u64 {
    2000
}

fn default_reload_debounce() -> u64 {
    250
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script_dir: None,
            config: HashMap::new(),
            hot_reload: true,
            hot_reload_interval_ms: default_hot_reload_interval(),
            stop_grace_ms: default_stop_grace(),
            reload_debounce_ms: default_reload_debounce(),
        }
    }
}

impl ScriptingConfig {
    /// Get the script directory path (use provided or default)
    pub fn script_dir(&self) -> PathBuf {
        self.script_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|p| p.data_dir().join("scripts"))
                .unwrap_or_else(|| PathBuf::from(".scripts"))
        })
    }

    pub fn hot_reload_interval(&self) -> Duration {
        Duration::from_millis(self.hot_reload_interval_ms)
    }

    pub fn reload_settings(&self) -> ReloadSettings {
        ReloadSettings {
            script_dir: self.script_dir(),
            script_config: self.config.clone(),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            debounce: Duration::from_millis(self.reload_debounce_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_uses_defaults() {
        let config: ScriptingConfig = toml::from_str("").unwrap();
        assert_eq!(config, ScriptingConfig::default());
        assert!(config.enabled);
        assert_eq!(config.hot_reload_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_reload_settings() {
        let config: ScriptingConfig = toml::from_str(
            r#"
            script_dir = "/srv/scripts"
            stop_grace_ms = 500
            reload_debounce_ms = 0

            [config.lights]
            enabled = false
            "#,
        )
        .unwrap();

        let settings = config.reload_settings();
        assert_eq!(settings.script_dir, PathBuf::from("/srv/scripts"));
        assert_eq!(settings.stop_grace, Duration::from_millis(500));
        assert!(settings.debounce.is_zero());
        assert!(settings.script_config.contains_key("lights"));
    }

    #[test]
    fn test_default_script_dir_is_named() {
        let config = ScriptingConfig::default();
        assert!(config.script_dir().ends_with("scripts"));
    }
}
