use anyhow::{Context, Result};
use engine::{EngineSettings, HubSettings, LimiterSettings, MonitorSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default = "default_api_addr")]
    pub api_addr: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Daily rolling log files go here; stdout when unset.
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub limits: LimiterSettings,

    #[serde(default)]
    pub hub: HubSettings,
}

fn default_api_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> String {
    "data/panel.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "panel.log".to_string()
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            api_addr: default_api_addr(),
            database_path: default_database_path(),
            log_level: default_log_level(),
            log_dir: None,
            log_file: default_log_file(),
            engine: EngineSettings::default(),
            monitor: MonitorSettings::default(),
            limits: LimiterSettings::default(),
            hub: HubSettings::default(),
        }
    }
}

impl PanelConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        Ok(config)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_config_uses_defaults() {
        let file = create_temp_file("");
        let config = PanelConfig::load(file.path()).unwrap();

        assert_eq!(config.api_addr, "0.0.0.0:8080");
        assert_eq!(config.database_path, "data/panel.db");
        assert!(config.log_dir.is_none());
        assert_eq!(config.monitor.tick_interval_ms, 1000);
        assert_eq!(config.monitor.flush_every_ticks, 10);
        assert_eq!(config.limits.default_identity, "__DEFAULT__");
        assert_eq!(config.hub.subscriber_capacity, 100);
        assert_eq!(config.engine.settle_delay_ms, 1000);
    }

    #[test]
    fn sections_override_defaults() {
        let content = r#"
api_addr = "127.0.0.1:9000"
log_level = "debug"
log_dir = "logs"

[engine]
singbox_binary = "/usr/local/bin/sing-box"
accounting_relay = false

[monitor]
flush_every_ticks = 5
single_user_fallback = false

[limits]
burst_ceiling_bytes = 1048576

[hub]
keepalive_secs = 30
"#;
        let file = create_temp_file(content);
        let config = PanelConfig::load(file.path()).unwrap();

        assert_eq!(config.api_addr, "127.0.0.1:9000");
        assert_eq!(config.log_dir.as_deref(), Some("logs"));
        assert_eq!(config.engine.singbox_binary, "/usr/local/bin/sing-box");
        assert!(!config.engine.accounting_relay);
        assert_eq!(config.engine.xray_binary, "xray");
        assert_eq!(config.monitor.flush_every_ticks, 5);
        assert!(!config.monitor.single_user_fallback);
        assert_eq!(config.limits.burst_ceiling_bytes, 1048576);
        assert_eq!(config.limits.burst_floor_bytes, 64 * 1024);
        assert_eq!(config.hub.keepalive_secs, 30);
    }

    #[test]
    fn invalid_config_is_an_error() {
        let file = create_temp_file("api_addr = [");
        assert!(PanelConfig::load(file.path()).is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        assert!(PanelConfig::load("/nonexistent/panel.toml").is_err());
        let config = PanelConfig::load_or_default("/nonexistent/panel.toml").unwrap();
        assert_eq!(config.log_level, "info");
    }
}
