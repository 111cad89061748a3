use courier_cache::{CacheConfig, RedisConfig};
use courier_realtime::RealtimeConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Redis configuration (shared cache tier and transport)
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.realtime.validate()?;
        self.cache.validate()?;
        self.redis.validate()?;

        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("config serialize error: {e}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    /// Default file looked up when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "courier.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., COURIER__REDIS__ENABLED=true
        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<AppConfig, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.redis.enabled);
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let cfg = AppConfig {
            logging: LoggingConfig {
                level: "loud".into(),
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("logging.level"));
    }

    #[test]
    fn test_section_errors_surface() {
        let mut cfg = AppConfig::default();
        cfg.realtime.event_buffer = 0;
        assert!(cfg.validate().unwrap_err().contains("event_buffer"));
    }

    #[test]
    fn test_renders_toml() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[realtime]"));
        assert!(rendered.contains("presence_room = \"online_users\""));
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.cache.local_capacity, 1000);
    }
}
