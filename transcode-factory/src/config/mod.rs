//! Process configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `TF_*` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::{PipelineConfig, StageLimits};
use crate::{Error, Result};

/// Config file used when neither `--config` nor `TF_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "transcode-factory.toml";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "TF_CONFIG";

/// Configuration of the transcode factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Concurrent encodes.
    pub transcode_limit: usize,
    /// Concurrent crop detections.
    pub crop_limit: usize,
    /// Concurrent remuxes.
    pub copy_limit: usize,
    /// SQLite database file.
    pub db_path: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Directory for per-job encoder logs.
    pub log_directory: PathBuf,
    /// Directory for the application's own rolling logs.
    pub app_log_directory: PathBuf,
    pub listen_address: String,
    pub listen_port: u16,
    /// Sleep between polls when a stage finds no work.
    pub poll_interval_ms: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl FactoryConfig {
    pub fn default_config() -> Self {
        Self {
            transcode_limit: 2,
            crop_limit: 2,
            copy_limit: 2,
            db_path: PathBuf::from("data/transcode-factory.db"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            log_directory: PathBuf::from("logs/encoder"),
            app_log_directory: PathBuf::from("logs"),
            listen_address: "0.0.0.0".to_string(),
            listen_port: 51218,
            poll_interval_ms: 2000,
        }
    }

    /// Load the file at `path` (defaults if it does not exist), apply the
    /// process environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the TOML file at `path`. A missing file yields the defaults.
    pub fn from_file(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path.filter(|p| p.exists()) else {
            debug!("No config file found, using defaults");
            return Ok(Self::default_config());
        };

        let content =
            std::fs::read_to_string(path).map_err(|e| Error::io_path("reading", path, e))?;
        Self::from_toml(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {e}")))
    }

    /// Override fields from `TF_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TF_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("TF_FFMPEG") {
            self.ffmpeg_path = v;
        }
        if let Some(v) = var("TF_FFPROBE") {
            self.ffprobe_path = v;
        }
        if let Some(v) = var("TF_LOG_PATH") {
            self.log_directory = PathBuf::from(v);
        }
        if let Some(v) = var("TF_TRANSCODELIMIT") {
            self.transcode_limit = parse_var("TF_TRANSCODELIMIT", &v)?;
        }
        if let Some(v) = var("TF_CROPLIMIT") {
            self.crop_limit = parse_var("TF_CROPLIMIT", &v)?;
        }
        if let Some(v) = var("TF_COPYLIMIT") {
            self.copy_limit = parse_var("TF_COPYLIMIT", &v)?;
        }
        if let Some(v) = var("TF_LISTEN_ADDRESS") {
            self.listen_address = v;
        }
        if let Some(v) = var("TF_LISTEN_PORT") {
            self.listen_port = parse_var("TF_LISTEN_PORT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, limit) in [
            ("transcode_limit", self.transcode_limit),
            ("crop_limit", self.crop_limit),
            ("copy_limit", self.copy_limit),
        ] {
            if limit < 1 {
                return Err(Error::config(format!("{name} must be at least 1")));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be positive"));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.listen_port)
            .parse()
            .map_err(|e| {
                Error::config(format!(
                    "invalid listen address {}:{}: {}",
                    self.listen_address, self.listen_port, e
                ))
            })
    }

    pub fn stage_limits(&self) -> StageLimits {
        StageLimits {
            crop: self.crop_limit,
            transcode: self.transcode_limit,
            copy: self.copy_limit,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            limits: self.stage_limits(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            log_directory: self.log_directory.clone(),
        }
    }
}

/// Resolve the config file path: explicit flag, then `TF_CONFIG`, then the default.
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{key}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FactoryConfig::default();
        assert_eq!(config.transcode_limit, 2);
        assert_eq!(config.crop_limit, 2);
        assert_eq!(config.copy_limit, 2);
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.listen_port, 51218);
        assert_eq!(config.poll_interval_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_only_given_fields() {
        let config = FactoryConfig::from_toml(
            r#"
            transcode_limit = 4
            ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
            "#,
        )
        .unwrap();
        assert_eq!(config.transcode_limit, 4);
        assert_eq!(config.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.crop_limit, 2);
        assert_eq!(config.ffprobe_path, "ffprobe");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = FactoryConfig::from_toml("transcode_limit = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FactoryConfig::from_file(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, FactoryConfig::default_config());
    }

    #[test]
    fn test_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factory.toml");
        std::fs::write(&path, "copy_limit = 5\nlisten_port = 8080\n").unwrap();
        let config = FactoryConfig::from_file(Some(&path)).unwrap();
        assert_eq!(config.copy_limit, 5);
        assert_eq!(config.listen_port, 8080);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FactoryConfig::default();
        config
            .apply_env(env(&[
                ("TF_DB_PATH", "/var/lib/tf/queue.db"),
                ("TF_FFMPEG", "/usr/local/bin/ffmpeg"),
                ("TF_TRANSCODELIMIT", "3"),
                ("TF_CROPLIMIT", " 1 "),
                ("TF_LISTEN_PORT", "9000"),
                ("TF_COPYLIMIT", ""),
            ]))
            .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/tf/queue.db"));
        assert_eq!(config.ffmpeg_path, "/usr/local/bin/ffmpeg");
        assert_eq!(config.transcode_limit, 3);
        assert_eq!(config.crop_limit, 1);
        assert_eq!(config.copy_limit, 2);
        assert_eq!(config.listen_port, 9000);
    }

    #[test]
    fn test_unparseable_env_limit_rejected() {
        let mut config = FactoryConfig::default();
        let err = config
            .apply_env(env(&[("TF_TRANSCODELIMIT", "two")]))
            .unwrap_err();
        assert!(err.to_string().contains("TF_TRANSCODELIMIT"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = FactoryConfig {
            crop_limit: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("crop_limit"));
    }

    #[test]
    fn test_pipeline_config_mapping() {
        let config = FactoryConfig {
            transcode_limit: 3,
            crop_limit: 1,
            copy_limit: 4,
            poll_interval_ms: 250,
            ..Default::default()
        };
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.limits.transcode, 3);
        assert_eq!(pipeline.limits.crop, 1);
        assert_eq!(pipeline.limits.copy, 4);
        assert_eq!(pipeline.poll_interval, Duration::from_millis(250));
        assert_eq!(pipeline.log_directory, PathBuf::from("logs/encoder"));
    }

    #[test]
    fn test_listen_addr() {
        let config = FactoryConfig::default();
        assert_eq!(config.listen_addr().unwrap().port(), 51218);

        let bad = FactoryConfig {
            listen_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
