//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! After the file is read, `BACKEND_BASE`, `INFLUXDB_URL`, `INFLUXDB_ORG`,
//! `INFLUXDB_BUCKET`, `INFLUXDB_TOKEN` and `DEBUG_LEVEL` override their
//! file counterparts. The result is validated once and never changes.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Path of the completed-mission stream on the backend
pub const MISSION_STREAM_PATH: &str = "/v1/missions/flow/completed";

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_project_name")]
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self { name: default_project_name() }
    }
}

fn default_project_name() -> String {
    "crewstand LightGBM Classifier".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend host and port, e.g. "backend:8080"
    pub base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    /// HTTP timeout for queries and writes
    #[serde(default = "default_influx_timeout_ms")]
    pub timeout_ms: u64,
    /// `id` tag of the flowmeter whose readings are aggregated
    #[serde(default = "default_flowmeter_id")]
    pub flowmeter_id: String,
}

fn default_influx_timeout_ms() -> u64 {
    250
}

fn default_flowmeter_id() -> String {
    "0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// LightGBM model exported with `dump_model()` as JSON
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// Labels in the model's class-index order
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { model_path: default_model_path(), classes: default_classes() }
    }
}

fn default_model_path() -> String {
    "model.json".to_string()
}

/// Sorted label set, as a scikit-learn style classifier orders its classes
fn default_classes() -> Vec<String> {
    ["Bathtub", "ClothesWasher", "Dishwasher", "Faucet", "Shower", "Toilet", "other"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_server_port() }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    pub backend: BackendConfig,
    pub influxdb: InfluxConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    project_name: String,
    version: String,
    backend_base: String,
    influx_url: String,
    influx_org: String,
    influx_bucket: String,
    influx_token: String,
    influx_timeout_ms: u64,
    flowmeter_id: String,
    model_path: String,
    classes: Vec<String>,
    bind_address: String,
    server_port: u16,
    log_level: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            version: version_string(),
            backend_base: "localhost:8080".to_string(),
            influx_url: "http://localhost:8086".to_string(),
            influx_org: "crewstand".to_string(),
            influx_bucket: "flow".to_string(),
            influx_token: String::new(),
            influx_timeout_ms: default_influx_timeout_ms(),
            flowmeter_id: default_flowmeter_id(),
            model_path: default_model_path(),
            classes: default_classes(),
            bind_address: default_bind_address(),
            server_port: default_server_port(),
            log_level: default_log_level(),
            metrics_interval_secs: default_metrics_interval(),
            config_file: "default".to_string(),
        }
    }
}

/// Crate version plus the git hash captured at build time
pub fn version_string() -> String {
    format!("{}+{}", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"))
}

impl Config {
    /// Load, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            project_name: toml_config.project.name,
            version: version_string(),
            backend_base: toml_config.backend.base,
            influx_url: toml_config.influxdb.url,
            influx_org: toml_config.influxdb.org,
            influx_bucket: toml_config.influxdb.bucket,
            influx_token: toml_config.influxdb.token,
            influx_timeout_ms: toml_config.influxdb.timeout_ms,
            flowmeter_id: toml_config.influxdb.flowmeter_id,
            model_path: toml_config.classifier.model_path,
            classes: toml_config.classifier.classes,
            bind_address: toml_config.server.bind_address,
            server_port: toml_config.server.port,
            log_level: toml_config.log.level,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        })
    }

    /// Override settings from an environment-like lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets: [(&str, &mut String); 6] = [
            ("BACKEND_BASE", &mut self.backend_base),
            ("INFLUXDB_URL", &mut self.influx_url),
            ("INFLUXDB_ORG", &mut self.influx_org),
            ("INFLUXDB_BUCKET", &mut self.influx_bucket),
            ("INFLUXDB_TOKEN", &mut self.influx_token),
            ("DEBUG_LEVEL", &mut self.log_level),
        ];
        for (key, target) in targets {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        }
    }

    /// Reject settings the service cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("backend.base", &self.backend_base),
            ("influxdb.url", &self.influx_url),
            ("influxdb.org", &self.influx_org),
            ("influxdb.bucket", &self.influx_bucket),
            ("influxdb.token", &self.influx_token),
            ("classifier.model_path", &self.model_path),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                bail!("missing required setting {name}");
            }
        }

        if !(self.influx_url.starts_with("http://") || self.influx_url.starts_with("https://")) {
            bail!("influxdb.url must be an http(s) URL, got {:?}", self.influx_url);
        }
        if self.classes.is_empty() {
            bail!("classifier.classes must not be empty");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics.interval_secs must be > 0");
        }
        Ok(())
    }

    /// Websocket URL of the completed-mission stream
    pub fn mission_stream_url(&self) -> String {
        let base = self.backend_base.trim_end_matches('/');
        if base.starts_with("ws://") || base.starts_with("wss://") {
            format!("{base}{MISSION_STREAM_PATH}")
        } else {
            format!("ws://{base}{MISSION_STREAM_PATH}")
        }
    }

    // Getters for all config fields
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn backend_base(&self) -> &str {
        &self.backend_base
    }

    pub fn influx_url(&self) -> &str {
        &self.influx_url
    }

    pub fn influx_org(&self) -> &str {
        &self.influx_org
    }

    pub fn influx_bucket(&self) -> &str {
        &self.influx_bucket
    }

    pub fn influx_token(&self) -> &str {
        &self.influx_token
    }

    pub fn influx_timeout_ms(&self) -> u64 {
        self.influx_timeout_ms
    }

    pub fn flowmeter_id(&self) -> &str {
        &self.flowmeter_id
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend_base(), "localhost:8080");
        assert_eq!(config.influx_timeout_ms(), 250);
        assert_eq!(config.flowmeter_id(), "0");
        assert_eq!(config.server_port(), 8000);
        assert_eq!(config.classes().len(), 7);
        assert_eq!(config.classes().last().map(String::as_str), Some("other"));
    }

    #[test]
    fn test_missing_project_table_uses_default_name() {
        let parsed: TomlConfig = toml::from_str(
            r#"
[backend]
base = "backend:8080"

[influxdb]
url = "http://influx:8086"
org = "o"
bucket = "b"
token = "t"
"#,
        )
        .unwrap();
        assert_eq!(parsed.project.name, "crewstand LightGBM Classifier");
        assert_eq!(ProjectConfig::default().name, "crewstand LightGBM Classifier");
    }

    #[test]
    fn test_mission_stream_url() {
        let mut config = Config::default();
        assert_eq!(config.mission_stream_url(), "ws://localhost:8080/v1/missions/flow/completed");

        config.backend_base = "wss://backend.example/".to_string();
        assert_eq!(config.mission_stream_url(), "wss://backend.example/v1/missions/flow/completed");
    }

    #[test]
    fn test_apply_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([("INFLUXDB_TOKEN", "secret"), ("DEBUG_LEVEL", "debug")]);
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.influx_token(), "secret");
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.influx_org(), "crewstand");
    }

    #[test]
    fn test_validate_requires_token() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("influxdb.token"));
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let mut config = Config::default();
        config.influx_token = "t".to_string();
        assert!(config.validate().is_ok());

        config.influx_url = "localhost:8086".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_version_has_git_hash() {
        let version = version_string();
        assert!(version.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(version.contains('+'));
    }
}
