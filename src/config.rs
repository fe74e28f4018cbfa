//! Configuration management for the crash round engine
//!
//! Defaults, TOML file loading, environment variable overrides and
//! validation.

use crate::errors::{ConfigurationError, CrashResult};
use serde::{Deserialize, Serialize};
use std::{env, path::Path, time::Duration};

/// Longest start delay a round may be scheduled with (one day)
pub const MAX_START_DELAY_SECS: f64 = 86_400.0;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Round defaults and engine limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Growth constant of `m(t) = exp(k * t)` when a request does not set one
    pub default_k: f64,
    /// Delay between round creation and start
    pub default_start_delay_secs: f64,
    /// Crashed rounds kept in memory for lookup and verification
    pub history_capacity: usize,
    /// Capacity of the round event broadcast channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_k: 0.25,
            default_start_delay_secs: 2.0,
            history_capacity: 256,
            event_buffer: 4_096,
        }
    }
}

/// Tick loop settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// Rounds ticked in parallel per tick
    pub max_concurrent_rounds: usize,
    /// Keep a round scheduled at all times
    pub auto_start_rounds: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            max_concurrent_rounds: 16,
            auto_start_rounds: false,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Persistence settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Run without a store (ephemeral ids only)
    pub enabled: bool,
    pub data_directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_directory: "./DB/crash_data".to_string(),
        }
    }
}

/// HTTP server settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

/// Logging settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "crashpoint=info,tower_http=info".to_string(),
            enable_metrics: true,
        }
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> CrashResult<CrashConfig> {
        let mut config = match &self.config_path {
            Some(path) => self.load_from_file(path)?,
            None => CrashConfig::default(),
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> CrashResult<CrashConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut CrashConfig) -> CrashResult<()> {
        if let Ok(host) = env::var("CRASHPOINT_HOST") {
            config.api.host = host;
        }
        // PORT is honoured for platform deployments; the prefixed variable wins
        for key in ["PORT", "CRASHPOINT_PORT"] {
            if let Ok(port) = env::var(key) {
                config.api.port = parse_env(key, port, "Invalid port number")?;
            }
        }
        if let Ok(dir) = env::var("CRASHPOINT_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Ok(enabled) = env::var("CRASHPOINT_STORAGE_ENABLED") {
            config.storage.enabled = parse_env("CRASHPOINT_STORAGE_ENABLED", enabled, "Invalid boolean value")?;
        }
        if let Ok(ms) = env::var("CRASHPOINT_TICK_MS") {
            config.scheduler.tick_interval_ms = parse_env("CRASHPOINT_TICK_MS", ms, "Invalid tick interval")?;
        }
        if let Ok(auto) = env::var("CRASHPOINT_AUTO_ROUNDS") {
            config.scheduler.auto_start_rounds = parse_env("CRASHPOINT_AUTO_ROUNDS", auto, "Invalid boolean value")?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &CrashConfig) -> CrashResult<()> {
        let k = config.engine.default_k;
        if !k.is_finite() || k <= 0.0 {
            return Err(invalid("engine.default_k", k, "Growth constant must be positive"));
        }

        let delay = config.engine.default_start_delay_secs;
        if !delay.is_finite() || delay < 0.0 {
            return Err(invalid("engine.default_start_delay_secs", delay, "Delay cannot be negative"));
        }
        if delay > MAX_START_DELAY_SECS {
            return Err(invalid("engine.default_start_delay_secs", delay, "Delay cannot exceed one day"));
        }

        if config.engine.history_capacity == 0 {
            return Err(invalid("engine.history_capacity", 0, "History capacity cannot be zero"));
        }

        if config.engine.event_buffer == 0 {
            return Err(invalid("engine.event_buffer", 0, "Event buffer cannot be zero"));
        }

        if config.scheduler.tick_interval_ms < 10 {
            return Err(invalid(
                "scheduler.tick_interval_ms",
                config.scheduler.tick_interval_ms,
                "Tick interval must be at least 10ms",
            ));
        }

        if config.scheduler.max_concurrent_rounds == 0 {
            return Err(invalid("scheduler.max_concurrent_rounds", 0, "Concurrency cannot be zero"));
        }

        if config.api.port == 0 {
            return Err(invalid("api.port", 0, "Port cannot be zero"));
        }

        if config.storage.enabled && config.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()).into());
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &CrashConfig, path: &str) -> CrashResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: String, reason: &str) -> CrashResult<T> {
    value.trim().parse().map_err(|_| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            value,
            reason: reason.to_string(),
        }
        .into()
    })
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::errors::CrashError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Builder for programmatic configuration (tests, embedding)
pub struct ConfigBuilder {
    config: CrashConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CrashConfig::default(),
        }
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn api(mut self, api: ApiConfig) -> Self {
        self.config.api = api;
        self
    }

    pub fn build(self) -> CrashConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config(path: &str) -> CrashResult<()> {
    ConfigLoader::new().save(&CrashConfig::default(), path)
}
