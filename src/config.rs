//! Core configuration for development and production environments
//!
//! The configuration is an immutable value built once at startup; every
//! component receives the subset it needs. Bridge-process environment
//! (`BOT_TOKEN`, `ALLOWED_USERS`) is discovered separately from an ordered
//! dotenv list because it belongs to the external process, not to the core.

use crate::domain_types::{
    FailureThreshold, MaxAttempts, PoolCapacity, Severity, SuccessThreshold, WindowMs,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// Log verbosity accepted from the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Maps to a `tracing` directive; `fatal` collapses to `error`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "fatal" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

/// Output shape of the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Simple,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" => Some(LogFormat::Pretty),
            "simple" => Some(LogFormat::Simple),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// When set, messages and metadata values run through the sanitizer
    pub secure_logging: bool,
}

/// Rate limiter configuration (global, per-client, per-tool, burst)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: WindowMs,
    /// Global ceiling per window
    pub max_requests: u32,
    pub per_client_max: u32,
    pub per_tool_max: u32,
    pub burst_window_ms: WindowMs,
    pub burst_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: WindowMs::default(),
            max_requests: 1000,
            per_client_max: 300,
            per_tool_max: 120,
            burst_window_ms: WindowMs::try_new(10_000).unwrap_or_default(),
            burst_max: 30,
        }
    }
}

/// Retry executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: MaxAttempts,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxAttempts::default(),
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: FailureThreshold,
    pub success_threshold: SuccessThreshold,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FailureThreshold::default(),
            success_threshold: SuccessThreshold::default(),
            recovery_timeout_ms: 30_000,
        }
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    pub max_pool_size: PoolCapacity,
    /// Resident-memory ceiling before the pool halves itself
    pub memory_pressure_mb: u64,
    pub gc_interval_secs: u64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: PoolCapacity::default(),
            memory_pressure_mb: 512,
            gc_interval_secs: 30,
        }
    }
}

/// One probed endpoint of the health checker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEndpointConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: Vec<u16>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub critical: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_expected_status() -> Vec<u16> {
    vec![200]
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

/// Health checker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub endpoints: Vec<HealthEndpointConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            endpoints: Vec::new(),
        }
    }
}

/// Security monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Additional case-insensitive patterns on top of the built-in injection set
    pub suspicious_patterns: Vec<String>,
    /// How long a `block` mitigation keeps an IP on the blocklist
    pub block_duration_secs: u64,
    /// Hours of per-client request history kept for the behavioral baseline
    pub baseline_retention_hours: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            suspicious_patterns: Vec::new(),
            block_duration_secs: 3600,
            baseline_retention_hours: 24,
        }
    }
}

/// Declarative alert rule loaded at init
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    pub metric: String,
    /// One of `gt | gte | lt | lte | eq | ne`
    pub condition: String,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Declarative alert channel loaded at init
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannelConfig {
    pub name: String,
    /// One of `telegram | email | slack | webhook | pagerduty`
    pub kind: String,
    #[serde(default)]
    pub target: String,
    /// Severities this channel accepts
    #[serde(default)]
    pub severities: Vec<Severity>,
}

/// Escalation ladder level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationLevelConfig {
    pub delay_secs: u64,
    pub channels: Vec<String>,
}

/// Alerting engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    pub rules: Vec<AlertRuleConfig>,
    pub channels: Vec<AlertChannelConfig>,
    pub escalation_levels: Vec<EscalationLevelConfig>,
    pub duplicate_window_secs: u64,
    pub max_alerts_per_minute: u32,
    pub dispatch_queue_limit: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            channels: Vec::new(),
            escalation_levels: Vec::new(),
            duplicate_window_secs: 300,
            max_alerts_per_minute: 10,
            dispatch_queue_limit: 1000,
        }
    }
}

/// Complete core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Drop-zone the core writes events into
    pub events_dir: PathBuf,
    /// Drop-zone the external bridge writes responses into
    pub responses_dir: PathBuf,
    /// Filename of the external delivery bridge executable
    pub bridge_executable: String,
    /// Port of the bridge's health/metrics endpoint
    pub health_port: u16,

    pub enable_auth: bool,
    pub default_api_key: Option<String>,

    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub buffer_pool: BufferPoolConfig,
    pub health: HealthConfig,
    pub security: SecurityConfig,
    pub alerting: AlertingConfig,
    pub log: LogConfig,

    /// Deployment environment tag stamped on log records
    pub environment: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::development()
    }
}

impl Config {
    /// Development preset: local drop-zones, relaxed limits, pretty logs
    pub fn development() -> Self {
        Self {
            events_dir: default_data_dir().join("events"),
            responses_dir: default_data_dir().join("responses"),
            bridge_executable: "cctelegram-bridge".to_string(),
            health_port: 8080,
            enable_auth: false,
            default_api_key: None,
            rate_limit: RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            },
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            buffer_pool: BufferPoolConfig::default(),
            health: HealthConfig::default(),
            security: SecurityConfig::default(),
            alerting: AlertingConfig::default(),
            log: LogConfig {
                level: LogLevel::Debug,
                format: LogFormat::Pretty,
                secure_logging: false,
            },
            environment: "development".to_string(),
        }
    }

    /// Production preset: auth on, rate limits on, sanitized JSON logs
    pub fn production() -> Self {
        Self {
            enable_auth: true,
            rate_limit: RateLimitConfig::default(),
            log: LogConfig {
                level: LogLevel::Info,
                format: LogFormat::Json,
                secure_logging: true,
            },
            environment: "production".to_string(),
            ..Self::development()
        }
    }

    /// Builds configuration from `TELEBRIDGE_*` environment variables over
    /// the development preset
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::development();

        if let Ok(dir) = std::env::var("TELEBRIDGE_EVENTS_DIR") {
            config.events_dir = expand_home(&dir);
        }
        if let Ok(dir) = std::env::var("TELEBRIDGE_RESPONSES_DIR") {
            config.responses_dir = expand_home(&dir);
        }
        if let Ok(exe) = std::env::var("TELEBRIDGE_BRIDGE_EXECUTABLE") {
            config.bridge_executable = exe;
        }
        if let Ok(port) = std::env::var("TELEBRIDGE_HEALTH_PORT") {
            config.health_port =
                port.parse()
                    .map_err(|_| ConfigError::ValidationError {
                        field: "health_port".to_string(),
                        reason: format!("not a valid port: {port}"),
                    })?;
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_ENABLE_AUTH") {
            config.enable_auth = parse_bool(&value);
        }
        if let Ok(key) = std::env::var("TELEBRIDGE_API_KEY") {
            if !key.is_empty() {
                config.default_api_key = Some(key);
            }
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_ENABLE_RATE_LIMIT") {
            config.rate_limit.enabled = parse_bool(&value);
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_RATE_WINDOW_MS") {
            let ms: u64 = value.parse().map_err(|_| ConfigError::ValidationError {
                field: "rate_limit.window_ms".to_string(),
                reason: format!("not a number: {value}"),
            })?;
            config.rate_limit.window_ms =
                WindowMs::try_new(ms).map_err(|e| ConfigError::ValidationError {
                    field: "rate_limit.window_ms".to_string(),
                    reason: e.to_string(),
                })?;
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_RATE_MAX_REQUESTS") {
            config.rate_limit.max_requests =
                value.parse().map_err(|_| ConfigError::ValidationError {
                    field: "rate_limit.max_requests".to_string(),
                    reason: format!("not a number: {value}"),
                })?;
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_LOG_LEVEL") {
            config.log.level =
                LogLevel::parse(&value).ok_or_else(|| ConfigError::ValidationError {
                    field: "log.level".to_string(),
                    reason: format!("unknown level: {value}"),
                })?;
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_LOG_FORMAT") {
            config.log.format =
                LogFormat::parse(&value).ok_or_else(|| ConfigError::ValidationError {
                    field: "log.format".to_string(),
                    reason: format!("unknown format: {value}"),
                })?;
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_SECURE_LOGGING") {
            config.log.secure_logging = parse_bool(&value);
        }
        if let Ok(value) = std::env::var("TELEBRIDGE_ENVIRONMENT") {
            config.environment = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge_executable.is_empty() {
            return Err(ConfigError::ValidationError {
                field: "bridge_executable".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.bridge_executable.contains(std::path::MAIN_SEPARATOR) {
            return Err(ConfigError::ValidationError {
                field: "bridge_executable".to_string(),
                reason: "must be a bare filename, not a path".to_string(),
            });
        }
        if self.enable_auth && self.default_api_key.is_none() {
            return Err(ConfigError::ValidationError {
                field: "default_api_key".to_string(),
                reason: "required when enable_auth is set".to_string(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError {
                field: "retry.base_delay_ms".to_string(),
                reason: "exceeds retry.max_delay_ms".to_string(),
            });
        }
        for rule in &self.alerting.rules {
            if !matches!(
                rule.condition.as_str(),
                "gt" | "gte" | "lt" | "lte" | "eq" | "ne"
            ) {
                return Err(ConfigError::ValidationError {
                    field: format!("alerting.rules.{}.condition", rule.name),
                    reason: format!("unknown condition: {}", rule.condition),
                });
            }
        }
        for channel in &self.alerting.channels {
            if !matches!(
                channel.kind.as_str(),
                "telegram" | "email" | "slack" | "webhook" | "pagerduty"
            ) {
                return Err(ConfigError::ValidationError {
                    field: format!("alerting.channels.{}.kind", channel.name),
                    reason: format!("unknown channel kind: {}", channel.kind),
                });
            }
        }
        Ok(())
    }

    /// Base URL of the bridge's local health endpoint
    pub fn bridge_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.health_port)
    }
}

/// Environment required by the external bridge process
///
/// Discovered from an ordered dotenv list; the first file providing the
/// complete set wins, but values already present in the real environment
/// are never overridden.
#[derive(Debug, Clone)]
pub struct BridgeEnv {
    pub vars: HashMap<String, String>,
}

impl BridgeEnv {
    /// Variables the bridge cannot run without
    pub const REQUIRED: [&'static str; 2] = ["BOT_TOKEN", "ALLOWED_USERS"];

    /// Default dotenv search order relative to the working directory
    pub fn default_candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(".env"), PathBuf::from(".env.local")];
        candidates.push(default_data_dir().join(".env"));
        candidates
    }

    /// Resolves the bridge environment from the process environment plus the
    /// ordered dotenv candidates
    ///
    /// Returns the resolved variables and the list of still-missing required
    /// names (empty when complete).
    pub fn discover(candidates: &[PathBuf]) -> (Self, Vec<String>) {
        let mut vars: HashMap<String, String> = HashMap::new();

        for name in Self::REQUIRED {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    vars.insert(name.to_string(), value);
                }
            }
        }

        for path in candidates {
            if vars.len() == Self::REQUIRED.len() {
                break;
            }
            let Ok(iter) = dotenvy::from_path_iter(path) else {
                continue;
            };
            let mut file_vars: HashMap<String, String> = HashMap::new();
            for item in iter.flatten() {
                file_vars.insert(item.0, item.1);
            }
            // first file carrying the complete remainder wins
            let completes = Self::REQUIRED
                .iter()
                .all(|name| vars.contains_key(*name) || file_vars.contains_key(*name));
            if completes {
                for name in Self::REQUIRED {
                    if !vars.contains_key(name) {
                        if let Some(value) = file_vars.get(name) {
                            vars.insert(name.to_string(), value.clone());
                        }
                    }
                }
            }
        }

        let missing = Self::REQUIRED
            .iter()
            .filter(|name| !vars.contains_key(**name))
            .map(|name| (*name).to_string())
            .collect();
        (Self { vars }, missing)
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Default data directory, `$HOME/.cc_telegram`
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".cc_telegram")
}

/// Expands a leading `~/` to the user home
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_preset_validates() {
        assert!(Config::development().validate().is_ok());
    }

    #[test]
    fn auth_requires_api_key() {
        let config = Config {
            enable_auth: true,
            default_api_key: None,
            ..Config::development()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bridge_executable_must_be_bare_filename() {
        let config = Config {
            bridge_executable: "target/release/bridge".to_string(),
            ..Config::development()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_alert_condition_is_rejected() {
        let mut config = Config::development();
        config.alerting.rules.push(AlertRuleConfig {
            name: "bad".to_string(),
            metric: "errors_total".to_string(),
            condition: "above".to_string(),
            threshold: 1.0,
            severity: Severity::High,
            labels: HashMap::new(),
            channels: Vec::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_home_handles_tilde_prefix() {
        // SAFETY: tests in this module touching HOME run single-threaded
        unsafe { std::env::set_var("HOME", "/home/tester") };
        assert_eq!(
            expand_home("~/.cc_telegram/events"),
            PathBuf::from("/home/tester/.cc_telegram/events")
        );
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn dotenv_discovery_reports_missing_when_no_files() {
        let (_, missing) = BridgeEnv::discover(&[PathBuf::from("/nonexistent/.env")]);
        // BOT_TOKEN / ALLOWED_USERS may leak in from a developer environment
        for name in &missing {
            assert!(BridgeEnv::REQUIRED.contains(&name.as_str()));
        }
    }

    #[test]
    fn dotenv_first_complete_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let incomplete = dir.path().join("a.env");
        let complete = dir.path().join("b.env");
        std::fs::write(&incomplete, "BOT_TOKEN=from_a\n").unwrap();
        std::fs::write(&complete, "BOT_TOKEN=from_b\nALLOWED_USERS=1,2\n").unwrap();

        // SAFETY: serialize HOME/ENV mutation inside this test only
        unsafe {
            std::env::remove_var("BOT_TOKEN");
            std::env::remove_var("ALLOWED_USERS");
        }
        let (env, missing) = BridgeEnv::discover(&[incomplete, complete]);
        assert!(missing.is_empty());
        // a.env alone cannot complete the set, so b.env supplies both
        assert_eq!(env.vars.get("BOT_TOKEN").unwrap(), "from_b");
        assert_eq!(env.vars.get("ALLOWED_USERS").unwrap(), "1,2");
    }
}
