//! Configuration system for toolmesh.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Main configuration struct for toolmesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session manager tuning
    pub session: SessionSettings,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Plugins registered at startup
    pub plugins: Vec<PluginConfig>,
}

/// Tuning knobs for the MCP session manager.
///
/// Durations are stored as integers so the values read naturally in TOML and
/// environment variables; use the accessor methods to get a [`Duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Lifetime of a cached tool list
    pub cache_ttl_secs: u64,
    /// How often idle sessions are swept
    pub cleanup_interval_secs: u64,
    /// Idle time after which a session is closed
    pub idle_ttl_secs: u64,
    /// How often session health is evaluated
    pub health_check_interval_secs: u64,
    /// Error rate above which an active session becomes degraded
    pub warn_error_rate: f64,
    /// Error rate above which a session is marked as errored
    pub critical_error_rate: f64,
    /// Minimum number of requests before the error rate is trusted
    pub min_sample_size: u64,
    /// Default per-call timeout
    pub call_timeout_secs: u64,
    /// Timeout for opening a transport and completing the handshake
    pub connect_timeout_secs: u64,
    /// Reconnect attempts per tool call after a dropped connection
    pub max_reconnect_attempts: u32,
    /// Pause between a reconnect and the retried call
    pub reconnect_backoff_ms: u64,
    /// Number of calls executed concurrently by a batch
    pub batch_window: usize,
    /// Pause between two batch windows
    pub batch_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cleanup_interval_secs: 60,
            idle_ttl_secs: 1800,
            health_check_interval_secs: 30,
            warn_error_rate: 0.3,
            critical_error_rate: 0.5,
            min_sample_size: 10,
            call_timeout_secs: 60,
            connect_timeout_secs: 30,
            max_reconnect_attempts: 2,
            reconnect_backoff_ms: 500,
            batch_window: 2,
            batch_delay_ms: 200,
        }
    }
}

impl SessionSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Wire transport used to reach a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// MCP streamable HTTP (POST per message, JSON or SSE response bodies).
    #[default]
    StreamableHttp,
    /// Legacy HTTP+SSE transport (event stream plus a POST endpoint).
    Sse,
    /// Plain HTTP; handled like streamable HTTP.
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamableHttp => write!(f, "streamable-http"),
            Self::Sse => write!(f, "sse"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streamable-http" | "streamable_http" => Ok(Self::StreamableHttp),
            "sse" => Ok(Self::Sse),
            "http" => Ok(Self::Http),
            other => Err(Error::Validation(format!("unknown transport kind '{}'", other))),
        }
    }
}

/// Registration details for one plugin of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Tenant owning the session
    pub tenant_id: String,
    /// Plugin name, unique per tenant
    pub plugin_name: String,
    /// Server endpoint
    pub url: String,
    /// Transport kind
    #[serde(default)]
    pub transport: TransportKind,
    /// Extra HTTP headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-plugin call timeout in milliseconds (falls back to the session default)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PluginConfig {
    /// Create a new plugin configuration using the streamable HTTP transport.
    pub fn new(
        tenant_id: impl Into<String>,
        plugin_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            plugin_name: plugin_name.into(),
            url: url.into(),
            transport: TransportKind::default(),
            headers: HashMap::new(),
            timeout_ms: None,
        }
    }

    /// Set the transport kind.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Add an HTTP header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the per-plugin call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "session.warn_error_rate")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Build the layered figment used by [`Config::load`].
    pub fn figment() -> Figment {
        let config_dir = Self::config_dir();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_dir.join("config.toml")))
            .merge(Toml::file(".toolmesh/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".toolmesh/config.local.toml"))
            // TOOLMESH_SESSION__CACHE_TTL_SECS=60
            .merge(Env::prefixed("TOOLMESH_").split("__"))
    }

    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Load configuration from an explicit file on top of the defaults.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.into()))
            .merge(Env::prefixed("TOOLMESH_").split("__"))
            .extract()
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        config.into_validated()
    }

    /// Validate an already loaded configuration, logging warnings.
    pub fn into_validated(self) -> Result<Self, Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        let s = &self.session;

        for (field, rate) in [
            ("session.warn_error_rate", s.warn_error_rate),
            ("session.critical_error_rate", s.critical_error_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                result.add_error(field, "error rate thresholds must be between 0 and 1");
            }
        }

        if s.warn_error_rate > s.critical_error_rate {
            result.add_error(
                "session.warn_error_rate",
                "warn_error_rate cannot exceed critical_error_rate",
            );
        }

        if s.min_sample_size == 0 {
            result.add_error("session.min_sample_size", "min_sample_size must be greater than 0");
        } else if s.min_sample_size < 5 {
            result.add_warning(
                "session.min_sample_size",
                "very small sample sizes make health status flap",
            );
        }

        for (field, value) in [
            ("session.cleanup_interval_secs", s.cleanup_interval_secs),
            ("session.health_check_interval_secs", s.health_check_interval_secs),
            ("session.call_timeout_secs", s.call_timeout_secs),
            ("session.connect_timeout_secs", s.connect_timeout_secs),
        ] {
            if value == 0 {
                result.add_error(field, "must be greater than 0");
            }
        }

        if s.batch_window == 0 {
            result.add_error("session.batch_window", "batch_window must be greater than 0");
        }

        if s.idle_ttl_secs < s.cleanup_interval_secs {
            result.add_warning(
                "session.idle_ttl_secs",
                "idle_ttl_secs is shorter than cleanup_interval_secs; idle sessions live up to one interval longer",
            );
        }

        if s.max_reconnect_attempts > 5 {
            result.add_warning(
                "session.max_reconnect_attempts",
                "high reconnect counts can stall callers for a long time",
            );
        }

        let mut seen = HashSet::new();
        for (i, plugin) in self.plugins.iter().enumerate() {
            let field = format!("plugins[{}]", i);
            if plugin.tenant_id.is_empty() {
                result.add_error(format!("{}.tenant_id", field), "tenant_id cannot be empty");
            }
            if plugin.plugin_name.is_empty() {
                result.add_error(format!("{}.plugin_name", field), "plugin_name cannot be empty");
            }
            if !plugin.url.starts_with("http://") && !plugin.url.starts_with("https://") {
                result.add_error(
                    format!("{}.url", field),
                    "url must start with http:// or https://",
                );
            }
            if plugin.timeout_ms == Some(0) {
                result.add_error(format!("{}.timeout_ms", field), "must be greater than 0");
            }
            if !seen.insert((plugin.tenant_id.as_str(), plugin.plugin_name.as_str())) {
                result.add_error(
                    field,
                    format!(
                        "duplicate plugin '{}' for tenant '{}'",
                        plugin.plugin_name, plugin.tenant_id
                    ),
                );
            }
        }

        result
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Plugins configured for a tenant.
    pub fn plugins_for<'a>(&'a self, tenant_id: &'a str) -> impl Iterator<Item = &'a PluginConfig> {
        self.plugins.iter().filter(move |p| p.tenant_id == tenant_id)
    }

    pub fn plugin(&self, tenant_id: &str, plugin_name: &str) -> Option<&PluginConfig> {
        self.plugins
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.plugin_name == plugin_name)
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("toolmesh"))
            .unwrap_or_else(|| PathBuf::from("~/.config/toolmesh"))
    }
}
