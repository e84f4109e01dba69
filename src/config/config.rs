use crate::error::{BindError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variables read by [`BinderyConfig::apply_environment_overrides`]
pub struct EnvVars;

impl EnvVars {
    pub const LOG_LEVEL: &'static str = "BINDERY_LOG_LEVEL";
    pub const LOG_FORMAT: &'static str = "BINDERY_LOG_FORMAT";
    pub const TIMEOUT_SECS: &'static str = "BINDERY_TIMEOUT_SECS";
    pub const MCP_PROTOCOL_VERSION: &'static str = "BINDERY_MCP_PROTOCOL_VERSION";
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinderyConfig {
    /// Per-protocol request timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// MCP client identity and handshake settings
    #[serde(default)]
    pub mcp: McpConfig,
    /// gRPC transport settings
    #[serde(default)]
    pub grpc: GrpcConfig,
    /// AsyncAPI receive settings
    #[serde(default)]
    pub asyncapi: AsyncApiConfig,
    /// Format token → delegate id
    #[serde(default)]
    pub preferences: HashMap<String, String>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timeouts in seconds. Protocol entries fall back to `default_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_secs: u64,
    #[serde(default)]
    pub openapi_secs: Option<u64>,
    #[serde(default)]
    pub asyncapi_secs: Option<u64>,
    #[serde(default)]
    pub grpc_secs: Option<u64>,
    #[serde(default)]
    pub mcp_secs: Option<u64>,
    #[serde(default)]
    pub usage_secs: Option<u64>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: default_timeout_secs(),
            openapi_secs: None,
            asyncapi_secs: None,
            grpc_secs: None,
            mcp_secs: None,
            usage_secs: None,
        }
    }
}

impl TimeoutConfig {
    /// Timeout for the named protocol adapter
    pub fn for_protocol(&self, protocol: &str) -> Duration {
        let specific = match protocol {
            "openapi" => self.openapi_secs,
            "asyncapi" => self.asyncapi_secs,
            "grpc" => self.grpc_secs,
            "mcp" => self.mcp_secs,
            "usage" => self.usage_secs,
            _ => None,
        };
        Duration::from_secs(specific.unwrap_or(self.default_secs))
    }

    fn validate(&self) -> Result<()> {
        let entries = [
            ("default_secs", Some(self.default_secs)),
            ("openapi_secs", self.openapi_secs),
            ("asyncapi_secs", self.asyncapi_secs),
            ("grpc_secs", self.grpc_secs),
            ("mcp_secs", self.mcp_secs),
            ("usage_secs", self.usage_secs),
        ];
        for (name, value) in entries {
            if value == Some(0) {
                return Err(BindError::config(format!("timeouts.{} must be greater than 0", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Protocol revision sent in `initialize`
    #[serde(default = "default_mcp_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_mcp_protocol_version() -> String {
    "2025-06-18".to_string()
}

fn default_client_name() -> String {
    "bindery".to_string()
}

fn default_client_version() -> String {
    crate::VERSION.to_string()
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_mcp_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }
}

/// When to use TLS for gRPC channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Infer from scheme and port
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcConfig {
    #[serde(default)]
    pub tls: TlsMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncApiConfig {
    /// Events collected by a blocking receive when the caller sets no limit
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_max_events() -> usize {
    100
}

impl Default for AsyncApiConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl BinderyConfig {
    /// Load `.env` then `.env.local`; missing files are skipped
    fn load_env_files() {
        for env_file in [".env", ".env.local"] {
            match dotenvy::from_filename(env_file) {
                Ok(_) => tracing::info!("Loaded environment variables from {}", env_file),
                Err(e) if e.not_found() => tracing::debug!("No {} file found, skipping", env_file),
                Err(e) => tracing::warn!("Failed to load {}: {}", env_file, e),
            }
        }
    }

    /// Load configuration from an optional YAML file, then apply environment
    /// overrides (precedence: .env < file < environment)
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        Self::load_env_files();

        let mut config = match path {
            Some(path) if path.as_ref().exists() => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| BindError::config(format!("Failed to read config file: {}", e)))?;
                Self::from_yaml_str(&content)?
            }
            Some(path) => {
                tracing::warn!("Config file {:?} not found, using defaults", path.as_ref());
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_environment_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| BindError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(level) = var(EnvVars::LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(format) = var(EnvVars::LOG_FORMAT) {
            self.logging.format = format;
        }
        if let Some(timeout) = var(EnvVars::TIMEOUT_SECS) {
            self.timeouts.default_secs = timeout.parse().map_err(|e| {
                BindError::config(format!("Invalid {} environment variable: {}", EnvVars::TIMEOUT_SECS, e))
            })?;
        }
        if let Some(version) = var(EnvVars::MCP_PROTOCOL_VERSION) {
            self.mcp.protocol_version = version;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;
        if self.mcp.client_name.trim().is_empty() {
            return Err(BindError::config("mcp.client_name must not be empty"));
        }
        if self.mcp.protocol_version.trim().is_empty() {
            return Err(BindError::config("mcp.protocol_version must not be empty"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(BindError::config(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }
        for key in self.preferences.keys() {
            crate::format::FormatToken::parse(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BinderyConfig::default();
        assert_eq!(config.timeouts.for_protocol("grpc"), Duration::from_secs(30));
        assert_eq!(config.mcp.protocol_version, "2025-06-18");
        assert_eq!(config.grpc.tls, TlsMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_sections() {
        let config = BinderyConfig::from_yaml_str(
            r#"
timeouts:
  default_secs: 10
  usage_secs: 5
grpc:
  tls: never
preferences:
  "usage@^2.0.0": my-usage
"#,
        )
        .unwrap();
        assert_eq!(config.timeouts.for_protocol("usage"), Duration::from_secs(5));
        assert_eq!(config.timeouts.for_protocol("openapi"), Duration::from_secs(10));
        assert_eq!(config.grpc.tls, TlsMode::Never);
        assert_eq!(config.preferences["usage@^2.0.0"], "my-usage");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = BinderyConfig::default();
        config
            .apply_overrides_from(|name| match name {
                "BINDERY_LOG_LEVEL" => Some("debug".to_string()),
                "BINDERY_TIMEOUT_SECS" => Some("7".to_string()),
                "BINDERY_MCP_PROTOCOL_VERSION" => Some("2025-03-26".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.timeouts.default_secs, 7);
        assert_eq!(config.mcp.protocol_version, "2025-03-26");

        let err = config.apply_overrides_from(|name| {
            (name == "BINDERY_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(err, Err(BindError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BinderyConfig::default();
        config.timeouts.mcp_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = BinderyConfig::default();
        config.mcp.client_name = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = BinderyConfig::default();
        config.preferences.insert("@1.0".to_string(), "x".to_string());
        assert!(config.validate().is_err());
    }
}
