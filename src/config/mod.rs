//! Configuration module
//!
//! YAML file, `.env` files and `BINDERY_*` environment overrides.

mod config;

pub use config::{
    AsyncApiConfig, BinderyConfig, EnvVars, GrpcConfig, LoggingConfig, McpConfig, TimeoutConfig,
    TlsMode,
};
