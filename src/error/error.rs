//! Error types and handling for Bindery

use std::fmt;
use thiserror::Error;

/// Result type alias for Bindery operations
pub type Result<T> = std::result::Result<T, BindError>;

/// Conversion phase an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading the source (file, URL, process, handshake)
    Load,
    /// Decoding the native document
    Parse,
    /// Checking the declared protocol version
    Version,
    /// Building the canonical model
    Convert,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Load => "load",
            Phase::Parse => "parse",
            Phase::Version => "version",
            Phase::Convert => "convert",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Bindery
#[derive(Error, Debug)]
pub enum BindError {
    /// Source could not be read, fetched or handshaken
    #[error("load error: {message}")]
    Load { message: String },

    /// Source content is not a valid document
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Declared protocol version is outside the supported range
    #[error("version error: {format} document declares version {found}, supported: {supported}")]
    Version {
        format: String,
        found: String,
        supported: String,
    },

    /// Document is valid but cannot be expressed canonically
    #[error("convert error: {message}")]
    Convert { message: String },

    /// Malformed format token
    #[error("invalid format token '{token}': {message}")]
    InvalidToken { token: String, message: String },

    /// No handler or delegate claims the requested format
    #[error("no handler for format '{token}'")]
    NoHandler { token: String },

    /// More than one delegate claims the requested format
    #[error("ambiguous handler for format '{token}': candidates {candidates:?}; set an explicit preference")]
    AmbiguousHandler {
        token: String,
        candidates: Vec<String>,
    },

    /// Registry errors
    #[error("registry error: {message}")]
    Registry { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl BindError {
    /// Create a load-phase error
    pub fn load<S: Into<String>>(message: S) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    /// Create a parse-phase error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a version-phase error
    pub fn version<F, V, S>(format: F, found: V, supported: S) -> Self
    where
        F: Into<String>,
        V: Into<String>,
        S: Into<String>,
    {
        Self::Version {
            format: format.into(),
            found: found.into(),
            supported: supported.into(),
        }
    }

    /// Create a convert-phase error
    pub fn convert<S: Into<String>>(message: S) -> Self {
        Self::Convert {
            message: message.into(),
        }
    }

    /// Create an invalid token error
    pub fn invalid_token<T: Into<String>, S: Into<String>>(token: T, message: S) -> Self {
        Self::InvalidToken {
            token: token.into(),
            message: message.into(),
        }
    }

    /// Create a registry error
    pub fn registry<S: Into<String>>(message: S) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Conversion phase, for errors raised while building an Interface
    pub fn phase(&self) -> Option<Phase> {
        match self {
            BindError::Load { .. } | BindError::Io(_) => Some(Phase::Load),
            BindError::Parse { .. } | BindError::Serde(_) | BindError::Yaml(_) => Some(Phase::Parse),
            BindError::Version { .. } => Some(Phase::Version),
            BindError::Convert { .. } => Some(Phase::Convert),
            _ => None,
        }
    }

    /// True for "nobody can handle this", as opposed to "the handler tried and failed"
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            BindError::NoHandler { .. } | BindError::AmbiguousHandler { .. }
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BindError::Load { .. } => "load",
            BindError::Parse { .. } => "parse",
            BindError::Version { .. } => "version",
            BindError::Convert { .. } => "convert",
            BindError::InvalidToken { .. } => "token",
            BindError::NoHandler { .. } => "no_handler",
            BindError::AmbiguousHandler { .. } => "ambiguous_handler",
            BindError::Registry { .. } => "registry",
            BindError::Config { .. } => "config",
            BindError::Io(_) => "io",
            BindError::Serde(_) => "serialization",
            BindError::Yaml(_) => "yaml",
        }
    }
}
