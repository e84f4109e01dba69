//! Handler contract
//!
//! Every protocol adapter implements [`FormatHandler`]. Streaming and direct
//! discovery are optional capabilities obtained through [`FormatHandler::as_subscriber`]
//! and [`FormatHandler::as_discoverer`] rather than being part of the base trait.

pub mod delegate;
pub mod registry;

pub use delegate::DelegateHandler;
pub use registry::HandlerRegistry;

use crate::error::{BindError, Result};
use crate::format::coerce_version;
use crate::model::{EventStream, ExecError, ExecuteInput, ExecuteOutput, Interface, Source};
use async_trait::async_trait;
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Handler identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HandlerInfo {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D) -> Self {
        Self {
            name: name.into(),
            version: crate::VERSION.to_string(),
            description: Some(description.into()),
        }
    }
}

/// Per-call execution context carrying the shared cancellation signal
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    cancel: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Raw native description plus its canonical conversion
#[derive(Debug, Clone)]
pub struct Discovery {
    pub raw: Vec<u8>,
    pub interface: Interface,
}

/// Capability interface every adapter implements
#[async_trait]
pub trait FormatHandler: Send + Sync {
    /// Handler identity
    fn info(&self) -> HandlerInfo;

    /// Declared format tokens; the first one's name is the registration key
    async fn list_formats(&self) -> Result<Vec<String>>;

    /// Convert a source into a canonical interface
    async fn create_interface(&self, source: &Source) -> Result<Interface>;

    /// Invoke one operation. Failures are reported in `ExecuteOutput.error`.
    async fn execute_operation(&self, ctx: &ExecContext, input: ExecuteInput) -> ExecuteOutput;

    fn as_subscriber(&self) -> Option<&dyn OperationSubscriber> {
        None
    }

    fn as_discoverer(&self) -> Option<&dyn SourceDiscoverer> {
        None
    }
}

/// Optional capability: event subscriptions
#[async_trait]
pub trait OperationSubscriber: Send + Sync {
    async fn subscribe_operation(
        &self,
        ctx: &ExecContext,
        input: ExecuteInput,
    ) -> std::result::Result<EventStream, ExecError>;
}

/// Optional capability: live discovery of endpoint sources
#[async_trait]
pub trait SourceDiscoverer: Send + Sync {
    async fn discover_source(&self, ctx: &ExecContext, source: &Source) -> Result<Discovery>;
}

/// Reject documents whose declared version falls outside `supported`
pub fn ensure_version_supported(format: &str, found: &str, supported: &str) -> Result<()> {
    let req = VersionReq::parse(supported)
        .map_err(|e| BindError::config(format!("invalid supported range '{}': {}", supported, e)))?;
    match coerce_version(found) {
        Some(version) if req.matches(&version) => Ok(()),
        _ => Err(BindError::version(format, found, supported)),
    }
}
