//! Handler registry keyed by format name

use super::FormatHandler;
use crate::config::BinderyConfig;
use crate::error::{BindError, Result};
use crate::format::{supports, FormatToken};
use crate::protocols::{
    asyncapi::AsyncApiHandler, grpc::GrpcHandler, mcp::McpHandler, openapi::OpenApiHandler,
    usage::UsageHandler,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct RegistryEntry {
    handler: Arc<dyn FormatHandler>,
    formats: Vec<FormatToken>,
}

/// Holds handlers keyed by the name segment of their first declared token
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegistryEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the five compiled-in adapters
    pub async fn with_builtins(config: &BinderyConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenApiHandler::new(config.clone()))).await?;
        registry.register(Arc::new(AsyncApiHandler::new(config.clone()))).await?;
        registry.register(Arc::new(GrpcHandler::new(config.clone()))).await?;
        registry.register(Arc::new(McpHandler::new(config.clone()))).await?;
        registry.register(Arc::new(UsageHandler::new(config.clone()))).await?;
        info!("Registered built-in handlers: {:?}", registry.names());
        Ok(registry)
    }

    /// Register a handler; returns its registration key
    pub async fn register(&mut self, handler: Arc<dyn FormatHandler>) -> Result<String> {
        let declared = handler.list_formats().await?;
        let formats = declared
            .iter()
            .map(|f| FormatToken::parse(f))
            .collect::<Result<Vec<_>>>()?;
        let key = formats
            .first()
            .map(|f| f.name().to_string())
            .ok_or_else(|| {
                BindError::registry(format!("handler '{}' declares no formats", handler.info().name))
            })?;
        if self.handlers.contains_key(&key) {
            return Err(BindError::registry(format!(
                "a handler is already registered for format '{}'",
                key
            )));
        }
        debug!("Registering handler '{}' under '{}'", handler.info().name, key);
        self.handlers.insert(key.clone(), RegistryEntry { handler, formats });
        Ok(key)
    }

    /// Find the handler for a requested token.
    ///
    /// The name picks the entry; the entry must then prove it supports the
    /// requested version through one of its own declared tokens.
    pub fn lookup(&self, requested: &FormatToken) -> Option<Arc<dyn FormatHandler>> {
        let entry = self.handlers.get(requested.name())?;
        entry
            .formats
            .iter()
            .any(|declared| supports(declared, requested))
            .then(|| entry.handler.clone())
    }

    /// Handler registered under `name`, without version checks
    pub fn get(&self, name: &str) -> Option<Arc<dyn FormatHandler>> {
        self.handlers.get(name).map(|e| e.handler.clone())
    }

    /// Sorted registration keys
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
