//! Engine facade
//!
//! Resolves a handler for each Source and forwards the call. Resolution
//! failures surface as `no_handler` / `ambiguous_handler`, distinct from
//! anything the adapter itself reports.

use crate::config::BinderyConfig;
use crate::error::{BindError, Result};
use crate::format::{RegisteredDelegate, Resolver};
use crate::handler::{DelegateHandler, Discovery, ExecContext, FormatHandler, HandlerRegistry};
use crate::model::{codes, EventStream, ExecError, ExecuteInput, ExecuteOutput, Interface, Source};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub struct Engine {
    config: BinderyConfig,
    registry: Arc<HandlerRegistry>,
    delegates: Vec<RegisteredDelegate>,
}

impl Engine {
    /// Engine with the built-in adapters registered
    pub async fn new(config: BinderyConfig) -> Result<Self> {
        let registry = HandlerRegistry::with_builtins(&config).await?;
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    pub fn with_registry(config: BinderyConfig, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            config,
            registry,
            delegates: Vec::new(),
        }
    }

    pub fn config(&self) -> &BinderyConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Register an external handler under `id`; a later registration with the
    /// same id replaces the earlier one
    pub fn register_delegate<I: Into<String>>(&mut self, id: I, handler: Arc<dyn FormatHandler>) {
        let id = id.into();
        self.delegates.retain(|d| d.id != id);
        info!("Registered delegate '{}' ({})", id, handler.info().name);
        self.delegates.push(RegisteredDelegate::new(id, handler));
    }

    /// Convert a delegate's own source and register the resulting handler
    pub async fn introspect_delegate<I: Into<String>>(&mut self, id: I, source: &Source) -> Result<()> {
        let delegate = DelegateHandler::introspect(source, self.registry.clone()).await?;
        self.register_delegate(id, Arc::new(delegate));
        Ok(())
    }

    pub fn delegates(&self) -> &[RegisteredDelegate] {
        &self.delegates
    }

    /// Handler for a format token
    pub async fn resolve(&self, format: &str) -> Result<Arc<dyn FormatHandler>> {
        let resolver = Resolver::new(&self.config.preferences, &self.registry, &self.delegates);
        let resolved = resolver.resolve(format).await?;
        debug!("Format '{}' handled by {:?}", format, resolved);
        resolved.handler().ok_or_else(|| BindError::NoHandler {
            token: format.to_string(),
        })
    }

    pub async fn create_interface(&self, source: &Source) -> Result<Interface> {
        let handler = self.resolve(&source.format).await?;
        let interface = handler.create_interface(source).await?;
        info!(
            "Converted {} ({}) into {} operations",
            source.describe(),
            source.format,
            interface.operations.len()
        );
        Ok(interface)
    }

    pub async fn execute(&self, ctx: &ExecContext, input: ExecuteInput) -> ExecuteOutput {
        let started = Instant::now();
        match self.resolve(&input.source.format).await {
            Ok(handler) => handler.execute_operation(ctx, input).await,
            Err(e) => ExecuteOutput::failure(resolution_error(e), started),
        }
    }

    pub async fn subscribe(
        &self,
        ctx: &ExecContext,
        input: ExecuteInput,
    ) -> std::result::Result<EventStream, ExecError> {
        let handler = self.resolve(&input.source.format).await.map_err(resolution_error)?;
        match handler.as_subscriber() {
            Some(subscriber) => subscriber.subscribe_operation(ctx, input).await,
            None => Err(ExecError::new(
                codes::NOT_SUBSCRIBABLE,
                format!("handler '{}' does not support subscriptions", handler.info().name),
            )),
        }
    }

    pub async fn discover(&self, ctx: &ExecContext, source: &Source) -> Result<Discovery> {
        let handler = self.resolve(&source.format).await?;
        match handler.as_discoverer() {
            Some(discoverer) => discoverer.discover_source(ctx, source).await,
            None => Err(BindError::registry(format!(
                "handler '{}' does not support discovery",
                handler.info().name
            ))),
        }
    }
}

fn resolution_error(error: BindError) -> ExecError {
    match error {
        BindError::AmbiguousHandler { ref candidates, .. } => {
            let details = json!({ "candidates": candidates });
            ExecError::new(codes::AMBIGUOUS_HANDLER, error.to_string()).with_details(details)
        }
        BindError::NoHandler { .. } | BindError::InvalidToken { .. } => {
            ExecError::new(codes::NO_HANDLER, error.to_string())
        }
        other => ExecError::from(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerInfo;
    use async_trait::async_trait;

    struct Claims(&'static str, &'static str);

    #[async_trait]
    impl FormatHandler for Claims {
        fn info(&self) -> HandlerInfo {
            HandlerInfo::new(self.0, "claims a format")
        }

        async fn list_formats(&self) -> Result<Vec<String>> {
            Ok(vec![self.1.to_string()])
        }

        async fn create_interface(&self, _source: &Source) -> Result<Interface> {
            Ok(Interface::new(self.0))
        }

        async fn execute_operation(&self, _ctx: &ExecContext, _input: ExecuteInput) -> ExecuteOutput {
            ExecuteOutput::success(Some(json!(self.0)), Instant::now())
        }
    }

    fn engine() -> Engine {
        Engine::with_registry(BinderyConfig::default(), Arc::new(HandlerRegistry::new()))
    }

    #[tokio::test]
    async fn test_no_handler_is_distinct_from_adapter_errors() {
        let engine = engine();
        let output = engine
            .execute(
                &ExecContext::new(),
                ExecuteInput::new(Source::from_content("thrift@1.0.0", "x"), "a"),
            )
            .await;
        assert_eq!(output.status, 1);
        assert_eq!(output.error.unwrap().code, codes::NO_HANDLER);
    }

    #[tokio::test]
    async fn test_ambiguous_delegates_and_preference() {
        let mut engine = engine();
        engine.register_delegate("b", Arc::new(Claims("b", "thrift@^1.0.0")));
        engine.register_delegate("a", Arc::new(Claims("a", "thrift")));
        let input = ExecuteInput::new(Source::from_content("thrift@1.2.0", "x"), "op");

        let output = engine.execute(&ExecContext::new(), input.clone()).await;
        let error = output.error.unwrap();
        assert_eq!(error.code, codes::AMBIGUOUS_HANDLER);
        assert_eq!(error.details.unwrap()["candidates"], json!(["a", "b"]));

        engine
            .config
            .preferences
            .insert("thrift@^1.0.0".to_string(), "b".to_string());
        let output = engine.execute(&ExecContext::new(), input).await;
        assert_eq!(output.output, Some(json!("b")));
    }

    #[tokio::test]
    async fn test_subscribe_requires_capability() {
        let mut engine = engine();
        engine.register_delegate("a", Arc::new(Claims("a", "thrift")));
        let err = engine
            .subscribe(
                &ExecContext::new(),
                ExecuteInput::new(Source::from_content("thrift", "x"), "op"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::NOT_SUBSCRIBABLE);
    }
}
