//! External handlers described by their own canonical interface
//!
//! A delegate publishes an Interface whose operations mirror the handler
//! contract (`listFormats`, `createInterface`, `executeOperation` and an
//! optional `getInfo`). Each call is forwarded through whichever registered
//! handler binds that operation, so a delegate can be an HTTP service, an MCP
//! server or a CLI tool without any code of its own in this crate.

use super::{ExecContext, FormatHandler, HandlerInfo, HandlerRegistry};
use crate::error::{BindError, Result};
use crate::format::FormatToken;
use crate::model::{codes, ExecError, ExecuteInput, ExecuteOutput, Interface, Source};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const LIST_FORMATS: &str = "listFormats";
const CREATE_INTERFACE: &str = "createInterface";
const EXECUTE_OPERATION: &str = "executeOperation";
const GET_INFO: &str = "getInfo";

pub struct DelegateHandler {
    interface: Interface,
    registry: Arc<HandlerRegistry>,
}

impl DelegateHandler {
    /// Wrap an already converted delegate interface
    pub fn from_interface(interface: Interface, registry: Arc<HandlerRegistry>) -> Result<Self> {
        interface.validate()?;
        for required in [LIST_FORMATS, CREATE_INTERFACE, EXECUTE_OPERATION] {
            if interface.binding_for(required).is_none() {
                return Err(BindError::registry(format!(
                    "delegate '{}' does not bind required operation '{}'",
                    interface.name, required
                )));
            }
        }
        Ok(Self {
            interface,
            registry,
        })
    }

    /// Convert the delegate's own source with a registered handler, then wrap it
    pub async fn introspect(source: &Source, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let token = FormatToken::parse(&source.format)?;
        let handler = registry.lookup(&token).ok_or_else(|| BindError::NoHandler {
            token: token.to_string(),
        })?;
        let interface = handler.create_interface(source).await?;
        Self::from_interface(interface, registry)
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// Invoke one contract operation through the handler that binds it
    async fn call(&self, ctx: &ExecContext, operation: &str, input: Option<Value>) -> ExecuteOutput {
        let started = Instant::now();
        let Some(binding) = self.interface.binding_for(operation) else {
            return ExecuteOutput::failure(
                ExecError::new(
                    codes::OPERATION_NOT_FOUND,
                    format!("delegate does not bind '{}'", operation),
                ),
                started,
            );
        };
        let Some(source) = self.interface.sources.get(&binding.source) else {
            return ExecuteOutput::failure(
                ExecError::new(
                    codes::DOC_LOAD_FAILED,
                    format!("delegate source '{}' is missing", binding.source),
                ),
                started,
            );
        };
        let handler = match FormatToken::parse(&source.format)
            .ok()
            .and_then(|token| self.registry.lookup(&token))
        {
            Some(handler) => handler,
            None => {
                return ExecuteOutput::failure(
                    ExecError::new(
                        codes::NO_HANDLER,
                        format!("no handler for delegate source format '{}'", source.format),
                    ),
                    started,
                )
            }
        };

        debug!(
            "Delegate '{}' forwarding '{}' via {}",
            self.interface.name,
            operation,
            handler.info().name
        );
        let mut call = ExecuteInput::new(source.clone(), binding.reference.clone());
        call.input = input;
        handler.execute_operation(ctx, call).await
    }

    async fn call_value(&self, operation: &str, input: Option<Value>) -> Result<Value> {
        let output = self.call(&ExecContext::new(), operation, input).await;
        if let Some(error) = output.error {
            return Err(BindError::registry(format!(
                "delegate '{}' {} failed: {}",
                self.interface.name, operation, error
            )));
        }
        Ok(output.output.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl FormatHandler for DelegateHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo {
            name: self.interface.name.clone(),
            version: self.interface.version.clone(),
            description: self.interface.description.clone(),
        }
    }

    async fn list_formats(&self) -> Result<Vec<String>> {
        let value = self.call_value(LIST_FORMATS, None).await?;
        let list = match &value {
            Value::Object(map) => map.get("formats").cloned().unwrap_or(Value::Null),
            _ => value,
        };
        serde_json::from_value(list)
            .map_err(|e| BindError::registry(format!("delegate returned invalid format list: {}", e)))
    }

    async fn create_interface(&self, source: &Source) -> Result<Interface> {
        let input = serde_json::json!({ "source": source });
        let value = self
            .call_value(CREATE_INTERFACE, Some(input))
            .await
            .map_err(|e| BindError::load(e.to_string()))?;
        let interface: Interface = serde_json::from_value(value)
            .map_err(|e| BindError::parse(format!("delegate returned invalid interface: {}", e)))?;
        interface.validate()?;
        Ok(interface)
    }

    async fn execute_operation(&self, ctx: &ExecContext, input: ExecuteInput) -> ExecuteOutput {
        let started = Instant::now();
        let payload = match serde_json::to_value(&input) {
            Ok(payload) => payload,
            Err(e) => {
                return ExecuteOutput::failure(ExecError::new(codes::INVALID_INPUT, e.to_string()), started)
            }
        };
        let forwarded = self.call(ctx, EXECUTE_OPERATION, Some(payload)).await;
        if let Some(error) = forwarded.error {
            return ExecuteOutput::with_status(
                forwarded.status,
                ExecError::new(codes::DELEGATE_FAILED, error.message.clone())
                    .with_details(serde_json::to_value(&error).unwrap_or(Value::Null)),
                started,
            );
        }
        match forwarded.output.map(serde_json::from_value::<ExecuteOutput>) {
            Some(Ok(output)) => output,
            Some(Err(e)) => ExecuteOutput::failure(
                ExecError::new(
                    codes::DELEGATE_FAILED,
                    format!("delegate returned an invalid result: {}", e),
                ),
                started,
            ),
            None => ExecuteOutput::failure(
                ExecError::new(codes::DELEGATE_FAILED, "delegate returned no result"),
                started,
            ),
        }
    }
}

impl DelegateHandler {
    /// Identity reported by the delegate itself, when it binds `getInfo`
    pub async fn remote_info(&self) -> Result<HandlerInfo> {
        if self.interface.binding_for(GET_INFO).is_none() {
            return Ok(self.info());
        }
        let value = self.call_value(GET_INFO, None).await?;
        serde_json::from_value(value)
            .map_err(|e| BindError::registry(format!("delegate returned invalid info: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;

    fn delegate_interface(ops: &[&str]) -> Interface {
        let mut iface = Interface::new("my-delegate");
        iface
            .sources
            .insert("usage".to_string(), Source::from_content("usage", "bin \"d\""));
        for op in ops {
            iface.bind(op.to_string(), Operation::method(), "usage", op.to_string());
        }
        iface
    }

    #[test]
    fn test_requires_contract_operations() {
        let registry = Arc::new(HandlerRegistry::new());
        let missing = delegate_interface(&[LIST_FORMATS, EXECUTE_OPERATION]);
        assert!(DelegateHandler::from_interface(missing, registry.clone()).is_err());
        let complete = delegate_interface(&[LIST_FORMATS, CREATE_INTERFACE, EXECUTE_OPERATION]);
        let delegate = DelegateHandler::from_interface(complete, registry).unwrap();
        assert_eq!(delegate.info().name, "my-delegate");
    }

    #[tokio::test]
    async fn test_unbound_format_reports_no_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let iface = delegate_interface(&[LIST_FORMATS, CREATE_INTERFACE, EXECUTE_OPERATION]);
        let delegate = DelegateHandler::from_interface(iface, registry).unwrap();
        let output = delegate
            .execute_operation(&ExecContext::new(), ExecuteInput::new(Source::default(), "x"))
            .await;
        assert_eq!(output.error.unwrap().code, codes::DELEGATE_FAILED);
        assert!(delegate.list_formats().await.is_err());
    }
}
