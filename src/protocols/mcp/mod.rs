//! Model Context Protocol adapter
//!
//! Tools, resources, resource templates and prompts of an MCP server become
//! canonical operations. The server is reached either over Streamable HTTP or
//! as a stdio child process; every discovery and every call opens its own
//! session.

mod convert;
mod session;

pub use convert::Snapshot;

use crate::config::BinderyConfig;
use crate::error::{BindError, Result};
use crate::handler::{Discovery, ExecContext, FormatHandler, HandlerInfo, SourceDiscoverer};
use crate::model::{codes, ExecError, ExecuteInput, ExecuteOutput, Interface, Source};
use crate::protocols::{run_bounded, scalar_text};
use async_trait::async_trait;
use convert::{expand_template, resource_result_value, tool_result_value, FORMAT, SUPPORTED_VERSIONS};
use serde_json::{json, Map, Value};
use session::{McpError, McpSession};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct McpHandler {
    config: BinderyConfig,
}

impl McpHandler {
    pub fn new(config: BinderyConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        self.config.timeouts.for_protocol(FORMAT)
    }

    /// Inline content is a previously captured snapshot; otherwise ask the
    /// live server
    async fn snapshot(&self, source: &Source) -> Result<Snapshot> {
        if let Some(content) = &source.content {
            return Snapshot::parse(content);
        }
        let location = source
            .location
            .as_deref()
            .ok_or_else(|| BindError::load("MCP source needs a location or snapshot content"))?;
        let mut session = McpSession::connect(location, &self.config.mcp, None, self.timeout()).await?;
        let snapshot = session.snapshot().await?;
        info!(
            "Discovered {} tools, {} resources, {} resource templates and {} prompts from {}",
            snapshot.tools.len(),
            snapshot.resources.len(),
            snapshot.resource_templates.len(),
            snapshot.prompts.len(),
            source.describe()
        );
        Ok(snapshot)
    }

    async fn invoke(&self, input: &ExecuteInput, started: Instant) -> std::result::Result<ExecuteOutput, ExecError> {
        let (kind, target) = input
            .reference
            .split_once('/')
            .filter(|(kind, target)| {
                !target.is_empty() && matches!(*kind, "tools" | "resources" | "prompts")
            })
            .ok_or_else(|| {
                ExecError::new(
                    codes::INVALID_REF,
                    format!("'{}' is not tools/<name>, resources/<uri> or prompts/<name>", input.reference),
                )
            })?;
        let args = input
            .input_object()
            .ok_or_else(|| ExecError::new(codes::INVALID_INPUT, "MCP input must be an object"))?;
        let location = input
            .source
            .location
            .as_deref()
            .ok_or_else(|| ExecError::new(codes::INVALID_INPUT, "MCP invocation needs a server location"))?;

        let timeout = input.timeout(self.timeout());
        let mut session = McpSession::connect(location, &self.config.mcp, input.context.as_ref(), timeout).await?;
        debug!("MCP {} '{}'", kind, target);

        match kind {
            "tools" => call_tool(&mut session, target, args, started).await,
            "resources" => {
                let uri = resource_uri(target, &args);
                let result = session.request("resources/read", json!({"uri": uri})).await?;
                Ok(ExecuteOutput::success(Some(resource_result_value(&result)), started))
            }
            _ => {
                let arguments: Map<String, Value> = args
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(scalar_text(value))))
                    .collect();
                let result = session
                    .request("prompts/get", json!({"name": target, "arguments": arguments}))
                    .await?;
                Ok(ExecuteOutput::success(Some(result), started))
            }
        }
    }
}

/// A concrete `uri` in the input wins over expanding a template ref
fn resource_uri(target: &str, args: &Map<String, Value>) -> String {
    if !target.contains('{') {
        return target.to_string();
    }
    match args.get("uri").and_then(Value::as_str) {
        Some(uri) if !uri.is_empty() => uri.to_string(),
        _ => expand_template(target, args),
    }
}

async fn call_tool(
    session: &mut McpSession,
    name: &str,
    arguments: Map<String, Value>,
    started: Instant,
) -> std::result::Result<ExecuteOutput, ExecError> {
    let result = match session
        .request("tools/call", json!({"name": name, "arguments": arguments}))
        .await
    {
        Ok(result) => result,
        Err(McpError::Rpc(rpc)) => return Ok(ExecuteOutput::failure(McpError::Rpc(rpc).into(), started)),
        Err(other) => return Err(other.into()),
    };
    let value = tool_result_value(&result);
    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = match &value {
            Value::String(text) => text.clone(),
            _ => format!("tool '{}' reported an error", name),
        };
        let error = ExecError::new(codes::TOOL_ERROR, message).with_details(value.clone());
        return Ok(ExecuteOutput::failure(error, started).with_output(value));
    }
    Ok(ExecuteOutput::success(Some(value), started))
}

#[async_trait]
impl FormatHandler for McpHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo::new("mcp", "Model Context Protocol servers over stdio or Streamable HTTP")
    }

    async fn list_formats(&self) -> Result<Vec<String>> {
        Ok(SUPPORTED_VERSIONS
            .iter()
            .map(|version| format!("{}@{}", FORMAT, version))
            .collect())
    }

    async fn create_interface(&self, source: &Source) -> Result<Interface> {
        self.snapshot(source).await?.to_interface(source)
    }

    async fn execute_operation(&self, ctx: &ExecContext, input: ExecuteInput) -> ExecuteOutput {
        let started = Instant::now();
        let timeout = input.timeout(self.timeout());
        match run_bounded(ctx, timeout, self.invoke(&input, started)).await {
            Ok(output) => output,
            Err(error) => ExecuteOutput::failure(error, started),
        }
    }

    fn as_discoverer(&self) -> Option<&dyn SourceDiscoverer> {
        Some(self)
    }
}

#[async_trait]
impl SourceDiscoverer for McpHandler {
    async fn discover_source(&self, _ctx: &ExecContext, source: &Source) -> Result<Discovery> {
        let snapshot = self.snapshot(source).await?;
        let interface = snapshot.to_interface(source)?;
        Ok(Discovery {
            raw: serde_json::to_vec(&snapshot)?,
            interface,
        })
    }
}
