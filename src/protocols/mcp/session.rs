//! Short-lived MCP client session
//!
//! A session is opened per call: spawn or connect, run the `initialize`
//! handshake, issue requests, then drop. Dropping a stdio session kills the
//! child process.

use super::convert::{Prompt, Resource, ResourceTemplate, Snapshot, Tool};
use crate::config::McpConfig;
use crate::model::{codes, ExecError, RuntimeContext};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

/// JSON-RPC method-not-found
const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to start MCP server: {0}")]
    Spawn(String),

    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP request timed out after {0}ms")]
    Timeout(u128),

    #[error("JSON-RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

impl From<McpError> for ExecError {
    fn from(error: McpError) -> Self {
        match error {
            McpError::Spawn(message) => ExecError::new(codes::SPAWN_FAILED, message),
            McpError::Transport(message) => ExecError::new(codes::REQUEST_FAILED, message),
            McpError::Timeout(ms) => {
                ExecError::new(codes::TIMEOUT, format!("MCP request timed out after {}ms", ms))
            }
            McpError::Rpc(rpc) => {
                let details = serde_json::to_value(&rpc).unwrap_or(Value::Null);
                ExecError::new(codes::RPC_ERROR, rpc.message).with_details(details)
            }
        }
    }
}

impl From<McpError> for crate::error::BindError {
    fn from(error: McpError) -> Self {
        crate::error::BindError::load(error.to_string())
    }
}

fn is_response_to(message: &Value, id: u64) -> bool {
    message.get("method").is_none() && message.get("id").and_then(Value::as_u64) == Some(id)
}

/// Split a response into its result or its JSON-RPC error
fn into_result(message: Value) -> Result<Value, McpError> {
    if let Some(error) = message.get("error").filter(|e| !e.is_null()) {
        let rpc = serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| RpcError {
            code: 0,
            message: error.to_string(),
            data: None,
        });
        return Err(McpError::Rpc(rpc));
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

/// Line-delimited JSON-RPC over a child's stdin/stdout
struct StdioTransport {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl StdioTransport {
    fn spawn(command_line: &str, context: Option<&RuntimeContext>) -> Result<Self, McpError> {
        let argv = shlex::split(command_line)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| McpError::Spawn(format!("cannot parse command '{}'", command_line)))?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(context) = context {
            command.envs(&context.environment);
            if let Some(cwd) = &context.cwd {
                command.current_dir(cwd);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| McpError::Spawn(format!("{}: {}", argv[0], e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Spawn("child stdout unavailable".to_string()))?;
        debug!("Spawned MCP server '{}'", argv[0]);

        Ok(Self {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn write(&mut self, message: &Value) -> Result<(), McpError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| McpError::Transport(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("write failed: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flush failed: {}", e)))
    }

    /// Read lines until the response for `id`; notifications and server
    /// requests in between are skipped
    async fn read_response(&mut self, id: u64) -> Result<Value, McpError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| McpError::Transport(format!("read failed: {}", e)))?
                .ok_or_else(|| McpError::Transport("server closed its output".to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(message) if is_response_to(&message, id) => return Ok(message),
                Ok(_) => debug!("Skipping unrelated MCP message"),
                Err(_) => warn!("Ignoring non-JSON output from MCP server"),
            }
        }
    }
}

/// Streamable HTTP: every message is a POST, answered by JSON or SSE
struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    session_id: Option<String>,
    protocol_version: Option<String>,
}

impl HttpTransport {
    fn new(url: &str, context: Option<&RuntimeContext>, timeout: Duration) -> Result<Self, McpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            headers: context.map(|c| c.headers.clone()).unwrap_or_default(),
            session_id: None,
            protocol_version: None,
        })
    }

    async fn post(&mut self, message: &Value, id: Option<u64>) -> Result<Option<Value>, McpError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(message);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session) = &self.session_id {
            request = request.header(SESSION_HEADER, session.as_str());
        }
        if let Some(version) = &self.protocol_version {
            request = request.header(PROTOCOL_HEADER, version.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "HTTP {} from {}",
                status.as_u16(),
                self.url
            )));
        }
        let Some(id) = id else {
            return Ok(None);
        };

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        if is_sse {
            let events = response.bytes_stream().eventsource();
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| McpError::Transport(e.to_string()))?;
                if let Ok(message) = serde_json::from_str::<Value>(&event.data) {
                    if is_response_to(&message, id) {
                        return Ok(Some(message));
                    }
                }
            }
            return Err(McpError::Transport(
                "event stream ended without a response".to_string(),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| McpError::Transport(format!("invalid JSON response: {}", e)))?;
        match body {
            Value::Array(batch) => batch
                .into_iter()
                .find(|m| is_response_to(m, id))
                .map(Some)
                .ok_or_else(|| McpError::Transport("batch has no matching response".to_string())),
            other => Ok(Some(other)),
        }
    }
}

enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

pub struct McpSession {
    transport: Transport,
    next_id: u64,
    timeout: Duration,
    capabilities: Value,
    server_info: Option<Value>,
    protocol_version: Option<String>,
}

impl McpSession {
    /// Open a transport for `location` and complete the handshake.
    /// `http(s)://` URLs use Streamable HTTP; anything else is a command line.
    pub async fn connect(
        location: &str,
        config: &McpConfig,
        context: Option<&RuntimeContext>,
        timeout: Duration,
    ) -> Result<Self, McpError> {
        let transport = if location.starts_with("http://") || location.starts_with("https://") {
            Transport::Http(HttpTransport::new(location, context, timeout)?)
        } else {
            Transport::Stdio(StdioTransport::spawn(location, context)?)
        };
        let mut session = Self {
            transport,
            next_id: 0,
            timeout,
            capabilities: Value::Null,
            server_info: None,
            protocol_version: None,
        };
        session.initialize(config).await?;
        Ok(session)
    }

    async fn initialize(&mut self, config: &McpConfig) -> Result<(), McpError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": config.protocol_version,
                    "capabilities": {},
                    "clientInfo": {
                        "name": config.client_name,
                        "version": config.client_version,
                    },
                }),
            )
            .await?;
        self.capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        self.server_info = result.get("serverInfo").cloned();
        self.protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Transport::Http(http) = &mut self.transport {
            http.protocol_version = self.protocol_version.clone();
        }
        self.notify("notifications/initialized", json!({})).await
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        debug!("MCP request {} (id {})", method, id);

        let timeout = self.timeout;
        let transport = &mut self.transport;
        let exchange = async move {
            match transport {
                Transport::Stdio(stdio) => {
                    stdio.write(&message).await?;
                    stdio.read_response(id).await
                }
                Transport::Http(http) => http
                    .post(&message, Some(id))
                    .await?
                    .ok_or_else(|| McpError::Transport("no response".to_string())),
            }
        };
        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| McpError::Timeout(timeout.as_millis()))??;
        into_result(response)
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError> {
        let message = json!({"jsonrpc": "2.0", "method": method, "params": params});
        match &mut self.transport {
            Transport::Stdio(stdio) => stdio.write(&message).await,
            Transport::Http(http) => http.post(&message, None).await.map(|_| ()),
        }
    }

    fn advertises(&self, capability: &str) -> bool {
        self.capabilities
            .get(capability)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    /// Follow `nextCursor` until exhausted
    async fn list_all(&mut self, method: &str, field: &str) -> Result<Vec<Value>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor}),
                None => json!({}),
            };
            let page = self.request(method, params).await?;
            if let Some(Value::Array(entries)) = page.get(field) {
                items.extend(entries.iter().cloned());
            }
            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
                    cursor = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(items)
    }

    /// Everything the server advertises, as one serializable snapshot
    pub async fn snapshot(&mut self) -> Result<Snapshot, McpError> {
        let mut snapshot = Snapshot {
            server_info: self.server_info.clone(),
            protocol_version: self.protocol_version.clone(),
            ..Default::default()
        };
        if self.advertises("tools") {
            snapshot.tools = decode_entries::<Tool>(self.list_all("tools/list", "tools").await?, "tool");
        }
        if self.advertises("resources") {
            snapshot.resources = decode_entries::<Resource>(
                self.list_all("resources/list", "resources").await?,
                "resource",
            );
            // Template listing is optional even when resources are advertised
            snapshot.resource_templates =
                match self.list_all("resources/templates/list", "resourceTemplates").await {
                    Ok(entries) => decode_entries::<ResourceTemplate>(entries, "resource template"),
                    Err(McpError::Rpc(rpc)) if rpc.code == METHOD_NOT_FOUND => Vec::new(),
                    Err(e) => return Err(e),
                };
        }
        if self.advertises("prompts") {
            snapshot.prompts =
                decode_entries::<Prompt>(self.list_all("prompts/list", "prompts").await?, "prompt");
        }
        Ok(snapshot)
    }
}

fn decode_entries<T: DeserializeOwned>(values: Vec<Value>, kind: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping malformed {}: {}", kind, e);
                None
            }
        })
        .collect()
}
