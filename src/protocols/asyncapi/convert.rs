//! AsyncAPI 3 document walking

use crate::error::{BindError, Result};
use crate::handler::ensure_version_supported;
use crate::model::{parse_document, Interface, Operation, Source};
use crate::utils::json_pointer::inline_refs;
use crate::utils::{escape_pointer_segment, unescape_pointer_segment, KeyAllocator};
use serde_json::{json, Map, Value};
use tracing::warn;

pub(crate) const FORMAT: &str = "asyncapi";
pub(crate) const SUPPORTED: &str = "^3.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Send,
    Receive,
}

/// Server entry reduced to what HTTP-family invocation needs
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerInfo {
    pub protocol: String,
    pub host: String,
    pub pathname: String,
}

impl ServerInfo {
    pub fn is_http_family(&self) -> bool {
        matches!(self.protocol.as_str(), "http" | "https" | "sse")
    }

    /// Base URL; `sse` servers default to HTTPS unless the host carries a scheme
    pub fn base_url(&self) -> String {
        let host = if self.host.contains("://") {
            self.host.clone()
        } else {
            let scheme = if self.protocol == "http" { "http" } else { "https" };
            format!("{}://{}", scheme, self.host)
        };
        format!("{}{}", host.trim_end_matches('/'), self.pathname.trim_end_matches('/'))
    }
}

/// One operation with channel and messages resolved
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOperation {
    pub id: String,
    pub action: Action,
    pub address: Option<String>,
    pub payload: Option<Value>,
    pub reply: Option<Value>,
    pub servers: Vec<ServerInfo>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl ResolvedOperation {
    pub fn reference(&self) -> String {
        format!("#/operations/{}", escape_pointer_segment(&self.id))
    }

    /// Channel address with `{param}` placeholders filled from `args`
    pub fn address_with(&self, args: &Map<String, Value>) -> String {
        let mut address = self.address.clone().unwrap_or_default();
        for (name, value) in args {
            let placeholder = format!("{{{}}}", name);
            if address.contains(&placeholder) {
                let text = crate::protocols::scalar_text(value);
                address = address.replace(&placeholder, &urlencoding::encode(&text));
            }
        }
        address
    }
}

pub(crate) struct AsyncApiDocument {
    root: Value,
}

impl AsyncApiDocument {
    pub fn parse(text: &str) -> Result<Self> {
        let root = parse_document(text)?;
        let version = root
            .get("asyncapi")
            .and_then(Value::as_str)
            .ok_or_else(|| BindError::parse("document has no 'asyncapi' version field"))?;
        ensure_version_supported(FORMAT, version, SUPPORTED)?;
        if !root.get("operations").map_or(true, Value::is_object) {
            return Err(BindError::parse("'operations' must be a map"));
        }
        Ok(Self { root })
    }

    pub fn operations(&self) -> Result<Vec<ResolvedOperation>> {
        let Some(Value::Object(operations)) = self.root.get("operations") else {
            return Ok(Vec::new());
        };
        operations
            .iter()
            .map(|(id, raw)| self.resolve_operation(id, raw))
            .collect()
    }

    pub fn find(&self, reference: &str) -> Result<Option<ResolvedOperation>> {
        let escaped = reference
            .strip_prefix("#/operations/")
            .ok_or_else(|| BindError::parse(format!("'{}' is not an operation ref", reference)))?;
        let id = unescape_pointer_segment(escaped);
        match self.root.get("operations").and_then(|ops| ops.get(&id)) {
            Some(raw) => self.resolve_operation(&id, raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn to_interface(&self, source: &Source) -> Result<Interface> {
        let info = self.root.get("info");
        let text = |field: &str| info.and_then(|i| i.get(field)).and_then(Value::as_str).map(str::to_string);
        let mut interface = Interface::new(text("title").unwrap_or_else(|| source.describe()));
        interface.version = text("version").unwrap_or_default();
        interface.description = text("description");
        interface.sources.insert(FORMAT.to_string(), source.clone());

        let mut keys = KeyAllocator::new();
        for resolved in self.operations()? {
            let prefix = match resolved.action {
                Action::Send => "send",
                Action::Receive => "receive",
            };
            let key = keys.allocate(&resolved.id, Some(prefix))?;
            let mut operation = match resolved.action {
                Action::Receive => {
                    let mut op = Operation::event();
                    op.payload = resolved.payload.clone();
                    op
                }
                Action::Send => {
                    let mut op = Operation::method();
                    op.input = resolved.payload.clone();
                    op.output = resolved.reply.clone();
                    op
                }
            };
            operation.description = resolved.description.clone();
            operation.tags = resolved.tags.clone();
            interface.bind(key, operation, FORMAT, resolved.reference());
        }
        interface.validate()?;
        Ok(interface)
    }

    fn resolve_operation(&self, id: &str, raw: &Value) -> Result<ResolvedOperation> {
        let operation = inline_refs(raw, &self.root);
        let action = match operation.get("action").and_then(Value::as_str) {
            Some("send") => Action::Send,
            Some("receive") => Action::Receive,
            other => {
                return Err(BindError::convert(format!(
                    "operation '{}' needs an explicit send/receive action, found {:?}",
                    id, other
                )))
            }
        };

        let channel = operation.get("channel").cloned().unwrap_or(Value::Null);
        let payload = message_payload(operation.get("messages"), &channel);
        let reply = operation.get("reply").filter(|r| r.is_object()).map(|reply| {
            let reply_channel = reply.get("channel").cloned().unwrap_or_else(|| channel.clone());
            message_payload(reply.get("messages"), &reply_channel).unwrap_or_else(|| json!({}))
        });

        let servers = self.channel_servers(id, raw);
        let tags = operation
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let description = ["summary", "description"]
            .iter()
            .find_map(|field| operation.get(*field).and_then(Value::as_str).map(str::to_string));

        Ok(ResolvedOperation {
            id: id.to_string(),
            action,
            address: channel.get("address").and_then(Value::as_str).map(str::to_string),
            payload,
            reply,
            servers,
            description,
            tags,
        })
    }

    /// Servers listed on the operation's channel, else every document server.
    /// Works on the raw (non-inlined) channel so `$ref` names stay visible.
    fn channel_servers(&self, id: &str, raw_operation: &Value) -> Vec<ServerInfo> {
        let all = match self.root.get("servers") {
            Some(Value::Object(servers)) => servers.clone(),
            _ => Map::new(),
        };
        let channel = raw_operation
            .get("channel")
            .and_then(|c| c.get("$ref"))
            .and_then(Value::as_str)
            .and_then(|r| crate::utils::json_pointer::lookup_ref(&self.root, r));
        let listed: Vec<String> = channel
            .and_then(|c| c.get("servers"))
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|s| s.get("$ref").and_then(Value::as_str))
                    .filter_map(|r| r.strip_prefix("#/servers/"))
                    .map(unescape_pointer_segment)
                    .collect()
            })
            .unwrap_or_default();

        all.iter()
            .filter(|(name, _)| listed.is_empty() || listed.contains(name))
            .filter_map(|(name, server)| {
                let host = server.get("host").and_then(Value::as_str);
                let protocol = server.get("protocol").and_then(Value::as_str);
                match (host, protocol) {
                    (Some(host), Some(protocol)) => Some(ServerInfo {
                        protocol: protocol.to_lowercase(),
                        host: host.to_string(),
                        pathname: server
                            .get("pathname")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    }),
                    _ => {
                        warn!("Server '{}' used by operation '{}' lacks host or protocol", name, id);
                        None
                    }
                }
            })
            .collect()
    }
}

/// Payload schema of the operation's messages, falling back to the channel's.
/// Several messages become a `oneOf`.
fn message_payload(messages: Option<&Value>, channel: &Value) -> Option<Value> {
    let list: Vec<&Value> = match messages {
        Some(Value::Array(items)) if !items.is_empty() => items.iter().collect(),
        _ => match channel.get("messages") {
            Some(Value::Object(map)) => map.values().collect(),
            _ => Vec::new(),
        },
    };
    let mut payloads: Vec<Value> = list
        .into_iter()
        .filter_map(|message| message.get("payload").cloned())
        .collect();
    match payloads.len() {
        0 => None,
        1 => payloads.pop(),
        _ => Some(json!({ "oneOf": payloads })),
    }
}
