//! MCP snapshot model and its conversion to the canonical interface

use crate::error::{BindError, Result};
use crate::model::{Interface, Operation, Source};
use crate::utils::KeyAllocator;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub(crate) const FORMAT: &str = "mcp";

/// Protocol revisions this client can speak
pub(crate) const SUPPORTED_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub uri_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Everything a server exposed at discovery time. Also the raw discovery
/// payload and the accepted inline `content` of an MCP source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplate>,
    #[serde(default)]
    pub prompts: Vec<Prompt>,
}

impl Snapshot {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| BindError::parse(format!("invalid MCP snapshot: {}", e)))
    }

    fn server_field(&self, field: &str) -> Option<String> {
        self.server_info
            .as_ref()
            .and_then(|info| info.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Tools win key collisions, then resources, templates and prompts
    pub fn to_interface(&self, source: &Source) -> Result<Interface> {
        let mut interface = Interface::new(self.server_field("name").unwrap_or_else(|| source.describe()));
        interface.version = self.server_field("version").unwrap_or_default();
        interface.sources.insert(FORMAT.to_string(), source.clone());
        let mut keys = KeyAllocator::new();

        for tool in &self.tools {
            let key = keys.allocate(&tool.name, Some("tool"))?;
            let mut operation = Operation::method();
            operation.description = tool.description.clone();
            operation.input = Some(
                tool.input_schema
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object"})),
            );
            operation.output = tool.output_schema.clone();
            operation.idempotent = tool
                .annotations
                .as_ref()
                .and_then(|a| a.idempotent_hint)
                .unwrap_or(false);
            interface.bind(key, operation, FORMAT, format!("tools/{}", tool.name));
        }

        for resource in &self.resources {
            let key = keys.allocate(resource.name.as_deref().unwrap_or(&resource.uri), Some("resource"))?;
            let mut operation = Operation::method();
            operation.description = resource.description.clone();
            operation.idempotent = true;
            operation.input = Some(json!({
                "type": "object",
                "properties": {"uri": {"type": "string", "const": resource.uri}},
            }));
            interface.bind(key, operation, FORMAT, format!("resources/{}", resource.uri));
        }

        for template in &self.resource_templates {
            let raw_name = template.name.as_deref().unwrap_or(&template.uri_template);
            let key = keys.allocate(raw_name, Some("template"))?;
            let mut properties = Map::new();
            properties.insert(
                "uriTemplate".to_string(),
                json!({"type": "string", "const": template.uri_template}),
            );
            properties.insert("uri".to_string(), json!({"type": "string"}));
            for variable in template_variables(&template.uri_template) {
                properties
                    .entry(variable)
                    .or_insert_with(|| json!({"type": "string"}));
            }
            let mut operation = Operation::method();
            operation.description = template.description.clone();
            operation.idempotent = true;
            operation.input = Some(json!({"type": "object", "properties": properties}));
            interface.bind(key, operation, FORMAT, format!("resources/{}", template.uri_template));
        }

        for prompt in &self.prompts {
            let key = keys.allocate(&prompt.name, Some("prompt"))?;
            let mut properties = Map::new();
            let mut required = Vec::new();
            for argument in &prompt.arguments {
                let mut schema = json!({"type": "string"});
                if let Some(description) = &argument.description {
                    schema["description"] = json!(description);
                }
                properties.insert(argument.name.clone(), schema);
                if argument.required {
                    required.push(argument.name.clone());
                }
            }
            let mut input = json!({"type": "object", "properties": properties});
            if !required.is_empty() {
                input["required"] = json!(required);
            }
            let mut operation = Operation::method();
            operation.description = prompt.description.clone();
            operation.input = Some(input);
            interface.bind(key, operation, FORMAT, format!("prompts/{}", prompt.name));
        }

        interface.validate()?;
        Ok(interface)
    }
}

/// Variable names of an RFC 6570 template, in order of appearance
pub fn template_variables(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        let expression = &rest[start + 1..start + end];
        let expression = expression.trim_start_matches(|c| "+#./;?&".contains(c));
        for name in expression.split(',') {
            let name = name.trim_end_matches('*');
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        rest = &rest[start + end + 1..];
    }
    names
}

/// Expand simple, reserved and query-style template expressions from `args`
pub fn expand_template(template: &str, args: &Map<String, Value>) -> String {
    let text = |name: &str| -> Option<String> {
        args.get(name).filter(|v| !v.is_null()).map(crate::protocols::scalar_text)
    };
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let expression = &rest[start + 1..start + end];
        let (operator, names) = match expression.chars().next() {
            Some(c) if "+#./;?&".contains(c) => (Some(c), &expression[1..]),
            _ => (None, expression),
        };
        let values: Vec<(&str, String)> = names
            .split(',')
            .map(|n| n.trim_end_matches('*'))
            .filter_map(|n| text(n).map(|v| (n, v)))
            .collect();
        match operator {
            Some('+') | Some('#') => {
                if operator == Some('#') && !values.is_empty() {
                    out.push('#');
                }
                let joined: Vec<String> = values.into_iter().map(|(_, v)| v).collect();
                out.push_str(&joined.join(","));
            }
            Some('?') | Some('&') => {
                for (i, (name, value)) in values.into_iter().enumerate() {
                    let lead = if i == 0 { operator.unwrap_or('?') } else { '&' };
                    out.push(lead);
                    out.push_str(&format!("{}={}", name, urlencoding::encode(&value)));
                }
            }
            Some(prefix) => {
                for (_, value) in values {
                    out.push(prefix);
                    out.push_str(&urlencoding::encode(&value));
                }
            }
            None => {
                let joined: Vec<String> = values
                    .into_iter()
                    .map(|(_, v)| urlencoding::encode(&v).into_owned())
                    .collect();
                out.push_str(&joined.join(","));
            }
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    out
}

fn all_text(items: &[Value], field: &str) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let texts: Option<Vec<&str>> = items
        .iter()
        .map(|item| item.get(field).and_then(Value::as_str))
        .collect();
    texts.map(|t| t.join("\n"))
}

/// `structuredContent` if present, else joined text, else the typed items
pub fn tool_result_value(result: &Value) -> Value {
    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return structured.clone();
    }
    let content = result
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let text_only = content
        .iter()
        .all(|c| c.get("type").and_then(Value::as_str) == Some("text"));
    match all_text(&content, "text") {
        Some(text) if text_only => Value::String(text),
        _ => Value::Array(content),
    }
}

/// Text of all-text resource contents, else the contents array
pub fn resource_result_value(result: &Value) -> Value {
    let contents = result
        .get("contents")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    match all_text(&contents, "text") {
        Some(text) => Value::String(text),
        None => Value::Array(contents),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot::parse(
            r#"{
                "serverInfo": {"name": "notes", "version": "1.2.0"},
                "tools": [
                    {"name": "greet", "description": "Say hello",
                     "inputSchema": {"type": "object", "properties": {"who": {"type": "string"}}},
                     "annotations": {"idempotentHint": true}},
                    {"name": "search"}
                ],
                "resources": [{"uri": "file:///readme.md", "name": "readme"}],
                "resourceTemplates": [{"uriTemplate": "notes://{folder}/{id}", "name": "note"}],
                "prompts": [
                    {"name": "greet", "arguments": [
                        {"name": "tone", "required": true},
                        {"name": "lang", "description": "Language"}
                    ]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_snapshot_to_interface() {
        let iface = snapshot()
            .to_interface(&Source::from_location("mcp", "notes-server --stdio"))
            .unwrap();
        assert_eq!(iface.name, "notes");
        assert_eq!(iface.version, "1.2.0");
        let keys: Vec<&String> = iface.operations.keys().collect();
        assert_eq!(keys, vec!["greet", "note", "prompt_greet", "readme", "search"]);

        assert!(iface.operations["greet"].idempotent);
        assert_eq!(iface.operations["search"].input, Some(json!({"type": "object"})));
        assert_eq!(iface.binding_for("prompt_greet").unwrap().reference, "prompts/greet");
        assert_eq!(iface.binding_for("readme").unwrap().reference, "resources/file:///readme.md");
    }

    #[test]
    fn test_entity_schemas() {
        let iface = snapshot()
            .to_interface(&Source::from_location("mcp", "notes-server"))
            .unwrap();
        let readme = iface.operations["readme"].input.as_ref().unwrap();
        assert_eq!(readme["properties"]["uri"]["const"], "file:///readme.md");

        let note = iface.operations["note"].input.as_ref().unwrap();
        assert_eq!(note["properties"]["uriTemplate"]["const"], "notes://{folder}/{id}");
        assert!(note["properties"].get("folder").is_some());

        let prompt = iface.operations["prompt_greet"].input.as_ref().unwrap();
        assert_eq!(prompt["required"], json!(["tone"]));
        assert_eq!(prompt["properties"]["lang"]["description"], "Language");
    }

    #[test]
    fn test_template_expansion() {
        let args = json!({"folder": "work", "id": "a b", "q": "x"});
        let args = args.as_object().unwrap();
        assert_eq!(expand_template("notes://{folder}/{id}", args), "notes://work/a%20b");
        assert_eq!(expand_template("search{?q,missing}", args), "search?q=x");
        assert_eq!(template_variables("a{/x}{?y,z}"), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_tool_result_mapping() {
        let structured = json!({"structuredContent": {"n": 1}, "content": [{"type": "text", "text": "1"}]});
        assert_eq!(tool_result_value(&structured), json!({"n": 1}));

        let text = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(tool_result_value(&text), json!("a\nb"));

        let mixed = json!({"content": [{"type": "text", "text": "a"}, {"type": "image", "data": "..", "mimeType": "image/png"}]});
        assert_eq!(tool_result_value(&mixed).as_array().unwrap().len(), 2);
    }
}
