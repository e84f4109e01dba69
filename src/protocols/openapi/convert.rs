//! OpenAPI 3.x document walking
//!
//! The typed `openapiv3` model drives the walk over paths and operations;
//! schemas are carried as JSON values so that local `$ref`s can be inlined
//! against the raw document.

use crate::error::{BindError, Result};
use crate::handler::ensure_version_supported;
use crate::model::{parse_document, Interface, Operation, Source};
use crate::utils::json_pointer::{inline_refs, lookup_ref};
use crate::utils::{escape_pointer_segment, unescape_pointer_segment, KeyAllocator};
use openapiv3::{OpenAPI, Parameter, ParameterSchemaOrContent, ReferenceOr, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

pub(crate) const FORMAT: &str = "openapi";
pub(crate) const SUPPORTED: &str = "^3.0.0";

const METHODS: [&str; 8] = ["get", "put", "post", "delete", "options", "head", "patch", "trace"];
const IDEMPOTENT_METHODS: [&str; 5] = ["get", "head", "put", "delete", "options"];
const OUTPUT_STATUSES: [u16; 3] = [200, 201, 202];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

#[derive(Debug, Clone)]
pub(crate) struct ParamSpec {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub(crate) struct BodySpec {
    pub schema: Value,
    pub required: bool,
    /// Non-object bodies are exposed under a single `body` input key
    pub nested: bool,
    pub media_type: String,
}

/// One path+method with parameters and schemas fully resolved
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOperation {
    pub path: String,
    pub method: String,
    pub operation: openapiv3::Operation,
    pub params: Vec<ParamSpec>,
    pub body: Option<BodySpec>,
    pub output: Option<Value>,
    pub servers: Vec<openapiv3::Server>,
}

impl ResolvedOperation {
    /// `#/paths/<escaped path>/<method>`
    pub fn reference(&self) -> String {
        format!("#/paths/{}/{}", escape_pointer_segment(&self.path), self.method)
    }

    pub fn input_schema(&self) -> Option<Value> {
        if self.params.is_empty() && self.body.is_none() {
            return None;
        }
        let mut properties = Map::new();
        let mut required: Vec<String> = Vec::new();
        for param in &self.params {
            properties.insert(param.name.clone(), param.schema.clone());
            if param.required {
                required.push(param.name.clone());
            }
        }
        if let Some(body) = &self.body {
            if body.nested {
                properties.insert("body".to_string(), body.schema.clone());
                if body.required {
                    required.push("body".to_string());
                }
            } else {
                if let Some(Value::Object(props)) = body.schema.get("properties") {
                    for (name, schema) in props {
                        properties.entry(name.clone()).or_insert_with(|| schema.clone());
                    }
                }
                if let Some(Value::Array(names)) = body.schema.get("required") {
                    for name in names.iter().filter_map(Value::as_str) {
                        if !required.iter().any(|r| r == name) {
                            required.push(name.to_string());
                        }
                    }
                }
            }
        }
        let mut schema = json!({"type": "object", "properties": properties});
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        Some(schema)
    }

    fn fallback_key(&self) -> String {
        let segments: Vec<&str> = self
            .path
            .split('/')
            .map(|s| s.trim_matches(|c| c == '{' || c == '}'))
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            self.method.clone()
        } else {
            format!("{}_{}", self.method, segments.join("_"))
        }
    }
}

/// A parsed OpenAPI document plus its raw JSON form
pub(crate) struct OpenApiDocument {
    root: Value,
    spec: OpenAPI,
}

impl OpenApiDocument {
    pub fn parse(text: &str) -> Result<Self> {
        let root = parse_document(text)?;
        let version = match (root.get("openapi"), root.get("swagger")) {
            (Some(Value::String(v)), _) => v.clone(),
            (_, Some(Value::String(v))) => v.clone(),
            _ => return Err(BindError::parse("document has no 'openapi' version field")),
        };
        ensure_version_supported(FORMAT, &version, SUPPORTED)?;
        let spec: OpenAPI = serde_json::from_value(root.clone())
            .map_err(|e| BindError::parse(format!("invalid OpenAPI document: {}", e)))?;
        Ok(Self { root, spec })
    }

    /// Operations in document order (paths, then method order)
    pub fn operations(&self) -> Vec<ResolvedOperation> {
        let mut operations = Vec::new();
        for (path, item) in &self.spec.paths.paths {
            let Some(item) = self.resolve(item) else {
                debug!("Skipping unresolvable path item {}", path);
                continue;
            };
            for method in METHODS {
                let operation = match method {
                    "get" => &item.get,
                    "put" => &item.put,
                    "post" => &item.post,
                    "delete" => &item.delete,
                    "options" => &item.options,
                    "head" => &item.head,
                    "patch" => &item.patch,
                    _ => &item.trace,
                };
                if let Some(operation) = operation {
                    operations.push(self.resolve_operation(path, method, &item, operation));
                }
            }
        }
        operations
    }

    /// Operation addressed by a `#/paths/<escaped>/<method>` ref
    pub fn find(&self, reference: &str) -> Result<Option<ResolvedOperation>> {
        let rest = reference
            .strip_prefix("#/paths/")
            .ok_or_else(|| BindError::parse(format!("'{}' is not a path operation ref", reference)))?;
        let (escaped, method) = rest
            .rsplit_once('/')
            .ok_or_else(|| BindError::parse(format!("'{}' has no method segment", reference)))?;
        let path = unescape_pointer_segment(escaped);
        let method = method.to_lowercase();
        Ok(self
            .operations()
            .into_iter()
            .find(|op| op.path == path && op.method == method))
    }

    /// Server URLs for an operation: operation servers, then document servers,
    /// with variables replaced by their defaults
    pub fn server_urls(&self, operation: &ResolvedOperation) -> Vec<String> {
        let servers = if operation.servers.is_empty() {
            &self.spec.servers
        } else {
            &operation.servers
        };
        servers
            .iter()
            .map(|server| {
                let mut url = server.url.clone();
                if let Some(variables) = &server.variables {
                    for (name, variable) in variables {
                        url = url.replace(&format!("{{{}}}", name), &variable.default);
                    }
                }
                url
            })
            .collect()
    }

    pub fn to_interface(&self, source: &Source) -> Result<Interface> {
        let info = &self.spec.info;
        let mut interface = Interface::new(info.title.clone());
        interface.version = info.version.clone();
        interface.description = info.description.clone();
        interface.sources.insert(FORMAT.to_string(), source.clone());

        let mut keys = KeyAllocator::new();
        for resolved in self.operations() {
            let raw_key = resolved
                .operation
                .operation_id
                .clone()
                .unwrap_or_else(|| resolved.fallback_key());
            let key = keys.allocate(&raw_key, Some(&resolved.method))?;

            let mut operation = Operation::method();
            operation.description = resolved
                .operation
                .summary
                .clone()
                .or_else(|| resolved.operation.description.clone());
            operation.tags = resolved.operation.tags.clone();
            operation.deprecated = resolved.operation.deprecated;
            operation.idempotent = IDEMPOTENT_METHODS.contains(&resolved.method.as_str());
            operation.input = resolved.input_schema();
            operation.output = resolved.output.clone();

            interface.bind(key, operation, FORMAT, resolved.reference());
        }
        interface.validate()?;
        Ok(interface)
    }

    fn resolve<T>(&self, item: &ReferenceOr<T>) -> Option<T>
    where
        T: DeserializeOwned + Clone,
    {
        match item {
            ReferenceOr::Item(item) => Some(item.clone()),
            ReferenceOr::Reference { reference } => lookup_ref(&self.root, reference)
                .and_then(|target| serde_json::from_value(target.clone()).ok()),
        }
    }

    fn schema_value<T: Serialize>(&self, schema: &T) -> Value {
        let raw = serde_json::to_value(schema).unwrap_or(Value::Null);
        inline_refs(&raw, &self.root)
    }

    fn resolve_operation(
        &self,
        path: &str,
        method: &str,
        item: &openapiv3::PathItem,
        operation: &openapiv3::Operation,
    ) -> ResolvedOperation {
        // Operation-level parameters override path-level ones on (in, name)
        let mut params: Vec<ParamSpec> = Vec::new();
        for param in item.parameters.iter().chain(operation.parameters.iter()) {
            let Some(param) = self.resolve(param) else {
                continue;
            };
            let spec = self.param_spec(&param);
            match params
                .iter_mut()
                .find(|p| p.name == spec.name && p.location == spec.location)
            {
                Some(existing) => *existing = spec,
                None => params.push(spec),
            }
        }

        let body = operation
            .request_body
            .as_ref()
            .and_then(|body| self.resolve(body))
            .and_then(|body| {
                let (media_type, media) = pick_media(body.content.iter())?;
                let schema = media
                    .schema
                    .as_ref()
                    .map(|s| self.schema_value(s))
                    .unwrap_or_else(|| json!({}));
                let nested = !matches!(schema.get("properties"), Some(Value::Object(_)));
                Some(BodySpec {
                    schema,
                    required: body.required,
                    nested,
                    media_type: media_type.clone(),
                })
            });

        let output = OUTPUT_STATUSES.iter().find_map(|code| {
            let response = operation
                .responses
                .responses
                .iter()
                .find(|(status, _)| matches!(status, StatusCode::Code(c) if c == code))
                .and_then(|(_, response)| self.resolve(response))?;
            let (_, media) = pick_media(response.content.iter())?;
            media.schema.as_ref().map(|s| self.schema_value(s))
        });

        let servers = if operation.servers.is_empty() {
            item.servers.clone()
        } else {
            operation.servers.clone()
        };

        ResolvedOperation {
            path: path.to_string(),
            method: method.to_string(),
            operation: operation.clone(),
            params,
            body,
            output,
            servers,
        }
    }

    fn param_spec(&self, param: &Parameter) -> ParamSpec {
        let data = param.parameter_data_ref();
        let location = match param {
            Parameter::Path { .. } => ParamLocation::Path,
            Parameter::Query { .. } => ParamLocation::Query,
            Parameter::Header { .. } => ParamLocation::Header,
            Parameter::Cookie { .. } => ParamLocation::Cookie,
        };
        let mut schema = match &data.format {
            ParameterSchemaOrContent::Schema(schema) => self.schema_value(schema),
            ParameterSchemaOrContent::Content(content) => pick_media(content.iter())
                .and_then(|(_, media)| media.schema.as_ref())
                .map(|s| self.schema_value(s))
                .unwrap_or_else(|| json!({"type": "string"})),
        };
        if let (Some(description), Value::Object(map)) = (&data.description, &mut schema) {
            map.entry("description")
                .or_insert_with(|| Value::String(description.clone()));
        }
        ParamSpec {
            name: data.name.clone(),
            location,
            required: data.required || location == ParamLocation::Path,
            schema,
        }
    }
}

/// Exact `application/json`, else the first JSON-ish type, else the first
/// type, with ties broken lexicographically
pub(crate) fn pick_media<'a, T: 'a>(
    entries: impl Iterator<Item = (&'a String, &'a T)>,
) -> Option<(&'a String, &'a T)> {
    let mut entries: Vec<(&String, &T)> = entries.collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    if let Some(exact) = entries.iter().find(|(media, _)| media.as_str() == "application/json") {
        return Some(*exact);
    }
    if let Some(json_like) = entries.iter().find(|(media, _)| media.contains("json")) {
        return Some(*json_like);
    }
    entries.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PETSTORE: &str = r##"
openapi: 3.0.3
info:
  title: Petstore
  version: 1.0.0
servers:
  - url: https://{region}.example.com/v1
    variables:
      region:
        default: eu
paths:
  /pets/{petId}:
    parameters:
      - name: petId
        in: path
        schema: {type: string}
      - name: verbose
        in: query
        schema: {type: boolean}
    get:
      operationId: getPet
      summary: Get a pet
      tags: [pets]
      parameters:
        - name: verbose
          in: query
          required: true
          schema: {type: integer}
      responses:
        "200":
          description: ok
          content:
            text/plain:
              schema: {type: string}
            application/json:
              schema: {$ref: "#/components/schemas/Pet"}
    put:
      requestBody:
        required: true
        content:
          application/json:
            schema: {$ref: "#/components/schemas/Pet"}
      responses:
        "204": {description: none}
  /upload:
    post:
      operationId: getPet
      requestBody:
        content:
          application/octet-stream:
            schema: {type: string, format: binary}
      responses:
        "201":
          description: created
components:
  schemas:
    Pet:
      type: object
      required: [name]
      properties:
        name: {type: string}
        parent: {$ref: "#/components/schemas/Pet"}
"##;

    fn document() -> OpenApiDocument {
        OpenApiDocument::parse(PETSTORE).unwrap()
    }

    #[test]
    fn test_interface_shape() {
        let iface = document().to_interface(&Source::from_content("openapi", PETSTORE)).unwrap();
        assert_eq!(iface.name, "Petstore");
        let keys: Vec<&String> = iface.operations.keys().collect();
        assert_eq!(keys, vec!["getPet", "post_getPet", "put_pets_petId"]);

        let get = &iface.operations["getPet"];
        assert!(get.idempotent);
        assert_eq!(get.tags, vec!["pets"]);
        assert_eq!(get.description.as_deref(), Some("Get a pet"));
        let input = get.input.as_ref().unwrap();
        assert_eq!(input["properties"]["verbose"]["type"], "integer");
        assert_eq!(input["required"], json!(["petId", "verbose"]));
        let output = get.output.as_ref().unwrap();
        assert_eq!(output["properties"]["name"]["type"], "string");
        assert_eq!(output["properties"]["parent"], json!({}));

        assert_eq!(
            iface.binding_for("getPet").unwrap().reference,
            "#/paths/~1pets~1{petId}/get"
        );
        assert!(!iface.operations["post_getPet"].idempotent);
    }

    #[test]
    fn test_body_flattening() {
        let iface = document().to_interface(&Source::from_content("openapi", PETSTORE)).unwrap();
        let put = iface.operations["put_pets_petId"].input.as_ref().unwrap();
        assert_eq!(put["properties"]["name"]["type"], "string");
        assert_eq!(put["required"], json!(["petId", "name"]));

        let upload = iface.operations["post_getPet"].input.as_ref().unwrap();
        assert_eq!(upload["properties"]["body"]["format"], "binary");
        assert!(upload.get("required").is_none());
    }

    #[test]
    fn test_find_and_servers() {
        let doc = document();
        let op = doc.find("#/paths/~1pets~1{petId}/GET").unwrap().unwrap();
        assert_eq!(op.method, "get");
        assert_eq!(doc.server_urls(&op), vec!["https://eu.example.com/v1"]);
        assert!(doc.find("#/paths/~1nope/get").unwrap().is_none());
        assert!(doc.find("paths/x").is_err());
    }

    #[test]
    fn test_version_gate() {
        let err = OpenApiDocument::parse("swagger: '2.0'\ninfo: {title: x, version: '1'}\npaths: {}\n");
        assert!(matches!(err, Err(BindError::Version { .. })));
        assert!(matches!(
            OpenApiDocument::parse("info: {}"),
            Err(BindError::Parse { .. })
        ));
    }

    #[test]
    fn test_media_preference() {
        let types = ["text/plain".to_string(), "application/vnd+json".to_string(), "application/hal+json".to_string()];
        let entries: Vec<(&String, &u8)> = types.iter().map(|t| (t, &0u8)).collect();
        let picked = pick_media(entries.into_iter()).unwrap();
        assert_eq!(picked.0, "application/hal+json");
    }
}
