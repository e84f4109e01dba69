//! OpenAPI 3.x adapter
//!
//! One method per path+method. Invocation re-reads the document on every call,
//! synthesizes the HTTP request from the operation's parameters and returns the
//! decoded response body.

mod convert;

use crate::config::BinderyConfig;
use crate::error::Result;
use crate::handler::{ExecContext, FormatHandler, HandlerInfo};
use crate::model::{codes, ExecError, ExecuteInput, ExecuteOutput, Interface, Source};
use crate::protocols::{body_value, http_error, run_bounded, scalar_text};
use async_trait::async_trait;
use convert::{OpenApiDocument, ParamLocation, ResolvedOperation, FORMAT, SUPPORTED};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::debug;

pub struct OpenApiHandler {
    config: BinderyConfig,
}

impl OpenApiHandler {
    pub fn new(config: BinderyConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        self.config.timeouts.for_protocol(FORMAT)
    }

    async fn load(&self, source: &Source) -> Result<OpenApiDocument> {
        let text = source.read_document(self.timeout()).await?;
        OpenApiDocument::parse(&text)
    }

    /// Document load, request synthesis and the send, as one bounded unit
    async fn invoke(
        &self,
        input: &ExecuteInput,
        timeout: Duration,
        started: Instant,
    ) -> std::result::Result<ExecuteOutput, ExecError> {
        let document = self.load(&input.source).await?;
        let operation = document
            .find(&input.reference)
            .map_err(|e| ExecError::new(codes::INVALID_REF, e.to_string()))?
            .ok_or_else(|| {
                ExecError::new(
                    codes::OPERATION_NOT_FOUND,
                    format!("no operation at '{}'", input.reference),
                )
            })?;
        let args = input
            .input_object()
            .ok_or_else(|| ExecError::new(codes::INVALID_INPUT, "input must be an object"))?;
        let base_url = base_url(&document, &operation, input)?;
        let request = build_request(&base_url, &operation, &args, input, timeout)?;

        debug!("OpenAPI {} {}", operation.method.to_uppercase(), request.url);
        send(request, started).await
    }
}

#[async_trait]
impl FormatHandler for OpenApiHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo::new("openapi", "OpenAPI 3.x over HTTP")
    }

    async fn list_formats(&self) -> Result<Vec<String>> {
        Ok(vec![format!("{}@{}", FORMAT, SUPPORTED)])
    }

    async fn create_interface(&self, source: &Source) -> Result<Interface> {
        self.load(source).await?.to_interface(source)
    }

    async fn execute_operation(&self, ctx: &ExecContext, input: ExecuteInput) -> ExecuteOutput {
        let started = Instant::now();
        let timeout = input.timeout(self.timeout());
        match run_bounded(ctx, timeout, self.invoke(&input, timeout, started)).await {
            Ok(output) => output,
            Err(error) => ExecuteOutput::failure(error, started),
        }
    }
}

/// A fully placed HTTP request, ready to send
#[derive(Debug)]
struct PreparedRequest {
    method: reqwest::Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<(String, Value)>,
    timeout: Duration,
}

/// Context override, else operation/document servers (relative ones joined
/// against the document URL), else the document URL's origin
fn base_url(
    document: &OpenApiDocument,
    operation: &ResolvedOperation,
    input: &ExecuteInput,
) -> std::result::Result<String, ExecError> {
    if let Some(server) = input.context.as_ref().and_then(|c| c.server.clone()) {
        return Ok(server);
    }
    let document_url = input.source.url().and_then(|u| url::Url::parse(u).ok());
    match document.server_urls(operation).into_iter().next() {
        Some(server) if server.contains("://") => Ok(server),
        Some(relative) => match document_url {
            Some(doc) => doc
                .join(&relative)
                .map(|u| u.to_string())
                .map_err(|e| ExecError::new(codes::INVALID_INPUT, format!("bad server URL: {}", e))),
            None => Err(ExecError::new(
                codes::INVALID_INPUT,
                format!("relative server '{}' needs a document URL or a server override", relative),
            )),
        },
        None => match document_url {
            Some(doc) => Ok(doc.origin().ascii_serialization()),
            None => Err(ExecError::new(
                codes::INVALID_INPUT,
                "no server URL; set one in the runtime context",
            )),
        },
    }
}

fn build_request(
    base_url: &str,
    operation: &ResolvedOperation,
    args: &Map<String, Value>,
    input: &ExecuteInput,
    timeout: Duration,
) -> std::result::Result<PreparedRequest, ExecError> {
    let mut path = operation.path.clone();
    let mut query = Vec::new();
    let mut headers: Vec<(String, String)> = input.headers().into_iter().collect();
    let mut cookies = Vec::new();
    let mut consumed = Vec::new();

    for param in &operation.params {
        let Some(value) = args.get(&param.name) else {
            if param.required {
                return Err(ExecError::new(
                    codes::INVALID_INPUT,
                    format!("missing required parameter '{}'", param.name),
                ));
            }
            continue;
        };
        consumed.push(param.name.as_str());
        match param.location {
            ParamLocation::Path => {
                let encoded = urlencoding::encode(&scalar_text(value)).into_owned();
                path = path.replace(&format!("{{{}}}", param.name), &encoded);
            }
            ParamLocation::Query => match value {
                Value::Array(items) => {
                    for item in items {
                        query.push((param.name.clone(), scalar_text(item)));
                    }
                }
                other => query.push((param.name.clone(), scalar_text(other))),
            },
            ParamLocation::Header => headers.push((param.name.clone(), scalar_text(value))),
            ParamLocation::Cookie => cookies.push(format!("{}={}", param.name, scalar_text(value))),
        }
    }
    if !cookies.is_empty() {
        headers.push(("Cookie".to_string(), cookies.join("; ")));
    }

    let body = match &operation.body {
        Some(spec) if spec.nested => args.get("body").map(|b| (spec.media_type.clone(), b.clone())),
        Some(spec) => {
            let remaining: Map<String, Value> = args
                .iter()
                .filter(|(k, _)| !consumed.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (!remaining.is_empty() || spec.required)
                .then(|| (spec.media_type.clone(), Value::Object(remaining)))
        }
        None => None,
    };

    let method = reqwest::Method::from_bytes(operation.method.to_uppercase().as_bytes())
        .map_err(|e| ExecError::new(codes::INVALID_REF, e.to_string()))?;
    Ok(PreparedRequest {
        method,
        url: format!("{}{}", base_url.trim_end_matches('/'), path),
        query,
        headers,
        body,
        timeout,
    })
}

async fn send(
    request: PreparedRequest,
    started: Instant,
) -> std::result::Result<ExecuteOutput, ExecError> {
    let client = reqwest::Client::builder()
        .timeout(request.timeout)
        .build()
        .map_err(|e| ExecError::new(codes::REQUEST_FAILED, format!("failed to create HTTP client: {}", e)))?;

    let mut builder = client.request(request.method, &request.url).query(&request.query);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some((media_type, body)) = &request.body {
        builder = if media_type.contains("json") {
            builder.json(body)
        } else if media_type == "application/x-www-form-urlencoded" {
            let fields: Vec<(String, String)> = body
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), scalar_text(v))).collect())
                .unwrap_or_default();
            builder.form(&fields)
        } else {
            builder
                .header(reqwest::header::CONTENT_TYPE, media_type.as_str())
                .body(scalar_text(body))
        };
    }

    let response = builder.send().await.map_err(http_error)?;
    let status = response.status();
    let text = response.text().await.map_err(http_error)?;
    let output = body_value(&text);

    if status.is_success() {
        Ok(ExecuteOutput::success(Some(output), started)
            .with_metadata("httpStatus", json!(status.as_u16())))
    } else {
        let error = ExecError::new(
            codes::http(status.as_u16()),
            format!("HTTP {}", status),
        )
        .with_details(output.clone());
        Ok(ExecuteOutput::with_status(status.as_u16() as i32, error, started)
            .with_output(output)
            .with_metadata("httpStatus", json!(status.as_u16())))
    }
}
