//! gRPC adapter driven entirely by server reflection
//!
//! Descriptors are fetched at runtime into a `prost_reflect::DescriptorPool`;
//! requests and responses go through the protobuf JSON mapping on
//! `DynamicMessage`, so no generated code is involved.

mod codec;
mod reflection;
mod schema;

use crate::config::{BinderyConfig, TlsMode};
use crate::error::{BindError, Result};
use crate::handler::{Discovery, ExecContext, FormatHandler, HandlerInfo, OperationSubscriber, SourceDiscoverer};
use crate::model::{
    codes, event_channel, EventSink, EventStream, ExecError, ExecuteInput, ExecuteOutput, Interface,
    Source, StreamEvent,
};
use crate::protocols::run_bounded;
use async_trait::async_trait;
use base64::Engine;
use codec::DynamicCodec;
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor};
use prost_types::FileDescriptorSet;
use reflection::{build_pool, ReflectionClient};
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info, warn};

pub(crate) const FORMAT: &str = "grpc";

/// Dial target derived from a source location
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Target {
    pub uri: String,
    pub host: String,
    pub tls: bool,
}

/// Accepts `host:port`, `grpc://`, `grpcs://`, `http://` and `https://`.
/// In auto mode TLS is used for secure schemes, or for port 443 when no
/// scheme is given.
pub(crate) fn parse_target(location: &str, mode: TlsMode) -> Result<Target> {
    let location = location.trim();
    let (scheme, rest) = match location.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_lowercase()), rest),
        None => (None, location),
    };
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(BindError::load(format!("'{}' has no host", location)));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (host, Some(port))
        }
        _ => (authority, None),
    };
    let scheme_tls = match scheme.as_deref() {
        Some("https") | Some("grpcs") => Some(true),
        Some("http") | Some("grpc") => Some(false),
        None => None,
        Some(other) => return Err(BindError::load(format!("unsupported gRPC scheme '{}'", other))),
    };
    let tls = match mode {
        TlsMode::Always => true,
        TlsMode::Never => false,
        TlsMode::Auto => scheme_tls.unwrap_or(port == Some("443")),
    };
    Ok(Target {
        uri: format!("{}://{}", if tls { "https" } else { "http" }, authority),
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        tls,
    })
}

async fn connect(target: &Target, timeout: Duration) -> Result<Channel> {
    let mut endpoint = Endpoint::from_shared(target.uri.clone())
        .map_err(|e| BindError::load(format!("invalid endpoint {}: {}", target.uri, e)))?
        .connect_timeout(timeout);
    if target.tls {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new().domain_name(target.host.clone()))
            .map_err(|e| BindError::load(format!("TLS setup failed: {}", e)))?;
    }
    endpoint
        .connect()
        .await
        .map_err(|e| BindError::load(format!("failed to connect to {}: {}", target.uri, e)))
}

/// Inline content holds a base64-encoded `FileDescriptorSet`
fn decode_descriptor_set(content: &str) -> Result<FileDescriptorSet> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| BindError::parse(format!("descriptor content is not base64: {}", e)))?;
    FileDescriptorSet::decode(bytes.as_slice())
        .map_err(|e| BindError::parse(format!("invalid FileDescriptorSet: {}", e)))
}

/// `grpc_<snake_case_name>` for a non-OK status
fn status_error(status: &Status) -> ExecError {
    let name = match status.code() {
        Code::Ok => "ok",
        Code::Cancelled => "cancelled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    };
    ExecError::new(format!("grpc_{}", name), status.message().to_string()).with_details(json!({
        "grpcCode": status.code() as i32,
        "message": status.message(),
    }))
}

/// Request message from the JSON input. Absent input is the empty message;
/// a non-object is only accepted when the message has no fields.
fn request_message(descriptor: MessageDescriptor, input: Option<&Value>) -> std::result::Result<DynamicMessage, ExecError> {
    match input {
        None | Some(Value::Null) => Ok(DynamicMessage::new(descriptor)),
        Some(value @ Value::Object(_)) => {
            let name = descriptor.full_name().to_string();
            DynamicMessage::deserialize(descriptor, value.clone()).map_err(|e| {
                ExecError::new(codes::INVALID_INPUT, format!("input does not match {}: {}", name, e))
            })
        }
        Some(_) if descriptor.fields().next().is_none() => Ok(DynamicMessage::new(descriptor)),
        Some(_) => Err(ExecError::new(
            codes::INVALID_INPUT,
            format!("input for {} must be an object", descriptor.full_name()),
        )),
    }
}

fn response_value(message: &DynamicMessage) -> std::result::Result<Value, ExecError> {
    serde_json::to_value(message)
        .map_err(|e| ExecError::new(codes::REQUEST_FAILED, format!("failed to encode response: {}", e)))
}

/// Everything needed to place one call
struct PreparedCall {
    channel: Channel,
    method: MethodDescriptor,
    path: PathAndQuery,
    request: tonic::Request<DynamicMessage>,
}

pub struct GrpcHandler {
    config: BinderyConfig,
}

impl GrpcHandler {
    pub fn new(config: BinderyConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        self.config.timeouts.for_protocol(FORMAT)
    }

    /// Descriptor set from inline content, else from live reflection
    async fn load_descriptors(&self, source: &Source) -> Result<FileDescriptorSet> {
        if let Some(content) = &source.content {
            return decode_descriptor_set(content);
        }
        let location = source
            .location
            .as_deref()
            .ok_or_else(|| BindError::load("gRPC source needs a location or descriptor content"))?;
        let target = parse_target(location, self.config.grpc.tls)?;
        let channel = connect(&target, self.timeout()).await?;
        let mut client = ReflectionClient::new(channel);
        let services = client.list_services().await?;
        info!("Discovered {} gRPC services at {}", services.len(), target.uri);
        client.file_set(&services).await
    }

    async fn prepare(&self, input: &ExecuteInput) -> std::result::Result<PreparedCall, ExecError> {
        let (service_name, method_name) = input
            .reference
            .rsplit_once('/')
            .filter(|(s, m)| !s.is_empty() && !m.is_empty())
            .ok_or_else(|| {
                ExecError::new(
                    codes::INVALID_REF,
                    format!("'{}' is not <package.Service>/<Method>", input.reference),
                )
            })?;
        let location = input
            .context
            .as_ref()
            .and_then(|c| c.server.clone())
            .or_else(|| input.source.location.clone())
            .ok_or_else(|| ExecError::new(codes::INVALID_INPUT, "no gRPC endpoint to dial"))?;
        let target = parse_target(&location, self.config.grpc.tls)
            .map_err(|e| ExecError::new(codes::INVALID_INPUT, e.to_string()))?;
        let timeout = input.timeout(self.timeout());
        let channel = connect(&target, timeout)
            .await
            .map_err(|e| ExecError::new(codes::CONNECT_FAILED, e.to_string()))?;

        // Descriptors are re-resolved on every call
        let set = match &input.source.content {
            Some(content) => decode_descriptor_set(content)?,
            None => {
                ReflectionClient::new(channel.clone())
                    .file_set(&[service_name.to_string()])
                    .await?
            }
        };
        let pool: DescriptorPool = build_pool(&set)?;
        let method = pool
            .get_service_by_name(service_name)
            .and_then(|service| service.methods().find(|m| m.name() == method_name))
            .ok_or_else(|| {
                ExecError::new(
                    codes::OPERATION_NOT_FOUND,
                    format!("method {} not found", input.reference),
                )
            })?;
        if method.is_client_streaming() {
            return Err(ExecError::new(
                codes::INVALID_REF,
                format!("{} is client streaming and cannot be invoked", input.reference),
            ));
        }

        let message = request_message(method.input(), input.input.as_ref())?;
        let mut request = tonic::Request::new(message);
        for (name, value) in input.headers() {
            match (
                AsciiMetadataKey::from_bytes(name.to_lowercase().as_bytes()),
                AsciiMetadataValue::try_from(value.as_str()),
            ) {
                (Ok(key), Ok(value)) => {
                    request.metadata_mut().insert(key, value);
                }
                _ => warn!("Skipping invalid gRPC metadata entry '{}'", name),
            }
        }
        let path = PathAndQuery::from_str(&format!("/{}/{}", service_name, method_name))
            .map_err(|e| ExecError::new(codes::INVALID_REF, e.to_string()))?;

        Ok(PreparedCall {
            channel,
            method,
            path,
            request,
        })
    }

    async fn invoke(&self, input: &ExecuteInput, started: Instant) -> std::result::Result<ExecuteOutput, ExecError> {
        let call = self.prepare(input).await?;
        debug!("gRPC call {}", call.path);
        let mut grpc = tonic::client::Grpc::new(call.channel);
        grpc.ready()
            .await
            .map_err(|e| ExecError::new(codes::CONNECT_FAILED, e.to_string()))?;
        let codec = DynamicCodec::new(call.method.output());

        if call.method.is_server_streaming() {
            let response = match grpc.server_streaming(call.request, call.path, codec).await {
                Ok(response) => response,
                Err(status) => return Ok(ExecuteOutput::failure(status_error(&status), started)),
            };
            let mut stream = response.into_inner();
            let mut messages = Vec::new();
            loop {
                match stream.message().await {
                    Ok(Some(message)) => messages.push(response_value(&message)?),
                    Ok(None) => break,
                    Err(status) => return Ok(ExecuteOutput::failure(status_error(&status), started)),
                }
            }
            let count = messages.len();
            return Ok(ExecuteOutput::success(Some(Value::Array(messages)), started)
                .with_metadata("messageCount", json!(count)));
        }

        match grpc.unary(call.request, call.path, codec).await {
            Ok(response) => {
                let value = response_value(response.get_ref())?;
                Ok(ExecuteOutput::success(Some(value), started))
            }
            Err(status) => Ok(ExecuteOutput::failure(status_error(&status), started)),
        }
    }
}

#[async_trait]
impl FormatHandler for GrpcHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo::new("grpc", "gRPC via server reflection")
    }

    async fn list_formats(&self) -> Result<Vec<String>> {
        Ok(vec![FORMAT.to_string()])
    }

    async fn create_interface(&self, source: &Source) -> Result<Interface> {
        let set = self.load_descriptors(source).await?;
        schema::pool_to_interface(&build_pool(&set)?, source)
    }

    async fn execute_operation(&self, ctx: &ExecContext, input: ExecuteInput) -> ExecuteOutput {
        let started = Instant::now();
        let timeout = input.timeout(self.timeout());
        match run_bounded(ctx, timeout, self.invoke(&input, started)).await {
            Ok(output) => output,
            Err(error) => ExecuteOutput::failure(error, started),
        }
    }

    fn as_subscriber(&self) -> Option<&dyn OperationSubscriber> {
        Some(self)
    }

    fn as_discoverer(&self) -> Option<&dyn SourceDiscoverer> {
        Some(self)
    }
}

#[async_trait]
impl OperationSubscriber for GrpcHandler {
    async fn subscribe_operation(
        &self,
        ctx: &ExecContext,
        input: ExecuteInput,
    ) -> std::result::Result<EventStream, ExecError> {
        let timeout = input.timeout(self.timeout());
        let setup = async {
            let call = self.prepare(&input).await?;
            if !call.method.is_server_streaming() {
                return Err(ExecError::new(
                    codes::NOT_SUBSCRIBABLE,
                    format!("{} is not a server-streaming method", input.reference),
                ));
            }
            let mut grpc = tonic::client::Grpc::new(call.channel);
            grpc.ready()
                .await
                .map_err(|e| ExecError::new(codes::CONNECT_FAILED, e.to_string()))?;
            let codec = DynamicCodec::new(call.method.output());
            grpc.server_streaming(call.request, call.path, codec)
                .await
                .map(tonic::Response::into_inner)
                .map_err(|status| status_error(&status))
        };
        let messages = run_bounded(ctx, timeout, setup).await?;

        let cancel = ctx.cancellation().child_token();
        let (sink, stream) = event_channel(cancel.clone());
        tokio::spawn(forward_messages(messages, sink, cancel));
        Ok(stream)
    }
}

#[async_trait]
impl SourceDiscoverer for GrpcHandler {
    async fn discover_source(&self, _ctx: &ExecContext, source: &Source) -> Result<Discovery> {
        let set = self.load_descriptors(source).await?;
        let interface = schema::pool_to_interface(&build_pool(&set)?, source)?;
        Ok(Discovery {
            raw: set.encode_to_vec(),
            interface,
        })
    }
}

/// Subscription worker: owns the response stream (and with it the channel)
async fn forward_messages(
    mut stream: tonic::Streaming<DynamicMessage>,
    sink: EventSink,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.message() => next,
        };
        match next {
            Ok(Some(message)) => match response_value(&message) {
                Ok(value) => {
                    if !sink.send(StreamEvent::data(value)).await {
                        break;
                    }
                }
                Err(error) => {
                    sink.fail(error).await;
                    break;
                }
            },
            Ok(None) => break,
            Err(status) => {
                // A cancelled call surfaces as a transport error; stay quiet
                if cancel.is_cancelled() {
                    break;
                }
                sink.fail(status_error(&status)).await;
                break;
            }
        }
    }
    debug!("gRPC stream worker finished");
}
