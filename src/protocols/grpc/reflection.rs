//! gRPC server reflection client
//!
//! The reflection service messages are declared here with prost derives, so
//! no protoc step or generated code is needed. Each query opens its own
//! short-lived bidirectional stream carrying a single request.

use crate::error::{BindError, Result};
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::{HashMap, HashSet, VecDeque};
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tracing::debug;

const REFLECTION_V1: &str = "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo";
const REFLECTION_V1ALPHA: &str = "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";

/// Service name prefixes that describe infrastructure rather than the API
const HIDDEN_SERVICE_PREFIXES: [&str; 2] = ["grpc.reflection.", "grpc.health."];

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerReflectionRequest {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(oneof = "MessageRequest", tags = "3, 4, 7")]
    pub message_request: Option<MessageRequest>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum MessageRequest {
    #[prost(string, tag = "3")]
    FileByFilename(String),
    #[prost(string, tag = "4")]
    FileContainingSymbol(String),
    #[prost(string, tag = "7")]
    ListServices(String),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerReflectionResponse {
    #[prost(string, tag = "1")]
    pub valid_host: String,
    #[prost(oneof = "MessageResponse", tags = "4, 6, 7")]
    pub message_response: Option<MessageResponse>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum MessageResponse {
    #[prost(message, tag = "4")]
    FileDescriptorResponse(FileDescriptorResponse),
    #[prost(message, tag = "6")]
    ListServicesResponse(ListServiceResponse),
    #[prost(message, tag = "7")]
    ErrorResponse(ErrorResponse),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FileDescriptorResponse {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub file_descriptor_proto: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListServiceResponse {
    #[prost(message, repeated, tag = "1")]
    pub service: Vec<ServiceResponse>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceResponse {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorResponse {
    #[prost(int32, tag = "1")]
    pub error_code: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

pub fn is_hidden_service(name: &str) -> bool {
    HIDDEN_SERVICE_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub struct ReflectionClient {
    channel: Channel,
    path: &'static str,
}

impl ReflectionClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            path: REFLECTION_V1,
        }
    }

    async fn query(&mut self, request: MessageRequest) -> Result<MessageResponse> {
        let response = match self.query_path(self.path, request.clone()).await {
            Err(status) if status.code() == tonic::Code::Unimplemented && self.path == REFLECTION_V1 => {
                debug!("Reflection v1 unavailable, falling back to v1alpha");
                self.path = REFLECTION_V1ALPHA;
                self.query_path(self.path, request)
                    .await
                    .map_err(|s| BindError::load(format!("reflection failed: {}", s.message())))
            }
            Err(status) => Err(BindError::load(format!(
                "reflection failed ({:?}): {}",
                status.code(),
                status.message()
            ))),
            Ok(response) => Ok(response),
        }?;
        response.ok_or_else(|| BindError::load("reflection stream closed without a response"))
    }

    async fn query_path(
        &self,
        path: &'static str,
        request: MessageRequest,
    ) -> std::result::Result<Option<MessageResponse>, tonic::Status> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("channel not ready: {}", e)))?;
        let outbound = tokio_stream::iter(vec![ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        }]);
        let codec: ProstCodec<ServerReflectionRequest, ServerReflectionResponse> = ProstCodec::default();
        let response = grpc
            .streaming(tonic::Request::new(outbound), PathAndQuery::from_static(path), codec)
            .await?;
        let mut inbound = response.into_inner();
        Ok(inbound.message().await?.and_then(|r| r.message_response))
    }

    /// Fully qualified names of every exposed service, sorted
    pub async fn list_services(&mut self) -> Result<Vec<String>> {
        match self.query(MessageRequest::ListServices(String::new())).await? {
            MessageResponse::ListServicesResponse(list) => {
                let mut names: Vec<String> = list
                    .service
                    .into_iter()
                    .map(|s| s.name)
                    .filter(|name| !is_hidden_service(name))
                    .collect();
                names.sort();
                Ok(names)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn files(&mut self, request: MessageRequest) -> Result<Vec<FileDescriptorProto>> {
        match self.query(request).await? {
            MessageResponse::FileDescriptorResponse(files) => files
                .file_descriptor_proto
                .iter()
                .map(|bytes| {
                    FileDescriptorProto::decode(bytes.as_slice())
                        .map_err(|e| BindError::parse(format!("invalid file descriptor: {}", e)))
                })
                .collect(),
            other => Err(unexpected(other)),
        }
    }

    /// Files defining `symbols` plus all transitive dependencies, in
    /// dependency order
    pub async fn file_set(&mut self, symbols: &[String]) -> Result<FileDescriptorSet> {
        let mut files: HashMap<String, FileDescriptorProto> = HashMap::new();
        let mut pending: VecDeque<String> = VecDeque::new();

        for symbol in symbols {
            for file in self.files(MessageRequest::FileContainingSymbol(symbol.clone())).await? {
                pending.extend(file.dependency.iter().cloned());
                files.insert(file.name().to_string(), file);
            }
        }
        while let Some(name) = pending.pop_front() {
            if files.contains_key(&name) {
                continue;
            }
            for file in self.files(MessageRequest::FileByFilename(name.clone())).await? {
                pending.extend(file.dependency.iter().cloned());
                files.insert(file.name().to_string(), file);
            }
        }
        Ok(FileDescriptorSet {
            file: dependency_order(files),
        })
    }
}

fn unexpected(response: MessageResponse) -> BindError {
    match response {
        MessageResponse::ErrorResponse(e) => BindError::load(format!(
            "reflection error {}: {}",
            e.error_code, e.error_message
        )),
        _ => BindError::load("unexpected reflection response"),
    }
}

/// Topologically order files so every dependency precedes its dependents
fn dependency_order(mut files: HashMap<String, FileDescriptorProto>) -> Vec<FileDescriptorProto> {
    fn visit(
        name: &str,
        files: &mut HashMap<String, FileDescriptorProto>,
        seen: &mut HashSet<String>,
        out: &mut Vec<FileDescriptorProto>,
    ) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(file) = files.remove(name) else {
            return;
        };
        for dependency in &file.dependency {
            visit(dependency, files, seen, out);
        }
        out.push(file);
    }

    let mut names: Vec<String> = files.keys().cloned().collect();
    names.sort();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in names {
        visit(&name, &mut files, &mut seen, &mut out);
    }
    out
}

/// Build a pool from a descriptor set, on top of the well-known types
pub fn build_pool(set: &FileDescriptorSet) -> Result<DescriptorPool> {
    let mut pool = DescriptorPool::global();
    let missing: Vec<FileDescriptorProto> = set
        .file
        .iter()
        .filter(|f| pool.get_file_by_name(f.name()).is_none())
        .cloned()
        .collect();
    pool.add_file_descriptor_protos(missing)
        .map_err(|e| BindError::convert(format!("invalid descriptor set: {}", e)))?;
    Ok(pool)
}
