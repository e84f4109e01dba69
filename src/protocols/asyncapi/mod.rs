//! AsyncAPI 3 adapter
//!
//! Only HTTP-family servers (`http`, `https`, `sse`) can be invoked: `send`
//! operations become an HTTP POST and `receive` operations read a
//! server-sent-events stream. Other transports convert fine but fail at
//! invocation time with `unsupported_protocol`.

mod convert;

use crate::config::BinderyConfig;
use crate::error::Result;
use crate::handler::{ExecContext, FormatHandler, HandlerInfo, OperationSubscriber};
use crate::model::{
    codes, event_channel, EventSink, EventStream, ExecError, ExecuteInput, ExecuteOutput, Interface,
    Source, StreamEvent,
};
use crate::protocols::{body_value, http_error, run_bounded};
use async_trait::async_trait;
use convert::{Action, AsyncApiDocument, ResolvedOperation, FORMAT, SUPPORTED};
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct AsyncApiHandler {
    config: BinderyConfig,
}

/// Target of one invocation after document and server resolution
struct Target {
    operation: ResolvedOperation,
    url: String,
    body: Value,
}

impl AsyncApiHandler {
    pub fn new(config: BinderyConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        self.config.timeouts.for_protocol(FORMAT)
    }

    async fn load(&self, source: &Source) -> Result<AsyncApiDocument> {
        let text = source.read_document(self.timeout()).await?;
        AsyncApiDocument::parse(&text)
    }

    async fn target(&self, input: &ExecuteInput) -> std::result::Result<Target, ExecError> {
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

        // The declared transport decides invocability even when the caller
        // overrides the base URL
        let declared = operation.servers.first();
        if let Some(server) = declared.filter(|s| !s.is_http_family()) {
            return Err(ExecError::new(
                codes::UNSUPPORTED_PROTOCOL,
                format!("protocol '{}' cannot be invoked; only http, https and sse are supported", server.protocol),
            ));
        }
        let base = match (input.context.as_ref().and_then(|c| c.server.clone()), declared) {
            (Some(server), _) => server,
            (None, Some(server)) => server.base_url(),
            (None, None) => {
                return Err(ExecError::new(
                    codes::UNSUPPORTED_PROTOCOL,
                    format!("operation '{}' has no server", operation.id),
                ))
            }
        };

        let args = input.input_object().unwrap_or_default();
        let address = operation.address_with(&args);
        let url = if address.is_empty() {
            base
        } else {
            format!("{}/{}", base.trim_end_matches('/'), address.trim_start_matches('/'))
        };
        Ok(Target {
            operation,
            url,
            body: input.input.clone().unwrap_or(Value::Null),
        })
    }

    fn max_events(&self, input: &ExecuteInput) -> usize {
        input
            .context
            .as_ref()
            .and_then(|c| c.max_events)
            .unwrap_or(self.config.asyncapi.max_events)
    }
}

#[async_trait]
impl FormatHandler for AsyncApiHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo::new("asyncapi", "AsyncAPI 3 over HTTP and server-sent events")
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
        let target = match run_bounded(ctx, timeout, self.target(&input)).await {
            Ok(target) => target,
            Err(error) => return ExecuteOutput::failure(error, started),
        };
        let headers = input.headers();

        match target.operation.action {
            Action::Send => {
                debug!("AsyncAPI send {} -> {}", target.operation.id, target.url);
                let result = run_bounded(ctx, timeout, post(&target, &headers, timeout, started)).await;
                result.unwrap_or_else(|error| ExecuteOutput::failure(error, started))
            }
            Action::Receive => {
                debug!("AsyncAPI receive {} <- {}", target.operation.id, target.url);
                let limit = self.max_events(&input);
                match collect_events(ctx, &target.url, &headers, timeout, limit).await {
                    Ok(events) => {
                        let count = events.len();
                        ExecuteOutput::success(Some(Value::Array(events)), started)
                            .with_metadata("eventCount", json!(count))
                    }
                    Err(error) => ExecuteOutput::failure(error, started),
                }
            }
        }
    }

    fn as_subscriber(&self) -> Option<&dyn OperationSubscriber> {
        Some(self)
    }
}

#[async_trait]
impl OperationSubscriber for AsyncApiHandler {
    async fn subscribe_operation(
        &self,
        ctx: &ExecContext,
        input: ExecuteInput,
    ) -> std::result::Result<EventStream, ExecError> {
        let timeout = input.timeout(self.timeout());
        let setup = async {
            let target = self.target(&input).await?;
            if target.operation.action != Action::Receive {
                return Err(ExecError::new(
                    codes::NOT_SUBSCRIBABLE,
                    format!("operation '{}' is not a receive operation", target.operation.id),
                ));
            }
            open_stream(&target.url, &input.headers(), timeout).await
        };
        let response = run_bounded(ctx, timeout, setup).await?;

        let cancel = ctx.cancellation().child_token();
        let (sink, stream) = event_channel(cancel.clone());
        tokio::spawn(forward_events(response, sink, cancel));
        Ok(stream)
    }
}

async fn post(
    target: &Target,
    headers: &std::collections::BTreeMap<String, String>,
    timeout: Duration,
    started: Instant,
) -> std::result::Result<ExecuteOutput, ExecError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ExecError::new(codes::REQUEST_FAILED, e.to_string()))?;
    let mut request = client.post(&target.url).json(&target.body);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await.map_err(http_error)?;
    let status = response.status();
    let text = response.text().await.map_err(http_error)?;
    let body = body_value(&text);

    if !status.is_success() {
        let error = ExecError::new(codes::http(status.as_u16()), format!("HTTP {}", status))
            .with_details(body.clone());
        return Ok(ExecuteOutput::with_status(status.as_u16() as i32, error, started)
            .with_metadata("httpStatus", json!(status.as_u16())));
    }
    // Fire-and-forget sends have no reply to return
    let output = target.operation.reply.as_ref().map(|_| body);
    Ok(ExecuteOutput::success(output, started).with_metadata("httpStatus", json!(status.as_u16())))
}

/// Connect to an SSE endpoint; connection-level failures are reported before
/// any worker is spawned
async fn open_stream(
    url: &str,
    headers: &std::collections::BTreeMap<String, String>,
    connect_timeout: Duration,
) -> std::result::Result<reqwest::Response, ExecError> {
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| ExecError::new(codes::REQUEST_FAILED, e.to_string()))?;
    let mut request = client.get(url).header(reqwest::header::ACCEPT, "text/event-stream");
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await.map_err(http_error)?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        return Err(ExecError::new(codes::http(status), format!("HTTP {} opening event stream", status)));
    }
    Ok(response)
}

fn event_data(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()))
}

fn sse_events(
    response: reqwest::Response,
) -> impl Stream<Item = std::result::Result<Value, String>> {
    response
        .bytes_stream()
        .eventsource()
        .map(|event| event.map(|e| event_data(&e.data)).map_err(|e| e.to_string()))
}

/// Bounded receive: stops at `limit` events, end of stream or timeout.
/// Hitting the timeout is not an error; the events seen so far are returned.
async fn collect_events(
    ctx: &ExecContext,
    url: &str,
    headers: &std::collections::BTreeMap<String, String>,
    timeout: Duration,
    limit: usize,
) -> std::result::Result<Vec<Value>, ExecError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let response = tokio::select! {
        _ = ctx.cancellation().cancelled() => return Err(ExecError::new(codes::CANCELLED, "operation cancelled")),
        _ = tokio::time::sleep_until(deadline) => return Err(ExecError::new(codes::TIMEOUT, "timed out opening event stream")),
        response = open_stream(url, headers, timeout) => response?,
    };
    let events = sse_events(response);
    tokio::pin!(events);

    let mut collected = Vec::new();
    while collected.len() < limit {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                return Err(ExecError::new(codes::CANCELLED, "operation cancelled"));
            }
            _ = tokio::time::sleep_until(deadline) => break,
            next = events.next() => match next {
                Some(Ok(data)) => collected.push(data),
                Some(Err(e)) => return Err(ExecError::new(codes::STREAM_ERROR, e)),
                None => break,
            },
        }
    }
    Ok(collected)
}

/// Subscription worker: sole owner of the connection and the sink
async fn forward_events(response: reqwest::Response, sink: EventSink, cancel: CancellationToken) {
    let events = sse_events(response);
    tokio::pin!(events);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => next,
        };
        match next {
            Some(Ok(data)) => {
                if !sink.send(StreamEvent::data(data)).await {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("Event stream failed: {}", e);
                sink.fail(ExecError::new(codes::STREAM_ERROR, e)).await;
                break;
            }
            None => break,
        }
    }
    debug!("Event stream worker finished");
}
