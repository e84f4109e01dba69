//! Invocation envelope: inputs, outputs, stream events and errors

use super::source::Source;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stable error codes reported in `ExecuteOutput.error`
pub mod codes {
    pub const DOC_LOAD_FAILED: &str = "doc_load_failed";
    pub const DOC_PARSE_FAILED: &str = "doc_parse_failed";
    pub const OPERATION_NOT_FOUND: &str = "operation_not_found";
    pub const INVALID_REF: &str = "invalid_ref";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const UNSUPPORTED_PROTOCOL: &str = "unsupported_protocol";
    pub const CONNECT_FAILED: &str = "connect_failed";
    pub const REQUEST_FAILED: &str = "request_failed";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const TOOL_ERROR: &str = "tool_error";
    pub const RPC_ERROR: &str = "rpc_error";
    pub const COMMAND_FAILED: &str = "command_failed";
    pub const SPAWN_FAILED: &str = "spawn_failed";
    pub const STREAM_ERROR: &str = "stream_error";
    pub const NOT_SUBSCRIBABLE: &str = "not_subscribable";
    pub const NO_HANDLER: &str = "no_handler";
    pub const AMBIGUOUS_HANDLER: &str = "ambiguous_handler";
    pub const DELEGATE_FAILED: &str = "delegate_failed";

    /// `http_<status>`
    pub fn http(status: u16) -> String {
        format!("http_{}", status)
    }
}

/// Uniform failure shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ExecError {
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ExecError {}

impl From<crate::error::BindError> for ExecError {
    fn from(error: crate::error::BindError) -> Self {
        use crate::error::Phase;
        let code = match error.phase() {
            Some(Phase::Load) => codes::DOC_LOAD_FAILED,
            Some(Phase::Parse) | Some(Phase::Version) | Some(Phase::Convert) => codes::DOC_PARSE_FAILED,
            None => match &error {
                crate::error::BindError::NoHandler { .. } => codes::NO_HANDLER,
                crate::error::BindError::AmbiguousHandler { .. } => codes::AMBIGUOUS_HANDLER,
                _ => codes::REQUEST_FAILED,
            },
        };
        ExecError::new(code, error.to_string())
    }
}

/// Optional per-call runtime context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    /// Extra HTTP headers / gRPC metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Extra environment variables for spawned processes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Server/base URL override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Working directory for spawned processes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Per-call timeout override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Upper bound on events collected by a blocking receive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events: Option<usize>,
}

/// Everything needed to invoke one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteInput {
    pub source: Source,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<RuntimeContext>,
}

impl ExecuteInput {
    pub fn new<R: Into<String>>(source: Source, reference: R) -> Self {
        Self {
            source,
            reference: reference.into(),
            input: None,
            context: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_context(mut self, context: RuntimeContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Effective timeout: the context override, else the protocol default
    pub fn timeout(&self, default: Duration) -> Duration {
        self.context
            .as_ref()
            .and_then(|c| c.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Input as an object; `None`/`null` become an empty object
    pub fn input_object(&self) -> Option<Map<String, Value>> {
        match &self.input {
            None | Some(Value::Null) => Some(Map::new()),
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => None,
        }
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        self.context.as_ref().map(|c| c.headers.clone()).unwrap_or_default()
    }
}

/// Result of a blocking invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// 0 = success, 1 = adapter-local failure, >1 = native protocol status
    pub status: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ExecuteOutput {
    pub fn success(output: Option<Value>, started: Instant) -> Self {
        Self {
            output,
            status: 0,
            duration_ms: elapsed_ms(started),
            error: None,
            metadata: Map::new(),
        }
    }

    /// Adapter-local failure (status 1)
    pub fn failure(error: ExecError, started: Instant) -> Self {
        Self::with_status(1, error, started)
    }

    pub fn with_status(status: i32, error: ExecError, started: Instant) -> Self {
        Self {
            output: None,
            status,
            duration_ms: elapsed_ms(started),
            error: Some(error),
            metadata: Map::new(),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// One item of a subscription; carries data or an error, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,
}

impl StreamEvent {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ExecError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Consumer side of a subscription. The queue closes when the worker exits.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Next event; `None` once the worker has closed the queue
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Ask the worker to stop
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream into a vector
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Producer side, owned by exactly one worker task
#[derive(Debug)]
pub struct EventSink {
    sender: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    /// Forward an event. Returns false when the consumer is gone or the
    /// subscription was cancelled.
    pub async fn send(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.sender.send(event) => sent.is_ok(),
        }
    }

    /// Report a transport error unless the subscription was cancelled first
    pub async fn fail(&self, error: ExecError) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.sender.send(StreamEvent::error(error)).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the subscription is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Create a bounded event queue tied to `cancel`
pub fn event_channel(cancel: CancellationToken) -> (EventSink, EventStream) {
    let (sender, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    (
        EventSink {
            sender,
            cancel: cancel.clone(),
        },
        EventStream { receiver, cancel },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_object_defaults() {
        let input = ExecuteInput::new(Source::default(), "x");
        assert_eq!(input.input_object(), Some(Map::new()));
        let scalar = ExecuteInput::new(Source::default(), "x").with_input(json!(3));
        assert_eq!(scalar.input_object(), None);
    }

    #[test]
    fn test_timeout_override() {
        let ctx = RuntimeContext {
            timeout_ms: Some(250),
            ..Default::default()
        };
        let input = ExecuteInput::new(Source::default(), "x").with_context(ctx);
        assert_eq!(input.timeout(Duration::from_secs(30)), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_queue_closes_when_sink_dropped() {
        let (sink, mut stream) = event_channel(CancellationToken::new());
        let worker = tokio::spawn(async move {
            assert!(sink.send(StreamEvent::data(json!(1))).await);
        });
        worker.await.unwrap();
        assert_eq!(stream.next().await, Some(StreamEvent::data(json!(1))));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_fail_suppressed_after_cancel() {
        let cancel = CancellationToken::new();
        let (sink, stream) = event_channel(cancel.clone());
        cancel.cancel();
        sink.fail(ExecError::new(codes::STREAM_ERROR, "broken pipe")).await;
        drop(sink);
        assert!(stream.collect().await.is_empty());
    }
}
