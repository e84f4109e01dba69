//! Protocol adapters
//!
//! One module per supported description format. Each exposes a handler type
//! implementing [`crate::handler::FormatHandler`].

pub mod asyncapi;
pub mod grpc;
pub mod mcp;
pub mod openapi;
pub mod usage;

use crate::handler::ExecContext;
use crate::model::{codes, ExecError};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Race `fut` against the call's cancellation signal and a timeout
pub(crate) async fn run_bounded<F, T>(
    ctx: &ExecContext,
    timeout: Duration,
    fut: F,
) -> std::result::Result<T, ExecError>
where
    F: Future<Output = std::result::Result<T, ExecError>>,
{
    tokio::select! {
        _ = ctx.cancellation().cancelled() => {
            Err(ExecError::new(codes::CANCELLED, "operation cancelled"))
        }
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(ExecError::new(
                codes::TIMEOUT,
                format!("operation timed out after {}ms", timeout.as_millis()),
            )),
        },
    }
}

/// Classify a reqwest failure into a stable error code
pub(crate) fn http_error(error: reqwest::Error) -> ExecError {
    let code = if error.is_timeout() {
        codes::TIMEOUT
    } else if error.is_connect() {
        codes::CONNECT_FAILED
    } else {
        codes::REQUEST_FAILED
    };
    ExecError::new(code, error.to_string())
}

/// Render a scalar for use in a URL, header or argv slot
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a response body as JSON when it looks like JSON, else keep the text
pub(crate) fn body_value(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(text.to_string()))
}
