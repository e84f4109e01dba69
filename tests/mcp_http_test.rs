//! MCP over Streamable HTTP: JSON, batch and SSE replies with session echo

use bindery::model::{codes, RuntimeContext};
use bindery::{BinderyConfig, Engine, ExecContext, ExecuteInput, Source};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION: &str = "session-7";

fn sse(messages: &[Value]) -> String {
    messages
        .iter()
        .map(|m| format!("event: message\ndata: {}\n\n", m))
        .collect()
}

/// Handshake mocks; later requests must echo the session id
async fn mount_handshake(server: &MockServer, capabilities: Value) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", SESSION)
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 0,
                    "result": {
                        "protocolVersion": "2025-06-18",
                        "capabilities": capabilities,
                        "serverInfo": {"name": "remote", "version": "3.1.0"}
                    }
                })),
        )
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", SESSION))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(server)
        .await;
}

async fn engine() -> Engine {
    Engine::new(BinderyConfig::default()).await.unwrap()
}

#[tokio::test]
async fn test_discover_over_http() {
    let server = MockServer::start().await;
    mount_handshake(&server, json!({"tools": {}, "resources": {}})).await;

    // Progress notification first, then the response
    let tools = sse(&[
        json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"progress": 1}}),
        json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": [
            {"name": "search", "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}}
        ]}}),
    ]);
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", SESSION))
        .and(header("mcp-protocol-version", "2025-06-18"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(tools, "text/event-stream"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "resources/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"jsonrpc": "2.0", "method": "notifications/message", "params": {}},
            {"jsonrpc": "2.0", "id": 2, "result": {"resources": [{"uri": "file:///readme", "name": "readme"}]}}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "resources/templates/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32601, "message": "method not found"}
        })))
        .mount(&server)
        .await;

    let source = Source::from_location("mcp", format!("{}/mcp", server.uri()));
    let discovery = engine().await.discover(&ExecContext::new(), &source).await.unwrap();
    let iface = &discovery.interface;

    assert_eq!(iface.name, "remote");
    assert_eq!(iface.version, "3.1.0");
    assert_eq!(iface.operations.len(), 2);
    assert_eq!(iface.binding_for("search").unwrap().reference, "tools/search");
    assert_eq!(iface.binding_for("readme").unwrap().reference, "resources/file:///readme");
}

#[tokio::test]
async fn test_tool_call_over_http_echoes_session_and_headers() {
    let server = MockServer::start().await;
    mount_handshake(&server, json!({"tools": {}})).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", SESSION))
        .and(header("x-api-key", "k1"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"q": "rust"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[json!({"jsonrpc": "2.0", "id": 1, "result": {
                "content": [{"type": "text", "text": "found 3"}]
            }})]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let source = Source::from_location("mcp", format!("{}/mcp", server.uri()));
    let mut context = RuntimeContext::default();
    context.headers.insert("x-api-key".to_string(), "k1".to_string());
    let input = ExecuteInput::new(source, "tools/search")
        .with_input(json!({"q": "rust"}))
        .with_context(context);
    let output = engine().await.execute(&ExecContext::new(), input).await;

    assert!(output.is_success(), "{:?}", output.error);
    assert_eq!(output.output, Some(json!("found 3")));
}

#[tokio::test]
async fn test_resource_read_over_http() {
    let server = MockServer::start().await;
    mount_handshake(&server, json!({"resources": {}})).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({
            "method": "resources/read",
            "params": {"uri": "file:///readme"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"contents": [{"uri": "file:///readme", "text": "hello"}]}
        })))
        .mount(&server)
        .await;

    let source = Source::from_location("mcp", format!("{}/mcp", server.uri()));
    let output = engine()
        .await
        .execute(&ExecContext::new(), ExecuteInput::new(source, "resources/file:///readme"))
        .await;
    assert!(output.is_success(), "{:?}", output.error);
    assert_eq!(output.output, Some(json!("hello")));
}

#[tokio::test]
async fn test_http_error_status_is_a_request_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let source = Source::from_location("mcp", format!("{}/mcp", server.uri()));
    let output = engine()
        .await
        .execute(&ExecContext::new(), ExecuteInput::new(source, "tools/search"))
        .await;
    assert_eq!(output.error.unwrap().code, codes::REQUEST_FAILED);
}

#[tokio::test]
async fn test_sse_stream_without_response() {
    let server = MockServer::start().await;
    mount_handshake(&server, json!({"tools": {}})).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[json!({"jsonrpc": "2.0", "id": 99, "result": {}})]),
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let source = Source::from_location("mcp", format!("{}/mcp", server.uri()));
    let output = engine()
        .await
        .execute(&ExecContext::new(), ExecuteInput::new(source, "tools/search"))
        .await;
    assert_eq!(output.error.unwrap().code, codes::REQUEST_FAILED);
}
