//! AsyncAPI send/receive over HTTP and server-sent events

use bindery::model::{codes, RuntimeContext};
use bindery::{BinderyConfig, Engine, ExecContext, ExecuteInput, Source};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn document(host: &str) -> String {
    format!(
        r##"
asyncapi: 3.0.0
info:
  title: Orders
  version: 1.0.0
servers:
  local:
    host: "{host}"
    protocol: http
  queue:
    host: mq.example.com
    protocol: amqp
channels:
  orders:
    address: /orders/{{region}}
    servers:
      - $ref: "#/servers/local"
    messages:
      created:
        payload:
          type: object
          properties:
            id: {{type: integer}}
  feed:
    address: /feed
    servers:
      - $ref: "#/servers/local"
    messages:
      tick:
        payload: {{type: object}}
  audit:
    address: audit
    servers:
      - $ref: "#/servers/queue"
    messages:
      entry:
        payload: {{type: object}}
operations:
  placeOrder:
    action: send
    channel: {{$ref: "#/channels/orders"}}
    reply:
      messages:
        - payload: {{type: object}}
  recordAudit:
    action: send
    channel: {{$ref: "#/channels/audit"}}
  onTick:
    action: receive
    channel: {{$ref: "#/channels/feed"}}
"##
    )
}

fn host_of(uri: &str) -> String {
    uri.trim_start_matches("http://").to_string()
}

async fn engine() -> Engine {
    Engine::new(BinderyConfig::default()).await.unwrap()
}

#[tokio::test]
async fn test_send_posts_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/eu"))
        .and(body_json(json!({"region": "eu", "id": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accepted": true})))
        .expect(1)
        .mount(&server)
        .await;

    let source = Source::from_content("asyncapi@3.0.0", document(&host_of(&server.uri())));
    let input = ExecuteInput::new(source, "#/operations/placeOrder").with_input(json!({"region": "eu", "id": 1}));
    let output = engine().await.execute(&ExecContext::new(), input).await;

    assert!(output.is_success(), "{:?}", output.error);
    assert_eq!(output.output, Some(json!({"accepted": true})));
}

#[tokio::test]
async fn test_receive_collects_bounded_events() {
    let server = MockServer::start().await;
    let body = "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: {\"n\":3}\n\n";
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let source = Source::from_content("asyncapi", document(&host_of(&server.uri())));
    let input = ExecuteInput::new(source, "#/operations/onTick").with_context(RuntimeContext {
        max_events: Some(2),
        ..Default::default()
    });
    let output = engine().await.execute(&ExecContext::new(), input).await;

    assert!(output.is_success(), "{:?}", output.error);
    assert_eq!(output.output, Some(json!([{"n": 1}, {"n": 2}])));
    assert_eq!(output.metadata["eventCount"], 2);
}

#[tokio::test]
async fn test_subscription_ends_with_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: 1\n\ndata: done\n\n", "text/event-stream"))
        .mount(&server)
        .await;

    let source = Source::from_content("asyncapi", document(&host_of(&server.uri())));
    let input = ExecuteInput::new(source, "#/operations/onTick");
    let stream = engine().await.subscribe(&ExecContext::new(), input).await.unwrap();
    let events = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .unwrap();

    let data: Vec<_> = events.into_iter().map(|e| e.data.unwrap()).collect();
    assert_eq!(data, vec![json!(1), json!("done")]);
}

#[tokio::test]
async fn test_send_is_not_subscribable() {
    let source = Source::from_content("asyncapi", document("127.0.0.1:9"));
    let input = ExecuteInput::new(source, "#/operations/placeOrder");
    let err = engine().await.subscribe(&ExecContext::new(), input).await.unwrap_err();
    assert_eq!(err.code, codes::NOT_SUBSCRIBABLE);
}

#[tokio::test]
async fn test_non_http_transport_fails_at_invocation() {
    let source = Source::from_content("asyncapi", document("127.0.0.1:9"));
    let engine = engine().await;
    // Conversion succeeds even though amqp cannot be invoked
    let iface = engine.create_interface(&source).await.unwrap();
    assert!(iface.operations.contains_key("recordAudit"));

    let input = ExecuteInput::new(source, "#/operations/recordAudit").with_input(json!({}));
    let output = engine.execute(&ExecContext::new(), input).await;
    assert_eq!(output.error.unwrap().code, codes::UNSUPPORTED_PROTOCOL);
}

#[tokio::test]
async fn test_server_override_keeps_declared_transport() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let source = Source::from_content("asyncapi", document("127.0.0.1:9"));
    let input = ExecuteInput::new(source, "#/operations/recordAudit")
        .with_input(json!({}))
        .with_context(RuntimeContext {
            server: Some(server.uri()),
            ..Default::default()
        });
    let output = engine().await.execute(&ExecContext::new(), input).await;
    assert_eq!(output.status, 1);
    assert_eq!(output.error.unwrap().code, codes::UNSUPPORTED_PROTOCOL);
}

/// An SSE endpoint that sends one event and then holds the connection open
async fn stalled_feed() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n")
            .await
            .unwrap();
        socket.write_all(b"data: {\"n\":1}\n\n").await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(socket);
    });
    addr.to_string()
}

#[tokio::test]
async fn test_cancel_closes_queue_without_error() {
    let host = stalled_feed().await;
    let source = Source::from_content("asyncapi", document(&host));
    let input = ExecuteInput::new(source, "#/operations/onTick");
    let mut stream = engine().await.subscribe(&ExecContext::new(), input).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.data, Some(json!({"n": 1})));

    // The worker is now blocked waiting for the next event
    stream.cancel();
    let rest = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .unwrap();
    assert!(rest.iter().all(|e| e.error.is_none()));
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_context_cancellation_stops_blocking_receive() {
    let host = stalled_feed().await;
    let source = Source::from_content("asyncapi", document(&host));
    let input = ExecuteInput::new(source, "#/operations/onTick");
    let ctx = ExecContext::new();
    let cancel = ctx.cancellation().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let output = engine().await.execute(&ctx, input).await;
    assert_eq!(output.error.unwrap().code, codes::CANCELLED);
}

/// Accepts connections and never answers
async fn silent_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(socket);
    });
    addr.to_string()
}

#[tokio::test]
async fn test_subscribe_setup_respects_timeout() {
    let host = silent_peer().await;
    let source = Source::from_content("asyncapi", document(&host));
    let input = ExecuteInput::new(source, "#/operations/onTick").with_context(RuntimeContext {
        timeout_ms: Some(200),
        ..Default::default()
    });
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        engine().await.subscribe(&ExecContext::new(), input),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.code, codes::TIMEOUT);
}

#[tokio::test]
async fn test_document_load_observes_cancellation() {
    let host = silent_peer().await;
    let source = Source::from_location("asyncapi", format!("http://{}/asyncapi.yaml", host));
    let input = ExecuteInput::new(source, "#/operations/placeOrder").with_input(json!({}));
    let ctx = ExecContext::new();
    let cancel = ctx.cancellation().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let output = tokio::time::timeout(Duration::from_secs(5), async {
        engine().await.execute(&ctx, input).await
    })
    .await
    .unwrap();
    assert_eq!(output.error.unwrap().code, codes::CANCELLED);
}
