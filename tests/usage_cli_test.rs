//! CLI usage specs: conversion and argv synthesis against real shell scripts

#![cfg(unix)]

use bindery::model::{codes, RuntimeContext};
use bindery::{BinderyConfig, Engine, ExecContext, ExecuteInput, Source};
use serde_json::json;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Prints its argv as a JSON array
const ECHO_ARGS: &str = r#"#!/bin/sh
printf '{"argv": ['
sep=""
for a in "$@"; do
  printf '%s"%s"' "$sep" "$a"
  sep=","
done
printf ']}\n'
"#;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn usage_spec(bin: &Path) -> String {
    format!(
        r#"
bin "{}"
version "1.0.0"
about "Release helper"
flag "-q --quiet" global=true
cmd "app" subcommand_required=true {{
    cmd "push" {{
        alias "p"
        flag "-f --force" negate="--no-force"
        flag "--level <level>" {{
            choices "low" "high"
        }}
        arg "<target>" default="prod"
        arg "[extra]..." double_dash="optional"
    }}
}}
cmd "fail" {{
    arg "<code>"
}}
"#,
        bin.display()
    )
}

async fn engine() -> Engine {
    Engine::new(BinderyConfig::default()).await.unwrap()
}

#[tokio::test]
async fn test_convert_usage_spec_file() {
    let dir = TempDir::new().unwrap();
    let bin = script(dir.path(), "rel", ECHO_ARGS);
    let spec_path = dir.path().join("rel.usage.kdl");
    std::fs::write(&spec_path, usage_spec(&bin)).unwrap();

    let source = Source::from_location("usage@1.0.0", spec_path.to_string_lossy());
    let iface = engine().await.create_interface(&source).await.unwrap();
    assert!(iface.operations.contains_key("app.push"));
    assert!(iface.operations.contains_key("fail"));
    assert!(!iface.operations.contains_key("app"));
    let push = iface.operations["app.push"].input.as_ref().unwrap();
    assert_eq!(push["properties"]["quiet"]["type"], "boolean");
    assert_eq!(push["properties"]["level"]["enum"], json!(["low", "high"]));
}

#[tokio::test]
async fn test_execute_builds_argv_from_spec() {
    let dir = TempDir::new().unwrap();
    let bin = script(dir.path(), "rel", ECHO_ARGS);
    let source = Source::from_content("usage", usage_spec(&bin));

    let input = ExecuteInput::new(source, "app p")
        .with_input(json!({"force": false, "quiet": true, "extra": ["-x", "y"]}));
    let output = engine().await.execute(&ExecContext::new(), input).await;

    assert_eq!(output.status, 0, "{:?}", output.error);
    assert_eq!(
        output.output,
        Some(json!({"argv": ["app", "push", "--no-force", "--quiet", "prod", "--", "-x", "y"]}))
    );
    assert_eq!(output.metadata["exitCode"], 0);
}

#[tokio::test]
async fn test_invalid_choice_and_unknown_key() {
    let dir = TempDir::new().unwrap();
    let bin = script(dir.path(), "rel", ECHO_ARGS);
    let engine = engine().await;

    let input = ExecuteInput::new(Source::from_content("usage", usage_spec(&bin)), "app push")
        .with_input(json!({"level": "medium"}));
    let output = engine.execute(&ExecContext::new(), input).await;
    assert_eq!(output.error.unwrap().code, codes::INVALID_INPUT);

    let input = ExecuteInput::new(Source::from_content("usage", usage_spec(&bin)), "app push")
        .with_input(json!({"colour": "red"}));
    let output = engine.execute(&ExecContext::new(), input).await;
    assert_eq!(output.error.unwrap().code, codes::INVALID_INPUT);
}

#[tokio::test]
async fn test_nonzero_exit_is_command_failed() {
    let dir = TempDir::new().unwrap();
    let bin = script(dir.path(), "rel", "#!/bin/sh\necho \"failing with $2\" >&2\nexit \"$2\"\n");
    let source = Source::from_content("usage", usage_spec(&bin));

    let input = ExecuteInput::new(source, "fail").with_input(json!({"code": 4}));
    let output = engine().await.execute(&ExecContext::new(), input).await;

    assert_eq!(output.status, 4);
    let error = output.error.unwrap();
    assert_eq!(error.code, codes::COMMAND_FAILED);
    assert_eq!(output.output.unwrap()["stderr"], "failing with 4\n");
}

#[tokio::test]
async fn test_binary_hint_treats_keys_as_flags() {
    let dir = TempDir::new().unwrap();
    let bin = script(dir.path(), "tool", ECHO_ARGS);
    let source = Source::from_content("usage", "bin \"ignored\"").with_binary(bin.to_string_lossy());

    let input = ExecuteInput::new(source, "deploy 'two words'")
        .with_input(json!({"force": true, "n": 2, "skip": false}));
    let output = engine().await.execute(&ExecContext::new(), input).await;

    assert_eq!(
        output.output,
        Some(json!({"argv": ["deploy", "two words", "--force", "-n", "2"]}))
    );
}

#[tokio::test]
async fn test_environment_and_timeout() {
    let dir = TempDir::new().unwrap();
    let bin = script(dir.path(), "slow", "#!/bin/sh\nsleep 5\n");
    let source = Source::from_content("usage", "bin \"ignored\"").with_binary(bin.to_string_lossy());

    let input = ExecuteInput::new(source, "").with_context(RuntimeContext {
        timeout_ms: Some(200),
        ..Default::default()
    });
    let output = engine().await.execute(&ExecContext::new(), input).await;
    assert_eq!(output.error.unwrap().code, codes::TIMEOUT);

    let bin = script(dir.path(), "env", "#!/bin/sh\nprintf '{\"greeting\": \"%s\"}' \"$GREETING\"\n");
    let source = Source::from_content("usage", "bin \"ignored\"").with_binary(bin.to_string_lossy());
    let mut context = RuntimeContext::default();
    context.environment.insert("GREETING".to_string(), "hi".to_string());
    let input = ExecuteInput::new(source, "").with_context(context);
    let output = engine().await.execute(&ExecContext::new(), input).await;
    assert_eq!(output.output, Some(json!({"greeting": "hi"})));
}
