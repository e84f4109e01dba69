//! CLI usage-spec adapter
//!
//! Commands described by a usage KDL spec become methods. Invocation builds
//! an argv from the JSON input and runs the binary as a child process.

mod convert;
mod spec;

pub use spec::{DoubleDash, UsageArg, UsageCommand, UsageFlag, UsageSpec};

use crate::config::BinderyConfig;
use crate::error::Result;
use crate::handler::{ensure_version_supported, ExecContext, FormatHandler, HandlerInfo};
use crate::model::{codes, ExecError, ExecuteInput, ExecuteOutput, Interface, RuntimeContext, Source};
use crate::protocols::{run_bounded, scalar_text};
use async_trait::async_trait;
use convert::FORMAT;
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Usage spec releases this parser understands
const SUPPORTED_USAGE: &str = "<3.0.0";

/// Upper bound on repetitions of a count flag
const MAX_FLAG_COUNT: usize = 1024;

pub struct UsageHandler {
    config: BinderyConfig,
}

impl UsageHandler {
    pub fn new(config: BinderyConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        self.config.timeouts.for_protocol(FORMAT)
    }

    async fn load(&self, source: &Source) -> Result<UsageSpec> {
        let text = source.read_document(self.timeout()).await?;
        let spec = UsageSpec::parse(&text)?;
        if let Some(min) = &spec.min_usage_version {
            ensure_version_supported(FORMAT, min, SUPPORTED_USAGE)?;
        }
        Ok(spec)
    }

    async fn argv(&self, input: &ExecuteInput) -> std::result::Result<Vec<String>, ExecError> {
        let args = input
            .input_object()
            .ok_or_else(|| ExecError::new(codes::INVALID_INPUT, "usage input must be an object"))?;

        if let Some(binary) = &input.source.binary {
            let words = shlex::split(&input.reference).ok_or_else(|| {
                ExecError::new(codes::INVALID_REF, format!("cannot split '{}'", input.reference))
            })?;
            let mut argv = vec![binary.clone()];
            argv.extend(words);
            for (key, value) in &args {
                argv.extend(generic_flag(key, value));
            }
            return Ok(argv);
        }

        let spec = self.load(&input.source).await?;
        let (path, command, globals) = spec.find(&input.reference).ok_or_else(|| {
            ExecError::new(
                codes::OPERATION_NOT_FOUND,
                format!("no command '{}' in {}", input.reference, spec.bin),
            )
        })?;
        let mut argv = vec![spec.bin.clone()];
        argv.extend(path);
        argv.extend(command_args(command, &globals, &args)?);
        Ok(argv)
    }
}

/// Binary-hint mode: every key is a flag, single letters get one dash
fn generic_flag(key: &str, value: &Value) -> Vec<String> {
    let token = if key.chars().count() == 1 {
        format!("-{}", key)
    } else {
        format!("--{}", key)
    };
    match value {
        Value::Null | Value::Bool(false) => Vec::new(),
        Value::Bool(true) => vec![token],
        Value::Array(items) => items
            .iter()
            .flat_map(|item| [token.clone(), scalar_text(item)])
            .collect(),
        other => vec![token, scalar_text(other)],
    }
}

fn check_choice(name: &str, choices: &[String], value: &str) -> std::result::Result<(), ExecError> {
    if choices.is_empty() || choices.iter().any(|c| c == value) {
        Ok(())
    } else {
        Err(ExecError::new(
            codes::INVALID_INPUT,
            format!("'{}' is not one of {:?} for '{}'", value, choices, name),
        ))
    }
}

fn format_flag(flag: &UsageFlag, value: &Value) -> std::result::Result<Vec<String>, ExecError> {
    let token = flag.token();
    let invalid = |expected: &str| {
        ExecError::new(
            codes::INVALID_INPUT,
            format!("flag '{}' expects {}", flag.name, expected),
        )
    };
    if value.is_null() {
        return Ok(Vec::new());
    }
    if flag.count {
        let times = match value {
            Value::Bool(b) => usize::from(*b),
            other => other
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n <= MAX_FLAG_COUNT)
                .ok_or_else(|| invalid(&format!("an integer between 0 and {}", MAX_FLAG_COUNT)))?,
        };
        return Ok(vec![token; times]);
    }
    if flag.value.is_none() {
        return match value {
            Value::Bool(true) => Ok(vec![token]),
            Value::Bool(false) => Ok(flag.negate.iter().cloned().collect()),
            _ => Err(invalid("a boolean")),
        };
    }
    let values: Vec<String> = match value {
        Value::Array(items) if flag.var => items.iter().map(scalar_text).collect(),
        Value::Array(_) => return Err(invalid("a single value")),
        Value::Object(_) => return Err(invalid("a scalar value")),
        other => vec![scalar_text(other)],
    };
    let mut out = Vec::new();
    for value in values {
        check_choice(&flag.name, &flag.choices, &value)?;
        out.push(token.clone());
        out.push(value);
    }
    Ok(out)
}

/// Flags first, then positionals in declaration order with at most one `--`
fn command_args(
    command: &UsageCommand,
    globals: &[UsageFlag],
    args: &Map<String, Value>,
) -> std::result::Result<Vec<String>, ExecError> {
    let mut out = Vec::new();
    for (key, value) in args {
        if let Some(flag) = command.flag(key).or_else(|| globals.iter().find(|g| g.matches(key))) {
            out.extend(format_flag(flag, value)?);
        } else if command.arg(key).is_none() {
            return Err(ExecError::new(
                codes::INVALID_INPUT,
                format!("unknown input '{}' for command '{}'", key, command.name),
            ));
        }
    }

    let mut slots: Vec<(&UsageArg, Vec<String>)> = Vec::new();
    for arg in &command.args {
        let values = match args.get(&arg.name) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) if arg.var => items.iter().map(scalar_text).collect(),
            Some(Value::Array(_)) | Some(Value::Object(_)) => {
                return Err(ExecError::new(
                    codes::INVALID_INPUT,
                    format!("argument '{}' expects a single value", arg.name),
                ))
            }
            Some(other) => vec![scalar_text(other)],
        };
        for value in &values {
            check_choice(&arg.name, &arg.choices, value)?;
        }
        slots.push((arg, values));
    }

    // Positions must stay aligned: fill gaps before the last supplied value
    // with defaults
    let last = slots.iter().rposition(|(_, values)| !values.is_empty());
    for (index, (arg, values)) in slots.iter_mut().enumerate() {
        if !values.is_empty() {
            continue;
        }
        match (&arg.default, last) {
            (Some(default), Some(last)) if index < last => values.push(default.clone()),
            (None, Some(last)) if index < last => {
                return Err(ExecError::new(
                    codes::INVALID_INPUT,
                    format!("argument '{}' must be given before later arguments", arg.name),
                ))
            }
            (None, _) if arg.required => {
                return Err(ExecError::new(
                    codes::INVALID_INPUT,
                    format!("missing required argument '{}'", arg.name),
                ))
            }
            _ => {}
        }
    }

    let mut separated = false;
    for (arg, values) in slots {
        if values.is_empty() {
            continue;
        }
        let needs_separator = match arg.double_dash {
            DoubleDash::Required => true,
            DoubleDash::Optional => values.iter().any(|v| v.starts_with('-')),
            DoubleDash::Off => false,
        };
        if needs_separator && !separated {
            out.push("--".to_string());
            separated = true;
        }
        out.extend(values);
    }
    Ok(out)
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

async fn run(
    argv: Vec<String>,
    context: Option<&RuntimeContext>,
    started: Instant,
) -> std::result::Result<ExecuteOutput, ExecError> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| ExecError::new(codes::INVALID_REF, "empty command line"))?;
    debug!("Running {:?}", argv);

    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(context) = context {
        command.envs(&context.environment);
        if let Some(cwd) = &context.cwd {
            command.current_dir(cwd);
        }
    }
    let output = command
        .output()
        .await
        .map_err(|e| ExecError::new(codes::SPAWN_FAILED, format!("failed to run {}: {}", program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let parsed = if looks_like_json(&stdout) {
        serde_json::from_str::<Value>(stdout.trim()).ok()
    } else {
        None
    };
    let (value, stderr_meta) = match parsed {
        Some(value) => (value, Some(stderr.clone())),
        None => (json!({"stdout": stdout, "stderr": stderr}), None),
    };

    // Killed by a signal: no exit code
    let code = output.status.code().unwrap_or(-1);
    let mut result = if code == 0 {
        ExecuteOutput::success(Some(value), started)
    } else {
        let error = ExecError::new(codes::COMMAND_FAILED, format!("{} exited with status {}", program, code))
            .with_details(json!({"stderr": stderr}));
        ExecuteOutput::with_status(code, error, started).with_output(value)
    };
    if let Some(stderr) = stderr_meta.filter(|s| !s.is_empty()) {
        result = result.with_metadata("stderr", json!(stderr));
    }
    Ok(result.with_metadata("exitCode", json!(code)))
}

#[async_trait]
impl FormatHandler for UsageHandler {
    fn info(&self) -> HandlerInfo {
        HandlerInfo::new("usage", "Command line tools described by usage specs")
    }

    async fn list_formats(&self) -> Result<Vec<String>> {
        Ok(vec![format!("{}@^1.0.0", FORMAT), format!("{}@^2.0.0", FORMAT)])
    }

    async fn create_interface(&self, source: &Source) -> Result<Interface> {
        convert::to_interface(&self.load(source).await?, source)
    }

    async fn execute_operation(&self, ctx: &ExecContext, input: ExecuteInput) -> ExecuteOutput {
        let started = Instant::now();
        let timeout = input.timeout(self.timeout());
        let call = async {
            let argv = self.argv(&input).await?;
            run(argv, input.context.as_ref(), started).await
        };
        match run_bounded(ctx, timeout, call).await {
            Ok(output) => output,
            Err(error) => ExecuteOutput::failure(error, started),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::spec::tests::DEPLOY;
    use super::*;

    fn push() -> (UsageSpec, Vec<UsageFlag>) {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        let globals = spec.find("app push").unwrap().2;
        (spec, globals)
    }

    fn argv_for(input: Value) -> std::result::Result<Vec<String>, ExecError> {
        let (spec, globals) = push();
        let command = spec.find("app push").unwrap().1;
        command_args(command, &globals, input.as_object().unwrap())
    }

    #[test]
    fn test_false_flag_uses_negation() {
        assert_eq!(argv_for(json!({"force": false})).unwrap(), vec!["--no-force"]);
        assert_eq!(argv_for(json!({"force": true})).unwrap(), vec!["--force"]);
    }

    #[test]
    fn test_count_and_variadic_flags() {
        let argv = argv_for(json!({"verbose": 3, "tag": ["a", "b"]})).unwrap();
        assert_eq!(argv, vec!["--verbose", "--verbose", "--verbose", "--tag", "a", "--tag", "b"]);
    }

    #[test]
    fn test_count_flag_bounded() {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        let (_, status, globals) = spec.find("status").unwrap();
        let args = json!({"verbose": u64::MAX, "service": "x"});
        let err = command_args(status, &globals, args.as_object().unwrap()).unwrap_err();
        assert_eq!(err.code, codes::INVALID_INPUT);

        let args = json!({"verbose": MAX_FLAG_COUNT + 1, "service": "x"});
        assert!(command_args(status, &globals, args.as_object().unwrap()).is_err());

        let args = json!({"verbose": 2, "service": "x"});
        assert_eq!(
            command_args(status, &globals, args.as_object().unwrap()).unwrap(),
            vec!["--verbose", "--verbose", "x"]
        );
    }

    #[test]
    fn test_inherited_flag_by_short_letter() {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        let (_, status, globals) = spec.find("status").unwrap();
        let args = json!({"v": 1, "service": "x"});
        assert_eq!(
            command_args(status, &globals, args.as_object().unwrap()).unwrap(),
            vec!["--verbose", "x"]
        );
    }

    #[test]
    fn test_double_dash_and_defaults() {
        let argv = argv_for(json!({"files": ["-weird", "b"]})).unwrap();
        assert_eq!(argv, vec!["prod", "--", "-weird", "b"]);
        let argv = argv_for(json!({"target": "staging"})).unwrap();
        assert_eq!(argv, vec!["staging"]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = argv_for(json!({"nope": 1})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_INPUT);
    }

    #[test]
    fn test_global_choices_checked() {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        let (_, status, globals) = spec.find("status").unwrap();
        let args = json!({"service": "api", "color": "purple"});
        assert!(command_args(status, &globals, args.as_object().unwrap()).is_err());
        let args = json!({"service": "api", "color": "never"});
        assert_eq!(
            command_args(status, &globals, args.as_object().unwrap()).unwrap(),
            vec!["--color", "never", "api"]
        );
    }

    #[test]
    fn test_generic_flags() {
        assert_eq!(generic_flag("n", &json!(2)), vec!["-n", "2"]);
        assert_eq!(generic_flag("dry-run", &json!(true)), vec!["--dry-run"]);
        assert!(generic_flag("quiet", &json!(false)).is_empty());
    }

    #[tokio::test]
    async fn test_run_parses_json_stdout() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo '{\"ok\": true}'; echo warn >&2".to_string()];
        let output = run(argv, None, Instant::now()).await.unwrap();
        assert_eq!(output.status, 0);
        assert_eq!(output.output, Some(json!({"ok": true})));
        assert_eq!(output.metadata["stderr"], "warn\n");
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo oops; exit 3".to_string()];
        let output = run(argv, None, Instant::now()).await.unwrap();
        assert_eq!(output.status, 3);
        assert_eq!(output.error.unwrap().code, codes::COMMAND_FAILED);
        assert_eq!(output.output.unwrap()["stdout"], "oops\n");
    }
}
