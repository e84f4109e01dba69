//! Bindery inspector
//!
//! Converts a source into its canonical interface, or invokes one operation,
//! and prints the result.

use anyhow::{bail, Context, Result};
use bindery::startup::init_logging;
use bindery::{BinderyConfig, Engine, ExecContext, ExecuteInput, RuntimeContext, Source};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "bindery-inspect")]
#[command(about = "Convert and invoke API descriptions through Bindery handlers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(clap::Args)]
struct SourceArgs {
    /// Format token, e.g. openapi@3.0.3 or mcp
    #[arg(short, long)]
    format: String,

    /// Path, URL, endpoint or command line
    #[arg(short, long, conflicts_with = "content_file")]
    location: Option<String>,

    /// Read inline document content from this file
    #[arg(long)]
    content_file: Option<PathBuf>,

    /// Executable hint for CLI usage sources
    #[arg(long)]
    binary: Option<String>,
}

impl SourceArgs {
    fn to_source(&self) -> Result<Source> {
        let content = match &self.content_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            ),
            None => None,
        };
        if self.location.is_none() && content.is_none() {
            bail!("either --location or --content-file is required");
        }
        Ok(Source {
            format: self.format.clone(),
            location: self.location.clone(),
            content,
            binary: self.binary.clone(),
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical interface for a source
    Convert {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Invoke one operation by ref
    Execute {
        #[command(flatten)]
        source: SourceArgs,

        /// Protocol-specific operation ref
        #[arg(long = "ref")]
        reference: String,

        /// JSON input value
        #[arg(short, long)]
        input: Option<String>,

        /// Timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List registered handlers and the formats they declare
    Handlers,
}

fn print<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let text = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    };
    println!("{}", text);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BinderyConfig::load(cli.config.as_ref()).context("failed to load configuration")?;
    init_logging(&config.logging)?;
    let engine = Engine::new(config).await?;

    match cli.command {
        Commands::Convert { source } => {
            let source = source.to_source()?;
            let interface = engine.create_interface(&source).await?;
            info!("Converted {} operations from {}", interface.operations.len(), source.describe());
            print(&interface, cli.output)?;
        }
        Commands::Execute {
            source,
            reference,
            input,
            timeout_ms,
        } => {
            let mut request = ExecuteInput::new(source.to_source()?, reference);
            if let Some(input) = input {
                request = request.with_input(serde_json::from_str(&input).context("--input is not valid JSON")?);
            }
            if timeout_ms.is_some() {
                request = request.with_context(RuntimeContext {
                    timeout_ms,
                    ..Default::default()
                });
            }
            let output = engine.execute(&ExecContext::new(), request).await;
            print(&output, cli.output)?;
            if !output.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Handlers => {
            let mut listing = serde_json::Map::new();
            for name in engine.registry().names() {
                if let Some(handler) = engine.registry().get(&name) {
                    listing.insert(name, serde_json::json!(handler.list_formats().await?));
                }
            }
            print(&listing, cli.output)?;
        }
    }
    Ok(())
}
