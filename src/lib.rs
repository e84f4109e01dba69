//! Bindery - one handler contract over heterogeneous API descriptions
//!
//! This crate discovers, converts and invokes operations described by OpenAPI,
//! AsyncAPI, gRPC server reflection, Model Context Protocol servers and CLI
//! usage specs. Every format is converted into the same canonical
//! [`Interface`] and invoked through the same [`ExecuteInput`] /
//! [`ExecuteOutput`] envelope, with a deterministic resolution engine choosing
//! among handlers that claim overlapping versions of a format.

pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod handler;
pub mod model;
pub mod protocols;
pub mod startup;
pub mod utils;

pub use config::BinderyConfig;
pub use engine::Engine;
pub use error::{BindError, Result};
pub use format::FormatToken;
pub use handler::{
    Discovery, ExecContext, FormatHandler, HandlerInfo, HandlerRegistry, OperationSubscriber,
    SourceDiscoverer,
};
pub use model::{
    EventStream, ExecError, ExecuteInput, ExecuteOutput, Interface, Operation, RuntimeContext,
    Source, StreamEvent,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "bindery.yaml";
