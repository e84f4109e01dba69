//! Canonical model shared by every handler
//!
//! Interfaces, operations, bindings and sources describe *what* can be called;
//! the execute types describe a single call. Everything here is produced fresh
//! per call and never cached.

pub mod execute;
pub mod interface;
pub mod source;

pub use execute::{
    codes, event_channel, EventSink, EventStream, ExecError, ExecuteInput, ExecuteOutput,
    RuntimeContext, StreamEvent,
};
pub use interface::{BindingEntry, Interface, Operation, OperationKind, Transform};
pub use source::{parse_document, Source};
