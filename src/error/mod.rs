//! Error handling module for Bindery
//!
//! Conversion calls return a phase-labelled [`BindError`]; invocation failures
//! never use this type and are reported through `ExecuteOutput.error` instead.

mod error;

// Re-export the main error types and utilities
pub use error::{BindError, Phase, Result};
