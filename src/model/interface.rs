//! Canonical interface document

use super::source::Source;
use crate::error::{BindError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Whether an operation is invoked (method) or subscribed to (event)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Method,
    Event,
}

/// An abstract method or event, independent of the invocation mechanism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub idempotent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Output schema for methods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Payload schema for events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub satisfies: Vec<String>,
}

impl Operation {
    pub fn method() -> Self {
        Self::new(OperationKind::Method)
    }

    pub fn event() -> Self {
        Self::new(OperationKind::Event)
    }

    fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            description: None,
            tags: Vec::new(),
            aliases: Vec::new(),
            deprecated: false,
            idempotent: false,
            input: None,
            output: None,
            payload: None,
            satisfies: Vec::new(),
        }
    }

    pub fn is_event(&self) -> bool {
        self.kind == OperationKind::Event
    }
}

/// Opaque input/output transform carried on a binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(rename = "type")]
    pub kind: String,
    pub expression: String,
}

/// Pairing of an operation with one source and a protocol-specific ref
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingEntry {
    pub operation: String,
    pub source: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transform: Option<Transform>,
}

impl BindingEntry {
    pub fn new<O, S, R>(operation: O, source: S, reference: R) -> Self
    where
        O: Into<String>,
        S: Into<String>,
        R: Into<String>,
    {
        Self {
            operation: operation.into(),
            source: source.into(),
            reference: reference.into(),
            priority: None,
            deprecated: false,
            input_transform: None,
            output_transform: None,
        }
    }

    /// Key under which the binding is stored: `<operation>.<source>`
    pub fn key(&self) -> String {
        format!("{}.{}", self.operation, self.source)
    }
}

/// The format-agnostic document produced by every handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub operations: BTreeMap<String, Operation>,
    #[serde(default)]
    pub sources: BTreeMap<String, Source>,
    #[serde(default)]
    pub bindings: BTreeMap<String, BindingEntry>,
}

impl Interface {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add an operation together with its binding against `source_key`
    pub fn bind(&mut self, key: String, operation: Operation, source_key: &str, reference: String) {
        let mut binding = BindingEntry::new(key.clone(), source_key, reference);
        binding.deprecated = operation.deprecated;
        self.bindings.insert(binding.key(), binding);
        self.operations.insert(key, operation);
    }

    /// Binding for an operation, if any
    pub fn binding_for(&self, operation: &str) -> Option<&BindingEntry> {
        self.bindings.values().find(|b| b.operation == operation)
    }

    /// Check that every binding points at an existing operation and source
    pub fn validate(&self) -> Result<()> {
        for (key, binding) in &self.bindings {
            if !self.operations.contains_key(&binding.operation) {
                return Err(BindError::convert(format!(
                    "binding '{}' references unknown operation '{}'",
                    key, binding.operation
                )));
            }
            if !self.sources.contains_key(&binding.source) {
                return Err(BindError::convert(format!(
                    "binding '{}' references unknown source '{}'",
                    key, binding.source
                )));
            }
            if *key != binding.key() {
                return Err(BindError::convert(format!(
                    "binding key '{}' does not match '{}'",
                    key,
                    binding.key()
                )));
            }
        }
        for key in self.operations.keys() {
            if !crate::utils::is_valid_key(key) {
                return Err(BindError::convert(format!("invalid operation key '{}'", key)));
            }
        }
        Ok(())
    }
}
