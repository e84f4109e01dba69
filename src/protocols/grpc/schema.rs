//! Protobuf descriptors to JSON Schema, following the proto3 JSON mapping

use crate::error::Result;
use crate::model::{Interface, Operation, Source};
use crate::utils::KeyAllocator;
use prost_reflect::{DescriptorPool, FieldDescriptor, Kind, MessageDescriptor};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

use super::reflection::is_hidden_service;
use super::FORMAT;

/// JSON Schema for a message; recursive references collapse to a bare object
pub fn message_schema(message: &MessageDescriptor) -> Value {
    let mut visiting = HashSet::new();
    message_schema_guarded(message, &mut visiting)
}

/// Input schema for a method, `None` when the request message has no fields
pub fn input_schema(message: &MessageDescriptor) -> Option<Value> {
    if message.fields().next().is_none() {
        None
    } else {
        Some(message_schema(message))
    }
}

fn message_schema_guarded(message: &MessageDescriptor, visiting: &mut HashSet<String>) -> Value {
    if let Some(schema) = well_known_schema(message.full_name()) {
        return schema;
    }
    if !visiting.insert(message.full_name().to_string()) {
        return json!({"type": "object"});
    }
    let mut properties = Map::new();
    for field in message.fields() {
        properties.insert(field.json_name().to_string(), field_schema(&field, visiting));
    }
    visiting.remove(message.full_name());
    json!({"type": "object", "properties": properties})
}

fn field_schema(field: &FieldDescriptor, visiting: &mut HashSet<String>) -> Value {
    if field.is_map() {
        let value_schema = match field.kind() {
            Kind::Message(entry) => kind_schema(entry.map_entry_value_field().kind(), visiting),
            other => kind_schema(other, visiting),
        };
        return json!({"type": "object", "additionalProperties": value_schema});
    }
    let schema = kind_schema(field.kind(), visiting);
    if field.is_list() {
        json!({"type": "array", "items": schema})
    } else {
        schema
    }
}

fn kind_schema(kind: Kind, visiting: &mut HashSet<String>) -> Value {
    match kind {
        Kind::Double => json!({"type": "number", "format": "double"}),
        Kind::Float => json!({"type": "number", "format": "float"}),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => json!({"type": "integer", "format": "int32"}),
        Kind::Uint32 | Kind::Fixed32 => json!({"type": "integer", "format": "uint32", "minimum": 0}),
        // 64-bit integers are strings in the JSON mapping
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => json!({"type": "string", "format": "int64"}),
        Kind::Uint64 | Kind::Fixed64 => json!({"type": "string", "format": "uint64"}),
        Kind::Bool => json!({"type": "boolean"}),
        Kind::String => json!({"type": "string"}),
        Kind::Bytes => json!({"type": "string", "format": "byte"}),
        Kind::Enum(descriptor) => {
            let names: Vec<String> = descriptor.values().map(|v| v.name().to_string()).collect();
            json!({"type": "string", "enum": names})
        }
        Kind::Message(message) => message_schema_guarded(&message, visiting),
    }
}

fn well_known_schema(full_name: &str) -> Option<Value> {
    let schema = match full_name {
        "google.protobuf.Timestamp" => json!({"type": "string", "format": "date-time"}),
        "google.protobuf.Duration" => json!({"type": "string", "format": "duration"}),
        "google.protobuf.FieldMask" => json!({"type": "string"}),
        "google.protobuf.Struct" | "google.protobuf.Empty" => json!({"type": "object"}),
        "google.protobuf.Any" => json!({"type": "object", "properties": {"@type": {"type": "string"}}}),
        "google.protobuf.ListValue" => json!({"type": "array"}),
        "google.protobuf.Value" => json!({}),
        "google.protobuf.DoubleValue" | "google.protobuf.FloatValue" => json!({"type": "number"}),
        "google.protobuf.Int64Value" | "google.protobuf.UInt64Value" => json!({"type": "string"}),
        "google.protobuf.Int32Value" | "google.protobuf.UInt32Value" => json!({"type": "integer"}),
        "google.protobuf.BoolValue" => json!({"type": "boolean"}),
        "google.protobuf.StringValue" => json!({"type": "string"}),
        "google.protobuf.BytesValue" => json!({"type": "string", "format": "byte"}),
        _ => return None,
    };
    Some(schema)
}

/// Canonical interface for every visible service in `pool`
pub fn pool_to_interface(pool: &DescriptorPool, source: &Source) -> Result<Interface> {
    let mut interface = Interface::new(source.describe());
    interface.sources.insert(FORMAT.to_string(), source.clone());

    let mut services: Vec<_> = pool
        .services()
        .filter(|s| !is_hidden_service(s.full_name()))
        .collect();
    services.sort_by(|a, b| a.full_name().cmp(b.full_name()));

    let mut keys = KeyAllocator::new();
    for service in services {
        for method in service.methods() {
            // Client streaming (including bidi) has no request/response shape
            if method.is_client_streaming() {
                continue;
            }
            let key = keys.allocate(method.name(), Some(service.name()))?;
            let mut operation = if method.is_server_streaming() {
                let mut op = Operation::event();
                op.payload = Some(message_schema(&method.output()));
                op
            } else {
                let mut op = Operation::method();
                op.output = Some(message_schema(&method.output()));
                op
            };
            operation.input = input_schema(&method.input());
            operation.tags = vec![service.full_name().to_string()];
            let reference = format!("{}/{}", service.full_name(), method.name());
            interface.bind(key, operation, FORMAT, reference);
        }
    }
    interface.validate()?;
    Ok(interface)
}
