//! JSON pointer escaping and local `$ref` inlining for OpenAPI/AsyncAPI documents

use serde_json::{Map, Value};
use std::collections::HashSet;

/// Escape one pointer segment (`~` → `~0`, `/` → `~1`)
pub fn escape_pointer_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Reverse of [`escape_pointer_segment`]
pub fn unescape_pointer_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Look up a local reference such as `#/components/schemas/Pet`
pub fn lookup_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    root.pointer(pointer)
}

/// Inline every local `$ref` in `value`, resolving against `root`.
///
/// A reference already being expanded on the current path is replaced by an
/// empty schema, so recursive definitions terminate.
pub fn inline_refs(value: &Value, root: &Value) -> Value {
    let mut visiting = HashSet::new();
    inline_with_guard(value, root, &mut visiting)
}

fn inline_with_guard(value: &Value, root: &Value, visiting: &mut HashSet<String>) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if visiting.contains(reference) {
                    return Value::Object(Map::new());
                }
                return match lookup_ref(root, reference) {
                    Some(target) => {
                        visiting.insert(reference.clone());
                        let resolved = inline_with_guard(target, root, visiting);
                        visiting.remove(reference);
                        resolved
                    }
                    // External or dangling refs stay as they are
                    None => value.clone(),
                };
            }
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), inline_with_guard(item, root, visiting));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| inline_with_guard(item, root, visiting))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_escape_round_trip() {
        let path = "/pets/{id}~x";
        let escaped = escape_pointer_segment(path);
        assert_eq!(escaped, "~1pets~1{id}~0x");
        assert_eq!(unescape_pointer_segment(&escaped), path);
    }

    #[test]
    fn test_inline_recursive_ref() {
        let root = json!({
            "components": {"schemas": {
                "Node": {"type": "object", "properties": {
                    "child": {"$ref": "#/components/schemas/Node"},
                    "name": {"type": "string"}
                }}
            }}
        });
        let inlined = inline_refs(&json!({"$ref": "#/components/schemas/Node"}), &root);
        assert_eq!(inlined["properties"]["name"]["type"], "string");
        assert_eq!(inlined["properties"]["child"], json!({}));
    }
}
