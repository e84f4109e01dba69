//! Usage command tree to canonical interface

use super::spec::{merge_globals, UsageArg, UsageCommand, UsageFlag, UsageSpec};
use crate::error::{BindError, Result};
use crate::model::{Interface, Operation, Source};
use crate::utils::KeyAllocator;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

pub(crate) const FORMAT: &str = "usage";

fn choices_or_string(choices: &[String]) -> Value {
    if choices.is_empty() {
        json!({"type": "string"})
    } else {
        json!({"type": "string", "enum": choices})
    }
}

fn variadic(items: Value, min: Option<u64>, max: Option<u64>) -> Value {
    let mut schema = json!({"type": "array", "items": items});
    if let Some(min) = min {
        schema["minItems"] = json!(min);
    }
    if let Some(max) = max {
        schema["maxItems"] = json!(max);
    }
    schema
}

fn with_help(mut schema: Value, help: &Option<String>) -> Value {
    if let Some(help) = help {
        schema["description"] = json!(help);
    }
    schema
}

pub fn flag_schema(flag: &UsageFlag) -> Value {
    let schema = if flag.count {
        json!({"type": "integer", "minimum": 0})
    } else if flag.value.is_none() {
        json!({"type": "boolean"})
    } else if flag.var {
        variadic(choices_or_string(&flag.choices), flag.var_min, flag.var_max)
    } else {
        choices_or_string(&flag.choices)
    };
    let mut schema = with_help(schema, &flag.help);
    if let Some(default) = &flag.default {
        schema["default"] = match (flag.is_boolean(), default.as_str()) {
            (true, "true") => json!(true),
            (true, "false") => json!(false),
            _ => json!(default),
        };
    }
    if flag.deprecated {
        schema["deprecated"] = json!(true);
    }
    schema
}

pub fn arg_schema(arg: &UsageArg) -> Value {
    let items = choices_or_string(&arg.choices);
    let schema = if arg.var {
        variadic(items, arg.var_min, arg.var_max)
    } else {
        items
    };
    let mut schema = with_help(schema, &arg.help);
    if let Some(default) = &arg.default {
        schema["default"] = json!(default);
    }
    schema
}

/// Input schema for one command. Local flags shadow inherited globals; any
/// other repeated name is an error.
pub fn command_schema(command: &UsageCommand, globals: &[UsageFlag]) -> Result<Value> {
    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut seen = HashSet::new();

    for flag in &command.flags {
        if !seen.insert(flag.name.clone()) {
            return Err(duplicate(command, &flag.name));
        }
        if flag.required && flag.default.is_none() {
            required.push(flag.name.clone());
        }
        properties.insert(flag.name.clone(), flag_schema(flag));
    }
    for arg in &command.args {
        if !seen.insert(arg.name.clone()) {
            return Err(duplicate(command, &arg.name));
        }
        // A default makes the argument optional for the caller
        if arg.required && arg.default.is_none() {
            required.push(arg.name.clone());
        }
        properties.insert(arg.name.clone(), arg_schema(arg));
    }
    for global in globals {
        if seen.insert(global.name.clone()) {
            properties.insert(global.name.clone(), flag_schema(global));
        }
    }

    let mut schema = json!({"type": "object", "properties": properties});
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    Ok(schema)
}

fn duplicate(command: &UsageCommand, name: &str) -> BindError {
    BindError::convert(format!(
        "command '{}' declares '{}' more than once",
        command.name, name
    ))
}

pub fn to_interface(spec: &UsageSpec, source: &Source) -> Result<Interface> {
    let mut interface = Interface::new(spec.name.clone().unwrap_or_else(|| spec.bin.clone()));
    interface.version = spec.version.clone().unwrap_or_default();
    interface.description = spec.about.clone();
    interface.sources.insert(FORMAT.to_string(), source.clone());

    let mut keys = KeyAllocator::new();
    walk(spec, &spec.root, &[], &[], &mut keys, &mut interface)?;
    interface.validate()?;
    Ok(interface)
}

fn walk(
    spec: &UsageSpec,
    command: &UsageCommand,
    path: &[String],
    inherited: &[UsageFlag],
    keys: &mut KeyAllocator,
    interface: &mut Interface,
) -> Result<()> {
    // A container that only dispatches to subcommands is not callable itself
    let container = command.subcommand_required && !command.subcommands.is_empty();
    if !container {
        let mut operation = Operation::method();
        operation.description = command.help.clone();
        operation.deprecated = command.deprecated;
        operation.aliases = command.aliases.clone();
        operation.tags = path[..path.len().saturating_sub(1)].to_vec();
        operation.input = Some(command_schema(command, inherited)?);
        let raw_key = if path.is_empty() {
            spec.bin.clone()
        } else {
            path.join(".")
        };
        let key = keys.allocate(&raw_key, Some("cmd"))?;
        interface.bind(key, operation, FORMAT, path.join(" "));
    }

    let globals = merge_globals(inherited, command);
    for sub in command.subcommands.iter().filter(|c| !c.hide) {
        let mut sub_path = path.to_vec();
        sub_path.push(sub.name.clone());
        walk(spec, sub, &sub_path, &globals, keys, interface)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::spec::tests::DEPLOY;
    use super::*;

    fn interface() -> Interface {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        to_interface(&spec, &Source::from_content("usage", DEPLOY)).unwrap()
    }

    #[test]
    fn test_command_tree_keys() {
        let iface = interface();
        let keys: Vec<&String> = iface.operations.keys().collect();
        // `app` requires a subcommand and is skipped
        assert_eq!(keys, vec!["app.push", "deploy", "status"]);
        assert_eq!(iface.binding_for("app.push").unwrap().reference, "app push");
        assert_eq!(iface.binding_for("deploy").unwrap().reference, "");
        assert_eq!(iface.operations["app.push"].tags, vec!["app"]);
        assert_eq!(iface.operations["app.push"].aliases, vec!["p"]);
    }

    #[test]
    fn test_push_schema() {
        let iface = interface();
        let schema = iface.operations["app.push"].input.as_ref().unwrap();
        let props = &schema["properties"];
        assert_eq!(props["force"]["type"], "boolean");
        assert_eq!(props["tag"]["type"], "array");
        assert_eq!(props["tag"]["minItems"], 1);
        assert_eq!(props["tag"]["maxItems"], 3);
        assert_eq!(props["verbose"]["type"], "integer");
        // Local --color shadows the global one with choices
        assert!(props["color"].get("enum").is_none());
        assert_eq!(props["files"]["type"], "array");
        // Required positional with a default is not required
        assert!(schema.get("required").is_none());
    }

    #[test]
    fn test_globals_inherited() {
        let iface = interface();
        let schema = iface.operations["status"].input.as_ref().unwrap();
        assert_eq!(schema["properties"]["color"]["enum"], json!(["auto", "always", "never"]));
        assert_eq!(schema["required"], json!(["service"]));
    }

    #[test]
    fn test_duplicate_name_is_error() {
        let text = "bin \"x\"\nflag \"--out <file>\"\narg \"<out>\"\n";
        let spec = UsageSpec::parse(text).unwrap();
        let err = to_interface(&spec, &Source::from_content("usage", text)).unwrap_err();
        assert!(matches!(err, BindError::Convert { .. }));
    }
}
