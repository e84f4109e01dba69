//! Typed model of a usage spec, parsed from KDL

use crate::error::{BindError, Result};
use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};

/// When a positional argument needs a `--` separator in front of it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DoubleDash {
    #[default]
    Off,
    /// Only when the value itself starts with `-`
    Optional,
    Required,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageArg {
    pub name: String,
    pub help: Option<String>,
    pub required: bool,
    pub var: bool,
    pub var_min: Option<u64>,
    pub var_max: Option<u64>,
    pub default: Option<String>,
    pub choices: Vec<String>,
    pub double_dash: DoubleDash,
    pub hide: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageFlag {
    /// Input key: the long name, else the short letter
    pub name: String,
    pub short: Option<char>,
    pub long: Option<String>,
    /// Value placeholder; `None` for boolean and count flags
    pub value: Option<String>,
    pub help: Option<String>,
    pub required: bool,
    pub count: bool,
    pub global: bool,
    pub var: bool,
    pub var_min: Option<u64>,
    pub var_max: Option<u64>,
    pub negate: Option<String>,
    pub default: Option<String>,
    pub choices: Vec<String>,
    pub hide: bool,
    pub deprecated: bool,
}

impl UsageFlag {
    /// The token placed on the command line
    pub fn token(&self) -> String {
        match (&self.long, self.short) {
            (Some(long), _) => format!("--{}", long),
            (None, Some(short)) => format!("-{}", short),
            (None, None) => format!("--{}", self.name),
        }
    }

    /// Accepts the input key, the long name or the short letter
    pub fn matches(&self, key: &str) -> bool {
        self.name == key || self.long.as_deref() == Some(key) || self.short.map(String::from).as_deref() == Some(key)
    }

    pub fn is_boolean(&self) -> bool {
        self.value.is_none() && !self.count
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageCommand {
    pub name: String,
    pub help: Option<String>,
    pub aliases: Vec<String>,
    pub flags: Vec<UsageFlag>,
    pub args: Vec<UsageArg>,
    pub subcommands: Vec<UsageCommand>,
    pub subcommand_required: bool,
    pub hide: bool,
    pub deprecated: bool,
}

impl UsageCommand {
    pub fn matches(&self, word: &str) -> bool {
        self.name == word || self.aliases.iter().any(|a| a == word)
    }

    /// Flag by input key or by any of its spellings
    pub fn flag(&self, key: &str) -> Option<&UsageFlag> {
        self.flags.iter().find(|f| f.matches(key))
    }

    pub fn arg(&self, key: &str) -> Option<&UsageArg> {
        self.args.iter().find(|a| a.name == key)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSpec {
    pub name: Option<String>,
    pub bin: String,
    pub version: Option<String>,
    pub about: Option<String>,
    pub min_usage_version: Option<String>,
    pub root: UsageCommand,
}

impl UsageSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let document: KdlDocument = text
            .parse()
            .map_err(|e| BindError::parse(format!("invalid usage KDL: {}", e)))?;

        let mut spec = UsageSpec::default();
        for node in document.nodes() {
            match node.name().value() {
                "name" => spec.name = first_string(node),
                "bin" => spec.bin = first_string(node).unwrap_or_default(),
                "version" => spec.version = first_string(node),
                "about" | "long_about" => {
                    if spec.about.is_none() {
                        spec.about = first_string(node)
                    }
                }
                "min_usage_version" => spec.min_usage_version = first_string(node),
                _ => {}
            }
        }
        if spec.bin.is_empty() {
            spec.bin = spec
                .name
                .clone()
                .ok_or_else(|| BindError::parse("usage spec declares neither bin nor name"))?;
        }
        spec.root = parse_command(spec.bin.clone(), &document)?;
        spec.root.help = spec.about.clone();
        Ok(spec)
    }

    /// Resolve a space-separated command path (names or aliases). Returns the
    /// canonical path, the command and the global flags in scope.
    pub fn find(&self, reference: &str) -> Option<(Vec<String>, &UsageCommand, Vec<UsageFlag>)> {
        let mut command = &self.root;
        let mut path = Vec::new();
        let mut globals = Vec::new();
        for word in reference.split_whitespace() {
            globals = merge_globals(&globals, command);
            command = command.subcommands.iter().find(|c| c.matches(word))?;
            path.push(command.name.clone());
        }
        Some((path, command, globals))
    }
}

/// Globals visible to the children of `command`; a redeclared name replaces
/// the inherited flag
pub fn merge_globals(inherited: &[UsageFlag], command: &UsageCommand) -> Vec<UsageFlag> {
    let mut merged: Vec<UsageFlag> = inherited
        .iter()
        .filter(|g| command.flag(&g.name).is_none())
        .cloned()
        .collect();
    merged.extend(command.flags.iter().filter(|f| f.global).cloned());
    merged
}

fn parse_command(name: String, body: &KdlDocument) -> Result<UsageCommand> {
    let mut command = UsageCommand {
        name,
        ..Default::default()
    };
    for node in body.nodes() {
        match node.name().value() {
            "flag" => command.flags.push(parse_flag(node)?),
            "arg" => command.args.push(parse_arg(node)?),
            "alias" => command.aliases.extend(strings(node)),
            "cmd" => {
                let name = first_string(node)
                    .ok_or_else(|| BindError::parse("cmd node without a name"))?;
                let empty = KdlDocument::new();
                let mut sub = parse_command(name, node.children().unwrap_or(&empty))?;
                sub.help = prop_string(node, "help").or(sub.help);
                sub.subcommand_required = prop_bool(node, "subcommand_required");
                sub.hide = prop_bool(node, "hide");
                sub.deprecated = prop_present(node, "deprecated");
                command.subcommands.push(sub);
            }
            _ => {}
        }
    }
    Ok(command)
}

/// Flag spec strings look like `-v --verbose`, `--color <when>`, `-o,--out [file]`
fn parse_flag(node: &KdlNode) -> Result<UsageFlag> {
    let spec = first_string(node).ok_or_else(|| BindError::parse("flag node without a spec"))?;
    let mut flag = UsageFlag::default();
    for part in spec.split(|c: char| c.is_whitespace() || c == ',').filter(|p| !p.is_empty()) {
        if let Some(long) = part.strip_prefix("--") {
            flag.long = Some(long.to_string());
        } else if part.starts_with('<') || part.starts_with('[') {
            let placeholder = part.trim_start_matches(['<', '[']).trim_end_matches("...");
            flag.var |= part.ends_with("...");
            flag.value = Some(placeholder.trim_end_matches(['>', ']']).to_string());
        } else if let Some(short) = part.strip_prefix('-') {
            flag.short = short.chars().next();
        }
    }
    flag.name = flag
        .long
        .clone()
        .or_else(|| flag.short.map(String::from))
        .ok_or_else(|| BindError::parse(format!("flag '{}' has no name", spec)))?;

    flag.help = prop_string(node, "help");
    flag.required = prop_bool(node, "required");
    flag.count = prop_bool(node, "count");
    flag.global = prop_bool(node, "global");
    flag.var |= prop_bool(node, "var");
    flag.var_min = prop_u64(node, "var_min");
    flag.var_max = prop_u64(node, "var_max");
    flag.negate = prop_string(node, "negate");
    flag.default = prop_text(node, "default");
    flag.hide = prop_bool(node, "hide");
    flag.deprecated = prop_present(node, "deprecated");
    flag.choices = child_choices(node);
    Ok(flag)
}

/// `<name>` is required, `[name]` optional, a trailing `...` makes it variadic
fn parse_arg(node: &KdlNode) -> Result<UsageArg> {
    let spec = first_string(node).ok_or_else(|| BindError::parse("arg node without a name"))?;
    let spec = spec.trim();
    let mut arg = UsageArg {
        var: spec.ends_with("..."),
        ..Default::default()
    };
    let bare = spec.trim_end_matches("...");
    arg.required = !bare.starts_with('[');
    arg.name = bare.trim_matches(['<', '>', '[', ']']).to_string();
    if arg.name.is_empty() {
        return Err(BindError::parse(format!("arg '{}' has no name", spec)));
    }

    if let Some(required) = prop_value(node, "required").and_then(KdlValue::as_bool) {
        arg.required = required;
    }
    arg.help = prop_string(node, "help");
    arg.var |= prop_bool(node, "var");
    arg.var_min = prop_u64(node, "var_min");
    arg.var_max = prop_u64(node, "var_max");
    arg.default = prop_text(node, "default");
    arg.hide = prop_bool(node, "hide");
    arg.choices = child_choices(node);
    arg.double_dash = match prop_string(node, "double_dash").as_deref() {
        Some("required") => DoubleDash::Required,
        Some("optional") | Some("automatic") => DoubleDash::Optional,
        _ => DoubleDash::Off,
    };
    Ok(arg)
}

fn positional(node: &KdlNode) -> impl Iterator<Item = &KdlEntry> {
    node.entries().iter().filter(|e| e.name().is_none())
}

fn first_string(node: &KdlNode) -> Option<String> {
    positional(node)
        .find_map(|e| e.value().as_string())
        .map(str::to_string)
}

fn strings(node: &KdlNode) -> Vec<String> {
    positional(node)
        .filter_map(|e| e.value().as_string())
        .map(str::to_string)
        .collect()
}

fn prop_value<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .map(KdlEntry::value)
}

fn prop_string(node: &KdlNode, key: &str) -> Option<String> {
    prop_value(node, key)
        .and_then(KdlValue::as_string)
        .map(str::to_string)
}

/// A property rendered as text whatever its KDL type
fn prop_text(node: &KdlNode, key: &str) -> Option<String> {
    prop_value(node, key).and_then(|value| {
        if let Some(s) = value.as_string() {
            Some(s.to_string())
        } else if let Some(b) = value.as_bool() {
            Some(b.to_string())
        } else {
            value.as_i64().map(|n| n.to_string())
        }
    })
}

fn prop_bool(node: &KdlNode, key: &str) -> bool {
    prop_value(node, key).and_then(KdlValue::as_bool).unwrap_or(false)
}

/// `deprecated` may be a bool or a message
fn prop_present(node: &KdlNode, key: &str) -> bool {
    match prop_value(node, key) {
        Some(value) => value.as_bool().unwrap_or(true),
        None => false,
    }
}

fn prop_u64(node: &KdlNode, key: &str) -> Option<u64> {
    prop_value(node, key)
        .and_then(KdlValue::as_i64)
        .and_then(|n| u64::try_from(n).ok())
}

fn child_choices(node: &KdlNode) -> Vec<String> {
    node.children()
        .map(|children| {
            children
                .nodes()
                .iter()
                .filter(|n| n.name().value() == "choices")
                .flat_map(strings)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const DEPLOY: &str = r#"
name "Deploy tool"
bin "deploy"
version "2.1.0"
about "Ship things"
min_usage_version "1.0.0"
flag "-v --verbose" help="Verbosity" count=true global=true
flag "--color <when>" global=true {
    choices "auto" "always" "never"
}
cmd "app" subcommand_required=true help="Application commands" {
    alias "a"
    cmd "push" help="Push a release" {
        alias "p"
        flag "-f --force" negate="--no-force"
        flag "--tag <tag>..." var=true var_min=1 var_max=3
        flag "--color <mode>"
        arg "<target>" default="prod"
        arg "[files]..." double_dash="required"
    }
}
cmd "status" {
    arg "<service>"
}
"#;

    #[test]
    fn test_parse_header_and_tree() {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        assert_eq!(spec.bin, "deploy");
        assert_eq!(spec.version.as_deref(), Some("2.1.0"));
        assert_eq!(spec.root.subcommands.len(), 2);
        let app = &spec.root.subcommands[0];
        assert!(app.subcommand_required);
        assert_eq!(app.aliases, vec!["a"]);
        assert_eq!(app.subcommands[0].name, "push");
    }

    #[test]
    fn test_parse_flags_and_args() {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        let verbose = spec.root.flag("verbose").unwrap();
        assert!(verbose.count && verbose.global);
        assert_eq!(verbose.short, Some('v'));

        let color = spec.root.flag("color").unwrap();
        assert_eq!(color.value.as_deref(), Some("when"));
        assert_eq!(color.choices, vec!["auto", "always", "never"]);

        let push = &spec.root.subcommands[0].subcommands[0];
        let force = push.flag("force").unwrap();
        assert!(force.is_boolean());
        assert_eq!(force.negate.as_deref(), Some("--no-force"));
        let tag = push.flag("tag").unwrap();
        assert!(tag.var);
        assert_eq!((tag.var_min, tag.var_max), (Some(1), Some(3)));

        assert!(push.args[0].required);
        assert_eq!(push.args[0].default.as_deref(), Some("prod"));
        assert!(!push.args[1].required && push.args[1].var);
        assert_eq!(push.args[1].double_dash, DoubleDash::Required);
    }

    #[test]
    fn test_find_by_alias() {
        let spec = UsageSpec::parse(DEPLOY).unwrap();
        let (path, command, globals) = spec.find("a p").unwrap();
        assert_eq!(path, vec!["app", "push"]);
        assert_eq!(command.name, "push");
        let names: Vec<&str> = globals.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["verbose", "color"]);
        assert!(spec.find("app missing").is_none());
        assert_eq!(spec.find("").unwrap().1.name, "deploy");
    }

    #[test]
    fn test_missing_bin_and_name() {
        assert!(UsageSpec::parse("version \"1\"").is_err());
        assert!(UsageSpec::parse("cmd {").is_err());
    }
}
