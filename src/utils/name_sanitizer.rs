use crate::error::{BindError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Characters that may not appear in an operation key
static KEY_SANITIZER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("Invalid regex pattern"));

static VALID_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("Invalid regex pattern"));

/// Fallback key for identifiers with no usable characters
pub const UNNAMED_KEY: &str = "unnamed";

/// Upper bound on numeric suffixes tried before giving up
const MAX_SUFFIX: usize = 10_000;

/// Sanitizes a native identifier into an operation key:
/// - Only `A-Z a-z 0-9 . _ -` are kept
/// - Never empty (falls back to `unnamed`)
pub fn sanitize_key(raw_name: &str) -> String {
    let sanitized = KEY_SANITIZER_REGEX.replace_all(raw_name, "");
    if sanitized.is_empty() {
        UNNAMED_KEY.to_string()
    } else {
        sanitized.into_owned()
    }
}

/// True when `key` is non-empty and uses only the allowed characters
pub fn is_valid_key(key: &str) -> bool {
    VALID_KEY_REGEX.is_match(key)
}

/// Hands out unique operation keys within one conversion.
///
/// A colliding key is first retried with the caller's type prefix
/// (`<prefix>_<key>`), then with numeric suffixes (`-2`, `-3`, ...).
#[derive(Debug, Default)]
pub struct KeyAllocator {
    used: HashSet<String>,
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a key that must not be handed out later
    pub fn reserve(&mut self, key: &str) {
        self.used.insert(key.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.used.contains(key)
    }

    /// Allocate a unique key for `raw_name`
    pub fn allocate(&mut self, raw_name: &str, type_prefix: Option<&str>) -> Result<String> {
        let base = sanitize_key(raw_name);
        if self.used.insert(base.clone()) {
            return Ok(base);
        }

        let candidate = match type_prefix {
            Some(prefix) => {
                let prefixed = sanitize_key(&format!("{}_{}", prefix, base));
                if self.used.insert(prefixed.clone()) {
                    return Ok(prefixed);
                }
                prefixed
            }
            None => base,
        };

        for n in 2..MAX_SUFFIX {
            let suffixed = format!("{}-{}", candidate, n);
            if self.used.insert(suffixed.clone()) {
                return Ok(suffixed);
            }
        }

        Err(BindError::convert(format!(
            "operation key space exhausted for '{}'",
            raw_name
        )))
    }
}
