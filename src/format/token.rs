//! Format tokens (`<name>@<version-or-range>`) and version matching

use crate::error::{BindError, Result};
use semver::{Version, VersionReq};
use std::fmt;
use std::str::FromStr;

/// Version part of a token, classified by operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// No `@`: any version of the format
    Any,
    /// A concrete version; `None` when it is not semver (e.g. `2025-06-18`)
    Exact {
        raw: String,
        version: Option<Version>,
    },
    /// `^x.y.z`
    Caret(String),
    /// `~x.y.z`
    Tilde(String),
    /// Any other operator (`>=`, `<`, `*`, lists)
    Range(String),
}

impl VersionSpec {
    fn classify(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with('^') {
            return VersionSpec::Caret(raw.to_string());
        }
        if raw.starts_with('~') {
            return VersionSpec::Tilde(raw.to_string());
        }
        let bare = raw.strip_prefix('=').unwrap_or(raw).trim();
        let looks_exact = !bare.is_empty()
            && !bare.contains(['<', '>', '*', ',', ' ', '|'])
            && !bare.split('.').any(|part| part == "x" || part == "X");
        if looks_exact {
            VersionSpec::Exact {
                raw: bare.to_string(),
                version: coerce_version(bare),
            }
        } else {
            VersionSpec::Range(raw.to_string())
        }
    }

    /// Specificity tier of this spec, broad (0) to narrow (4)
    fn tier(&self) -> u8 {
        match self {
            VersionSpec::Any => 0,
            VersionSpec::Range(_) => 1,
            VersionSpec::Tilde(_) => 2,
            VersionSpec::Caret(_) => 3,
            VersionSpec::Exact { .. } => 4,
        }
    }

    fn range_text(&self) -> Option<&str> {
        match self {
            VersionSpec::Caret(r) | VersionSpec::Tilde(r) | VersionSpec::Range(r) => Some(r),
            _ => None,
        }
    }
}

/// Parse `1`, `1.2`, `v1.2.3` and full semver into a `Version`
pub fn coerce_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || !parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    let mut padded = parts.clone();
    while padded.len() < 3 {
        padded.push("0");
    }
    Version::parse(&padded.join(".")).ok()
}

/// Lowercased format name plus an optional version or range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatToken {
    name: String,
    version: Option<String>,
    spec: VersionSpec,
}

impl FormatToken {
    /// Parse a token, splitting on the last `@`
    pub fn parse(token: &str) -> Result<Self> {
        let normalized = token.trim().to_lowercase();
        let (name, version) = match normalized.rfind('@') {
            Some(at) => {
                let (name, rest) = normalized.split_at(at);
                let version = rest[1..].trim();
                if version.is_empty() {
                    return Err(BindError::invalid_token(token, "empty version after '@'"));
                }
                (name.trim().to_string(), Some(version.to_string()))
            }
            None => (normalized.clone(), None),
        };
        if name.is_empty() {
            return Err(BindError::invalid_token(token, "empty format name"));
        }
        let spec = version
            .as_deref()
            .map(VersionSpec::classify)
            .unwrap_or(VersionSpec::Any);
        Ok(Self {
            name,
            version,
            spec,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn spec(&self) -> &VersionSpec {
        &self.spec
    }

    pub fn is_name_only(&self) -> bool {
        self.version.is_none()
    }

    /// Specificity tier used when scoring preferences against `requested`.
    ///
    /// name-only (0) < unspecified range (1) < tilde (2) < caret (3) <
    /// exact (4) < identical string (5)
    pub fn specificity(&self, requested: &FormatToken) -> u8 {
        if self == requested {
            5
        } else {
            self.spec.tier()
        }
    }
}

impl fmt::Display for FormatToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for FormatToken {
    type Err = BindError;

    fn from_str(s: &str) -> Result<Self> {
        FormatToken::parse(s)
    }
}

/// Whether a handler declaring `candidate` can serve a request for `requested`
pub fn supports(candidate: &FormatToken, requested: &FormatToken) -> bool {
    if candidate.name != requested.name {
        return false;
    }
    match (&candidate.spec, &requested.spec) {
        (VersionSpec::Any, _) | (_, VersionSpec::Any) => true,
        (
            VersionSpec::Exact { raw: a, version: va },
            VersionSpec::Exact { raw: b, version: vb },
        ) => match (va, vb) {
            (Some(va), Some(vb)) => va == vb,
            _ => a == b,
        },
        (VersionSpec::Exact { version, .. }, range) | (range, VersionSpec::Exact { version, .. }) => {
            match (version, range.range_text()) {
                (Some(version), Some(text)) => range_contains(text, version),
                _ => false,
            }
        }
        (a, b) => ranges_overlap(a, b),
    }
}

fn range_contains(range: &str, version: &Version) -> bool {
    match VersionReq::parse(range) {
        Ok(req) => req.matches(version),
        Err(_) => false,
    }
}

/// Range/range matching. True intersection is not computed: only identical
/// ranges and caret ranges with the same major line are treated as overlapping.
fn ranges_overlap(a: &VersionSpec, b: &VersionSpec) -> bool {
    if let (Some(ta), Some(tb)) = (a.range_text(), b.range_text()) {
        if ta.replace(' ', "") == tb.replace(' ', "") {
            return true;
        }
    }
    match (a, b) {
        (VersionSpec::Caret(ra), VersionSpec::Caret(rb)) => {
            match (caret_line(ra), caret_line(rb)) {
                (Some(la), Some(lb)) => la == lb,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Compatibility line of a caret range: the major, or `0.minor` below 1.0
fn caret_line(range: &str) -> Option<(u64, Option<u64>)> {
    let version = coerce_version(range.trim_start_matches('^').trim())?;
    if version.major == 0 {
        Some((0, Some(version.minor)))
    } else {
        Some((version.major, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> FormatToken {
        FormatToken::parse(s).unwrap()
    }

    #[test]
    fn test_parse_splits_on_last_at() {
        let token = t("Usage@^2.0.0");
        assert_eq!(token.name(), "usage");
        assert_eq!(token.version(), Some("^2.0.0"));
        assert_eq!(token.to_string(), "usage@^2.0.0");

        let scoped = t("@scope/fmt@1.0.0");
        assert_eq!(scoped.name(), "@scope/fmt");
        assert_eq!(scoped.version(), Some("1.0.0"));

        assert!(t("openapi").is_name_only());
        assert!(FormatToken::parse("@1.0.0").is_err());
        assert!(FormatToken::parse("openapi@").is_err());
    }

    #[test]
    fn test_classification() {
        assert!(matches!(t("a@1.2.3").spec(), VersionSpec::Exact { version: Some(_), .. }));
        assert!(matches!(t("a@=1.2.3").spec(), VersionSpec::Exact { .. }));
        assert!(matches!(t("mcp@2025-06-18").spec(), VersionSpec::Exact { version: None, .. }));
        assert!(matches!(t("a@^1").spec(), VersionSpec::Caret(_)));
        assert!(matches!(t("a@~1.2").spec(), VersionSpec::Tilde(_)));
        assert!(matches!(t("a@>=1.0.0").spec(), VersionSpec::Range(_)));
        assert!(matches!(t("a@1.x").spec(), VersionSpec::Range(_)));
    }

    #[test]
    fn test_exact_matching_is_reflexive() {
        for raw in ["usage@2.1.0", "openapi@3.1.0", "mcp@2025-06-18", "grpc@1"] {
            assert!(supports(&t(raw), &t(raw)), "{} should match itself", raw);
        }
        assert!(supports(&t("openapi@3.1"), &t("openapi@3.1.0")));
        assert!(!supports(&t("openapi@3.1.0"), &t("openapi@3.0.0")));
    }

    #[test]
    fn test_caret_containment() {
        assert!(supports(&t("usage@^2.0.0"), &t("usage@2.1.0")));
        assert!(!supports(&t("usage@^2.0.0"), &t("usage@3.0.0")));
        assert!(supports(&t("usage@2.1.0"), &t("usage@^2.0.0")));
        assert!(!supports(&t("mcp@^1.0.0"), &t("mcp@2025-06-18")));
    }

    #[test]
    fn test_name_only_matches_any_version() {
        assert!(supports(&t("usage"), &t("usage@2.1.0")));
        assert!(supports(&t("usage"), &t("usage@^7")));
        assert!(supports(&t("usage@^2.0.0"), &t("usage")));
        assert!(!supports(&t("usage"), &t("openapi@3.0.0")));
    }

    #[test]
    fn test_range_overlap_fails_closed() {
        assert!(supports(&t("usage@^2.0.0"), &t("usage@^2.3.0")));
        assert!(!supports(&t("usage@^2.0.0"), &t("usage@^3.0.0")));
        assert!(!supports(&t("x@^0.1.0"), &t("x@^0.2.0")));
        assert!(!supports(&t("usage@>=2.0.0"), &t("usage@^2.0.0")));
        assert!(!supports(&t("usage@~2.1.0"), &t("usage@^2.0.0")));
        assert!(supports(&t("usage@>=2.0.0"), &t("usage@>= 2.0.0")));
    }

    #[test]
    fn test_specificity_tiers() {
        let requested = t("usage@2.1.0");
        assert_eq!(t("usage").specificity(&requested), 0);
        assert_eq!(t("usage@>=2.0.0").specificity(&requested), 1);
        assert_eq!(t("usage@~2.1.0").specificity(&requested), 2);
        assert_eq!(t("usage@^2.0.0").specificity(&requested), 3);
        assert_eq!(t("usage@2.1").specificity(&requested), 4);
        assert_eq!(t("usage@2.1.0").specificity(&requested), 5);
    }
}
