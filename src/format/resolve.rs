//! Deterministic handler resolution
//!
//! Order: explicit preferences (most specific wins), built-in handlers, then a
//! probe of every registered delegate.

use super::token::{supports, FormatToken};
use crate::error::{BindError, Result};
use crate::handler::{FormatHandler, HandlerRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// An externally registered handler, identified by a caller-chosen id
#[derive(Clone)]
pub struct RegisteredDelegate {
    pub id: String,
    pub handler: Arc<dyn FormatHandler>,
}

impl RegisteredDelegate {
    pub fn new<I: Into<String>>(id: I, handler: Arc<dyn FormatHandler>) -> Self {
        Self {
            id: id.into(),
            handler,
        }
    }
}

impl std::fmt::Debug for RegisteredDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredDelegate").field("id", &self.id).finish()
    }
}

/// Outcome of resolution
#[derive(Clone)]
pub enum Resolved {
    /// A compiled-in handler
    Builtin(Arc<dyn FormatHandler>),
    /// A delegate chosen by preference or probe. `handler` is `None` when a
    /// preference names a delegate that is not registered.
    Delegate {
        id: String,
        handler: Option<Arc<dyn FormatHandler>>,
    },
}

impl Resolved {
    pub fn handler(&self) -> Option<Arc<dyn FormatHandler>> {
        match self {
            Resolved::Builtin(handler) => Some(handler.clone()),
            Resolved::Delegate { handler, .. } => handler.clone(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Resolved::Builtin(handler) => format!("builtin:{}", handler.info().name),
            Resolved::Delegate { id, .. } => format!("delegate:{}", id),
        }
    }
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Pick the preference entry that best matches `requested`.
///
/// Entries whose key does not support the request are ignored; the highest
/// specificity wins and ties go to the lexicographically smallest key, so the
/// result does not depend on map iteration order.
pub fn pick_preference<'a>(
    preferences: &'a HashMap<String, String>,
    requested: &FormatToken,
) -> Option<&'a str> {
    let mut best: Option<(u8, &'a str, &'a str)> = None;
    for (key, delegate) in preferences {
        let candidate = match FormatToken::parse(key) {
            Ok(token) => token,
            Err(e) => {
                warn!("Ignoring preference with invalid token '{}': {}", key, e);
                continue;
            }
        };
        if !supports(&candidate, requested) {
            continue;
        }
        let score = candidate.specificity(requested);
        let better = match best {
            None => true,
            Some((best_score, best_key, _)) => {
                score > best_score || (score == best_score && key.as_str() < best_key)
            }
        };
        if better {
            best = Some((score, key.as_str(), delegate.as_str()));
        }
    }
    best.map(|(_, _, delegate)| delegate)
}

/// Resolution inputs for one call
pub struct Resolver<'a> {
    pub preferences: &'a HashMap<String, String>,
    pub builtins: &'a HandlerRegistry,
    pub delegates: &'a [RegisteredDelegate],
}

impl<'a> Resolver<'a> {
    pub fn new(
        preferences: &'a HashMap<String, String>,
        builtins: &'a HandlerRegistry,
        delegates: &'a [RegisteredDelegate],
    ) -> Self {
        Self {
            preferences,
            builtins,
            delegates,
        }
    }

    pub async fn resolve(&self, token: &str) -> Result<Resolved> {
        let requested = FormatToken::parse(token)?;

        if let Some(id) = pick_preference(self.preferences, &requested) {
            debug!("Format '{}' resolved by preference to delegate '{}'", requested, id);
            let handler = self
                .delegates
                .iter()
                .find(|d| d.id == id)
                .map(|d| d.handler.clone())
                .or_else(|| self.builtins.get(id));
            return Ok(Resolved::Delegate {
                id: id.to_string(),
                handler,
            });
        }

        if let Some(handler) = self.builtins.lookup(&requested) {
            debug!("Format '{}' resolved to built-in handler '{}'", requested, handler.info().name);
            return Ok(Resolved::Builtin(handler));
        }

        let mut matches = Vec::new();
        for delegate in self.delegates {
            let formats = match delegate.handler.list_formats().await {
                Ok(formats) => formats,
                Err(e) => {
                    warn!("Delegate '{}' failed to list formats: {}", delegate.id, e);
                    continue;
                }
            };
            let claims = formats
                .iter()
                .filter_map(|f| FormatToken::parse(f).ok())
                .any(|declared| supports(&declared, &requested));
            if claims {
                matches.push(delegate);
            }
        }

        match matches.len() {
            0 => Err(BindError::NoHandler {
                token: requested.to_string(),
            }),
            1 => Ok(Resolved::Delegate {
                id: matches[0].id.clone(),
                handler: Some(matches[0].handler.clone()),
            }),
            _ => {
                let mut candidates: Vec<String> = matches.iter().map(|d| d.id.clone()).collect();
                candidates.sort();
                Err(BindError::AmbiguousHandler {
                    token: requested.to_string(),
                    candidates,
                })
            }
        }
    }
}
