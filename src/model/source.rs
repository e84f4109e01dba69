//! Source references and document loading

use crate::error::{BindError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// A registered reference to a native description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Format token, e.g. `openapi@3.1.0`
    pub format: String,
    /// Path, URL, command line or endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Inline document content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Executable to run (CLI usage sources only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

impl Source {
    pub fn from_location<F: Into<String>, L: Into<String>>(format: F, location: L) -> Self {
        Self {
            format: format.into(),
            location: Some(location.into()),
            ..Default::default()
        }
    }

    pub fn from_content<F: Into<String>, C: Into<String>>(format: F, content: C) -> Self {
        Self {
            format: format.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_binary<B: Into<String>>(mut self, binary: B) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Short human label for logs and interface names
    pub fn describe(&self) -> String {
        match (&self.location, &self.binary) {
            (Some(location), _) => location.clone(),
            (None, Some(binary)) => binary.clone(),
            (None, None) => "<inline>".to_string(),
        }
    }

    /// The location, when it is an `http(s)` URL
    pub fn url(&self) -> Option<&str> {
        self.location
            .as_deref()
            .filter(|l| l.starts_with("http://") || l.starts_with("https://"))
    }

    /// Read the document text: inline content, a local file, or an HTTP(S) URL.
    ///
    /// Exactly one of `location` and `content` must be set.
    pub async fn read_document(&self, timeout: Duration) -> Result<String> {
        match (&self.location, &self.content) {
            (Some(_), Some(_)) => Err(BindError::load(
                "source has both location and content; exactly one is expected",
            )),
            (None, None) => Err(BindError::load(
                "source has neither location nor content",
            )),
            (None, Some(content)) => Ok(content.clone()),
            (Some(location), None) => {
                if let Some(url) = self.url() {
                    debug!("Fetching document from {}", url);
                    let client = reqwest::Client::builder()
                        .timeout(timeout)
                        .build()
                        .map_err(|e| BindError::load(format!("failed to create HTTP client: {}", e)))?;
                    let response = client
                        .get(url)
                        .send()
                        .await
                        .map_err(|e| BindError::load(format!("failed to fetch {}: {}", url, e)))?;
                    if !response.status().is_success() {
                        return Err(BindError::load(format!(
                            "failed to fetch {}: HTTP {}",
                            url,
                            response.status().as_u16()
                        )));
                    }
                    response
                        .text()
                        .await
                        .map_err(|e| BindError::load(format!("failed to read {}: {}", url, e)))
                } else {
                    let path = location.strip_prefix("file://").unwrap_or(location);
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|e| BindError::load(format!("failed to read {}: {}", path, e)))
                }
            }
        }
    }
}

/// Parse JSON or YAML text into an untyped value
pub fn parse_document(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(text).map_err(|e| BindError::parse(format!("invalid JSON: {}", e)))
    } else {
        serde_yaml::from_str(text).map_err(|e| BindError::parse(format!("invalid YAML: {}", e)))
    }
}
