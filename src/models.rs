//! Records shared between the upstream fetcher, the metadata store and the server.

use crate::error::{OffgridError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One downloadable artifact of a project: display label and upstream href.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub label: String,
    pub href: String,
}

impl Link {
    pub fn new(label: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            href: href.into(),
        }
    }
}

/// Collapse links sharing a label: the later href wins, the first position is kept.
pub fn dedup_by_label(links: Vec<Link>) -> Vec<Link> {
    let mut out: Vec<Link> = Vec::with_capacity(links.len());
    for link in links {
        match out.iter_mut().find(|l| l.label == link.label) {
            Some(existing) => existing.href = link.href,
            None => out.push(link),
        }
    }
    out
}

/// Project names as they may appear in index URLs: ASCII letters, digits, `.`, `_` and `-`.
pub fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 256
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && name != "."
        && name != ".."
}

/// `info` section of upstream project JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub summary: Option<String>,
    /// Everything else upstream sends (author, classifiers, project_urls...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One file entry from `releases` or `urls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseFile {
    pub filename: String,
    pub url: String,
    pub size: Option<u64>,
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
    pub requires_python: Option<String>,
    #[serde(default)]
    pub yanked: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Upstream JSON metadata for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    #[serde(default)]
    pub info: ProjectInfo,
    #[serde(default)]
    pub releases: BTreeMap<String, Vec<ReleaseFile>>,
    #[serde(default)]
    pub urls: Vec<ReleaseFile>,
    /// Monotonic upstream revision marker
    pub last_serial: Option<i64>,
}

impl ProjectMetadata {
    /// Build from a raw JSON document, rejecting shapes the store cannot hold.
    pub fn from_json(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(OffgridError::InvalidMetadata(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        }

        let metadata: ProjectMetadata = serde_json::from_value(value)
            .map_err(|e| OffgridError::InvalidMetadata(e.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(serial) = self.last_serial
            && serial < 0
        {
            return Err(OffgridError::InvalidMetadata(format!(
                "last_serial must not be negative, got {serial}"
            )));
        }

        let files = self.releases.values().flatten().chain(self.urls.iter());
        for file in files {
            if file.filename.is_empty() {
                return Err(OffgridError::InvalidMetadata(format!(
                    "release file without a filename: {}",
                    file.url
                )));
            }
        }

        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
