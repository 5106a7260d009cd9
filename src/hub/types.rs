use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Catalog entry describing one model and the files that make it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCard {
    /// Assigned by the registry when empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    /// Assigned by the registry when absent.
    #[serde(default, alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub files: Vec<ModelFile>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "readme_markdown")]
    pub readme_markdown: Option<String>,
    /// Keys this version does not know about, written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    pub filename: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "size_bytes")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelCard {
    pub fn new(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            format: format.into(),
            task: None,
            arch: None,
            quantization: None,
            license: None,
            tags: Vec::new(),
            targets: Vec::new(),
            created_at: None,
            downloads: 0,
            files: Vec::new(),
            readme_markdown: None,
            extra: Map::new(),
        }
    }

    pub fn with_file(mut self, filename: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.push(ModelFile {
            filename: filename.into(),
            path: path.into(),
            size_bytes: None,
            sha256: None,
            format: None,
            extra: Map::new(),
        });
        self
    }

    /// Checks the fields a client must supply when registering a card.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("model card name must not be empty".into());
        }
        for (idx, file) in self.files.iter().enumerate() {
            if file.filename.trim().is_empty() {
                return Err(format!("file {idx} is missing a filename"));
            }
            if file.path.as_os_str().is_empty() {
                return Err(format!("file {idx} is missing a path"));
            }
        }
        Ok(())
    }

    /// Picks the named file, or the first file when no name is given.
    pub fn resolve_file(&self, filename: Option<&str>) -> Option<&ModelFile> {
        match filename {
            Some(name) if !name.is_empty() => self.files.iter().find(|f| f.filename == name),
            _ => self.files.first(),
        }
    }

    pub(crate) fn fill_defaults(&mut self, now: DateTime<Utc>) {
        if self.id.trim().is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        self.fill_created_at(now);
    }

    /// Returns true when the timestamp was missing and has been set to `at`.
    pub(crate) fn fill_created_at(&mut self, at: DateTime<Utc>) -> bool {
        // The Unix epoch and anything before it counts as an unset timestamp.
        if self.created_at.is_none_or(|ts| ts.timestamp() <= 0) {
            self.created_at = Some(at);
            return true;
        }
        false
    }
}
