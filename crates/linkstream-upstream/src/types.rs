//! Value types shared between the upstream collaborators and the core

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a file stored in the messaging network
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef(String);

impl FileRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of an upstream file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Reference the metadata was fetched for
    pub file_ref: FileRef,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Mime type reported by the network, if any
    pub mime_type: Option<String>,
    /// Data center the file is stored in
    pub preferred_dc_id: u32,
    /// Original file name, if any
    pub file_name: Option<String>,
    /// Stable unique id; its prefix doubles as the link secret
    pub unique_id: String,
}

impl FileMeta {
    /// Mime type, falling back to a guess from the file name
    pub fn effective_mime_type(&self) -> String {
        if let Some(mime) = self.mime_type.as_deref().filter(|m| !m.is_empty()) {
            return mime.to_string();
        }
        self.file_name
            .as_deref()
            .and_then(|name| mime_guess::from_path(name).first())
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    /// First `len` characters of the unique id
    pub fn secret_prefix(&self, len: usize) -> &str {
        let end = self
            .unique_id
            .char_indices()
            .nth(len)
            .map(|(idx, _)| idx)
            .unwrap_or(self.unique_id.len());
        &self.unique_id[..end]
    }
}

/// Credential for one upstream connection; never printed in full
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short non-secret label for logs
    pub fn label(&self) -> String {
        let prefix: String = self.0.chars().take_while(|c| *c != ':').take(12).collect();
        format!("{}…", prefix)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.label())
    }
}
