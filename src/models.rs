//! Core data models shared by the stores, the orchestrator and the relay.
//!
//! Identifiers are string newtypes: a [`DocumentId`] is whatever the remote
//! index assigned and is used verbatim as the join key across the mapping
//! table, the remote index and the object store.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::extract::file_extension;

/// Remote-assigned document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Knowledge space identifier (`YYYYMMDDHHMMSS`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(String);

impl SpaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeSpace {
    pub space_id: SpaceId,
    pub name: String,
    pub description: String,
    pub created_at: i64,
}

/// One row of `file_map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMapping {
    pub document_id: DocumentId,
    pub space_id: SpaceId,
    /// Display name; also the stem of the object key.
    pub file_name: String,
    /// Extension with its leading dot, e.g. `".pdf"`; empty when the upload had none.
    pub extension: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DocumentMapping {
    pub fn object_key(&self) -> String {
        object_key(&self.file_name, &self.extension)
    }
}

/// Object keys are the display name followed by the original extension.
pub fn object_key(file_name: &str, extension: &str) -> String {
    format!("{}{}", file_name, extension)
}

/// A file received from a client.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Client-supplied file name; only its extension is used.
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl Upload {
    pub fn extension(&self) -> String {
        file_extension(&self.file_name).unwrap_or("").to_string()
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Result of a local document search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    #[serde(rename = "docId")]
    pub doc_id: DocumentId,
    pub title: String,
}

/// A source document cited by an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    #[serde(rename = "docId")]
    pub document_id: DocumentId,
    pub title: String,
    #[serde(rename = "fileUrl")]
    pub file_url: String,
}

/// Client-facing answer stream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Finish(Vec<Reference>),
}

impl StreamEvent {
    pub fn is_finish(&self) -> bool {
        matches!(self, StreamEvent::Finish(_))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireEvent<'a> {
    Delta {
        delta: &'a str,
    },
    Finish {
        finish: bool,
        references: &'a [Reference],
    },
}

impl Serialize for StreamEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StreamEvent::Delta(text) => WireEvent::Delta { delta: text }.serialize(serializer),
            StreamEvent::Finish(references) => WireEvent::Finish {
                finish: true,
                references,
            }
            .serialize(serializer),
        }
    }
}
