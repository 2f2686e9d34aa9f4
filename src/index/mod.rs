//! Search index abstraction.
//!
//! The [`SearchIndex`] trait is the seam between the projection layer and the
//! search engine. Production uses [`TypesenseIndex`]; tests and local runs can
//! use [`MemoryIndex`].
//!
//! The index is the only shared mutable resource in the reader. Handlers run
//! concurrently and rely on the engine's own per-document atomic writes; this
//! layer takes no locks of its own.

pub mod bootstrap;
pub mod memory;
pub mod typesense;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bootstrap::{ensure_schema, question_schema, BootstrapOutcome};
pub use memory::MemoryIndex;
pub use typesense::TypesenseIndex;

/// Errors reported by a search index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The collection or document does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// A collection or document with the same id already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The configured base URL cannot carry request paths
    #[error("invalid search engine URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine answered with an unexpected status
    #[error("search engine returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// The searchable projection of a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Seconds since the Unix epoch
    pub created_at: i64,
    #[serde(default)]
    pub has_accepted_answer: bool,
    #[serde(default)]
    pub answer_count: i32,
}

/// A partial update. Only fields that are `Some` are sent to the engine, so
/// fields owned by other events are never clobbered.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_accepted_answer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_count: Option<i32>,
}

impl DocumentPatch {
    pub fn is_empty(&self) -> bool {
        *self == DocumentPatch::default()
    }

    /// Apply the present fields to a document in place.
    pub fn apply_to(&self, doc: &mut SearchDocument) {
        if let Some(title) = &self.title {
            doc.title = title.clone();
        }
        if let Some(content) = &self.content {
            doc.content = content.clone();
        }
        if let Some(tags) = &self.tags {
            doc.tags = tags.clone();
        }
        if let Some(accepted) = self.has_accepted_answer {
            doc.has_accepted_answer = accepted;
        }
        if let Some(count) = self.answer_count {
            doc.answer_count = count;
        }
    }
}

/// Field types understood by the collection schema.
///
/// Retrieved schemas may carry types this crate never declares (`float`,
/// `auto`, `object`, ...); those read as [`FieldType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "bool")]
    Bool,
    #[serde(other, skip_serializing)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_index")]
    pub index: bool,
}

fn default_index() -> bool {
    true
}

impl Field {
    pub fn indexed(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            index: true,
        }
    }
}

/// A collection definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<Field>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_sorting_field: Option<String>,
}

/// A full-text query with an optional conjunctive tag filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// Text to match; `*` matches everything
    pub text: String,
    /// Comma-separated fields the text is matched against
    pub query_by: Vec<String>,
    /// Only documents carrying this tag are eligible
    pub tag: Option<String>,
    pub limit: usize,
}

/// Operations the projection and query layers need from a search engine.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Fetch a collection definition. Returns [`IndexError::NotFound`] if it
    /// does not exist.
    async fn retrieve_collection(&self, name: &str) -> Result<CollectionSchema, IndexError>;

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), IndexError>;

    /// Create a document. Returns [`IndexError::AlreadyExists`] when the id is
    /// taken.
    async fn create_document(
        &self,
        collection: &str,
        document: &SearchDocument,
    ) -> Result<(), IndexError>;

    /// Patch the given fields of an existing document. Returns
    /// [`IndexError::NotFound`] when there is no such document.
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: &DocumentPatch,
    ) -> Result<(), IndexError>;

    /// Delete a document. Returns [`IndexError::NotFound`] when there is no
    /// such document.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), IndexError>;

    /// Run a query, best match first.
    async fn search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchDocument>, IndexError>;

    /// Cheap reachability check for `/health`.
    async fn health(&self) -> Result<(), IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> SearchDocument {
        SearchDocument {
            id: "q1".into(),
            title: "Title".into(),
            content: "Body".into(),
            tags: vec!["rust".into()],
            created_at: 1_700_000_000,
            has_accepted_answer: false,
            answer_count: 2,
        }
    }

    #[test]
    fn test_document_serializes_camel_case() {
        let json = serde_json::to_value(document()).unwrap();
        assert_eq!(json["createdAt"], 1_700_000_000i64);
        assert_eq!(json["hasAcceptedAnswer"], false);
        assert_eq!(json["answerCount"], 2);
    }

    #[test]
    fn test_patch_skips_absent_fields() {
        let patch = DocumentPatch {
            answer_count: Some(5),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "answerCount": 5 }));
    }

    #[test]
    fn test_patch_apply_touches_only_present_fields() {
        let mut doc = document();
        DocumentPatch {
            has_accepted_answer: Some(true),
            ..Default::default()
        }
        .apply_to(&mut doc);

        assert!(doc.has_accepted_answer);
        assert_eq!(doc.title, "Title");
        assert_eq!(doc.answer_count, 2);
    }

    #[test]
    fn test_field_type_names() {
        let field = Field::indexed("tags", FieldType::StringArray);
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "string[]");
        assert_eq!(json["index"], true);
    }
}
