//! In-process search index.
//!
//! Mirrors the engine contract closely enough for local runs and tests:
//! duplicate creates and missing documents produce the same errors the
//! HTTP engine returns, and search scores documents by how many query terms
//! appear in the requested fields.

use super::{
    CollectionSchema, DocumentPatch, IndexError, SearchDocument, SearchIndex, SearchQuery,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Collection {
    schema: Option<CollectionSchema>,
    documents: HashMap<String, SearchDocument>,
}

/// A [`SearchIndex`] held entirely in memory.
#[derive(Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a single document.
    pub async fn document(&self, collection: &str, id: &str) -> Option<SearchDocument> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|c| c.documents.get(id))
            .cloned()
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|c| c.documents.len())
            .unwrap_or(0)
    }
}

fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

fn field_text<'a>(doc: &'a SearchDocument, field: &str) -> &'a str {
    match field {
        "title" => &doc.title,
        "content" => &doc.content,
        _ => "",
    }
}

fn score(doc: &SearchDocument, query_terms: &[String], query_by: &[String]) -> usize {
    let haystack: Vec<String> = query_by
        .iter()
        .flat_map(|field| terms(field_text(doc, field)))
        .collect();

    query_terms
        .iter()
        .filter(|term| haystack.iter().any(|word| word.starts_with(term.as_str())))
        .count()
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn retrieve_collection(&self, name: &str) -> Result<CollectionSchema, IndexError> {
        let collections = self.collections.read().await;
        collections
            .get(name)
            .and_then(|c| c.schema.clone())
            .ok_or_else(|| IndexError::NotFound(format!("collection '{}'", name)))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(schema.name.clone()).or_default();
        if collection.schema.is_some() {
            return Err(IndexError::AlreadyExists(format!(
                "collection '{}'",
                schema.name
            )));
        }
        collection.schema = Some(schema.clone());
        Ok(())
    }

    async fn create_document(
        &self,
        collection: &str,
        document: &SearchDocument,
    ) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        let documents = &mut collections.entry(collection.to_string()).or_default().documents;
        if documents.contains_key(&document.id) {
            return Err(IndexError::AlreadyExists(format!("document '{}'", document.id)));
        }
        documents.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: &DocumentPatch,
    ) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|c| c.documents.get_mut(id))
            .ok_or_else(|| IndexError::NotFound(format!("document '{}'", id)))?;
        patch.apply_to(doc);
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        collections
            .get_mut(collection)
            .and_then(|c| c.documents.remove(id))
            .map(|_| ())
            .ok_or_else(|| IndexError::NotFound(format!("document '{}'", id)))
    }

    async fn search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchDocument>, IndexError> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(collection) else {
            return Err(IndexError::NotFound(format!("collection '{}'", collection)));
        };

        let match_all = query.text.trim() == "*";
        let query_terms = terms(&query.text);

        let mut hits: Vec<(usize, &SearchDocument)> = collection
            .documents
            .values()
            .filter(|doc| match &query.tag {
                Some(tag) => doc.tags.iter().any(|t| t == tag),
                None => true,
            })
            .filter_map(|doc| {
                if match_all {
                    return Some((0, doc));
                }
                let s = score(doc, &query_terms, &query.query_by);
                (s > 0).then_some((s, doc))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        Ok(hits
            .into_iter()
            .take(query.limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn health(&self) -> Result<(), IndexError> {
        Ok(())
    }
}
