//! Typesense-backed search index.
//!
//! Talks to the Typesense REST API with a shared [`reqwest::Client`]:
//!
//! ```text
//! GET    /collections/{name}                       retrieve schema
//! POST   /collections                              create schema
//! POST   /collections/{c}/documents?action=create  create document
//! PATCH  /collections/{c}/documents/{id}           partial update
//! DELETE /collections/{c}/documents/{id}           delete
//! GET    /collections/{c}/documents/search         query
//! GET    /health                                   liveness
//! ```
//!
//! Collection names and document ids are pushed as percent-encoded path
//! segments, so an id containing `/`, `?` or `#` stays a single segment.
//!
//! 404 maps to [`IndexError::NotFound`] and 409 to
//! [`IndexError::AlreadyExists`]; callers decide whether those are errors.

use super::{
    CollectionSchema, DocumentPatch, IndexError, SearchDocument, SearchIndex, SearchQuery,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "X-TYPESENSE-API-KEY";

/// Default timeout for index requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    document: SearchDocument,
}

/// A [`SearchIndex`] backed by a Typesense node.
#[derive(Debug, Clone)]
pub struct TypesenseIndex {
    /// Base URL without trailing slash
    base_url: String,

    api_key: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    timeout: Duration,
}

impl TypesenseIndex {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL extended with `segments`, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, IndexError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| IndexError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| IndexError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.timeout)
    }

    /// Turn a non-success response into an [`IndexError`].
    async fn check(response: Response, what: String) -> Result<Response, IndexError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::NOT_FOUND => Err(IndexError::NotFound(what)),
            StatusCode::CONFLICT => Err(IndexError::AlreadyExists(what)),
            _ => {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, body = %body, "Search engine request failed");
                Err(IndexError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    /// Typesense filter for "tags contains `tag`". Backticks keep commas and
    /// brackets inside the tag from breaking the filter syntax.
    pub fn tag_filter(tag: &str) -> String {
        format!("tags:=[`{}`]", tag.replace('`', ""))
    }
}

#[async_trait]
impl SearchIndex for TypesenseIndex {
    async fn retrieve_collection(&self, name: &str) -> Result<CollectionSchema, IndexError> {
        let response = self
            .authorized(self.client.get(self.url(&["collections", name])?))
            .send()
            .await?;
        let response = Self::check(response, format!("collection '{}'", name)).await?;
        Ok(response.json().await?)
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), IndexError> {
        debug!(collection = %schema.name, "Creating collection");
        let response = self
            .authorized(self.client.post(self.url(&["collections"])?))
            .json(schema)
            .send()
            .await?;
        Self::check(response, format!("collection '{}'", schema.name)).await?;
        Ok(())
    }

    async fn create_document(
        &self,
        collection: &str,
        document: &SearchDocument,
    ) -> Result<(), IndexError> {
        let url = self.url(&["collections", collection, "documents"])?;
        let response = self
            .authorized(self.client.post(url))
            .query(&[("action", "create")])
            .json(document)
            .send()
            .await?;
        Self::check(response, format!("document '{}'", document.id)).await?;
        Ok(())
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: &DocumentPatch,
    ) -> Result<(), IndexError> {
        let url = self.url(&["collections", collection, "documents", id])?;
        let response = self
            .authorized(self.client.patch(url))
            .json(patch)
            .send()
            .await?;
        Self::check(response, format!("document '{}'", id)).await?;
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), IndexError> {
        let url = self.url(&["collections", collection, "documents", id])?;
        let response = self.authorized(self.client.delete(url)).send().await?;
        Self::check(response, format!("document '{}'", id)).await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchDocument>, IndexError> {
        let url = self.url(&["collections", collection, "documents", "search"])?;

        let mut params = vec![
            ("q", query.text.clone()),
            ("query_by", query.query_by.join(",")),
            ("per_page", query.limit.to_string()),
        ];
        if let Some(tag) = &query.tag {
            params.push(("filter_by", Self::tag_filter(tag)));
        }

        debug!(collection = %collection, params = ?params, "Searching");

        let response = self
            .authorized(self.client.get(url))
            .query(&params)
            .send()
            .await?;
        let response = Self::check(response, format!("collection '{}'", collection)).await?;
        let body: SearchResponse = response.json().await?;

        Ok(body.hits.into_iter().map(|hit| hit.document).collect())
    }

    async fn health(&self) -> Result<(), IndexError> {
        let response = self
            .authorized(self.client.get(self.url(&["health"])?))
            .send()
            .await?;
        Self::check(response, "health endpoint".to_string()).await?;
        Ok(())
    }
}
