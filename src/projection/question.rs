//! Question lifecycle projections: created, updated, deleted.

use super::{strip_html, DocumentChange, Projection, ProjectionError, ProjectionOutcome};
use crate::event::DomainEvent;
use crate::index::{DocumentPatch, IndexError, SearchDocument, SearchIndex};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates the search document for a new question.
pub struct QuestionCreatedProjection {
    index: Arc<dyn SearchIndex>,
    collection: String,
}

impl QuestionCreatedProjection {
    pub fn new(index: Arc<dyn SearchIndex>, collection: &str) -> Self {
        Self {
            index,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl Projection for QuestionCreatedProjection {
    fn name(&self) -> &'static str {
        "question-created"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<ProjectionOutcome, ProjectionError> {
        let DomainEvent::QuestionCreated(created) = event else {
            return Err(ProjectionError::UnexpectedEvent {
                projection: self.name(),
                kind: event.kind(),
            });
        };

        let document = SearchDocument {
            id: created.question_id.clone(),
            title: created.title.clone(),
            content: strip_html(&created.content),
            tags: created.tags.clone(),
            created_at: created.created_at.timestamp(),
            has_accepted_answer: false,
            answer_count: 0,
        };

        match self.index.create_document(&self.collection, &document).await {
            Ok(()) => {
                info!(id = %document.id, "Document created");
                Ok(ProjectionOutcome::new(self.name(), &document.id, DocumentChange::Created))
            }
            // Redelivery of an event we already projected
            Err(IndexError::AlreadyExists(_)) => {
                debug!(id = %document.id, "Document already exists, skipping create");
                Ok(ProjectionOutcome::new(
                    self.name(),
                    &document.id,
                    DocumentChange::AlreadyApplied,
                ))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Patches title, content and tags. Counters and timestamps belong to other
/// events and are left alone.
pub struct QuestionUpdatedProjection {
    index: Arc<dyn SearchIndex>,
    collection: String,
}

impl QuestionUpdatedProjection {
    pub fn new(index: Arc<dyn SearchIndex>, collection: &str) -> Self {
        Self {
            index,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl Projection for QuestionUpdatedProjection {
    fn name(&self) -> &'static str {
        "question-updated"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<ProjectionOutcome, ProjectionError> {
        let DomainEvent::QuestionUpdated(updated) = event else {
            return Err(ProjectionError::UnexpectedEvent {
                projection: self.name(),
                kind: event.kind(),
            });
        };

        let patch = DocumentPatch {
            title: Some(updated.title.clone()),
            content: Some(strip_html(&updated.content)),
            tags: Some(updated.tags.clone()),
            ..Default::default()
        };

        self.index
            .update_document(&self.collection, &updated.question_id, &patch)
            .await?;

        info!(id = %updated.question_id, "Document updated");
        Ok(ProjectionOutcome::new(
            self.name(),
            &updated.question_id,
            DocumentChange::Patched,
        ))
    }
}

/// Removes the search document. Deleting a missing document is a no-op.
pub struct QuestionDeletedProjection {
    index: Arc<dyn SearchIndex>,
    collection: String,
}

impl QuestionDeletedProjection {
    pub fn new(index: Arc<dyn SearchIndex>, collection: &str) -> Self {
        Self {
            index,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl Projection for QuestionDeletedProjection {
    fn name(&self) -> &'static str {
        "question-deleted"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<ProjectionOutcome, ProjectionError> {
        let DomainEvent::QuestionDeleted(deleted) = event else {
            return Err(ProjectionError::UnexpectedEvent {
                projection: self.name(),
                kind: event.kind(),
            });
        };

        let id = &deleted.question_id;
        match self.index.delete_document(&self.collection, id).await {
            Ok(()) => {
                info!(id = %id, "Document deleted");
                Ok(ProjectionOutcome::new(self.name(), id, DocumentChange::Deleted))
            }
            Err(IndexError::NotFound(_)) => {
                debug!(id = %id, "Document already gone");
                Ok(ProjectionOutcome::new(self.name(), id, DocumentChange::AlreadyApplied))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{QuestionCreated, QuestionDeleted, QuestionUpdated};
    use crate::index::MemoryIndex;
    use chrono::{TimeZone, Utc};

    const COLLECTION: &str = "questions";

    fn created(id: &str) -> DomainEvent {
        DomainEvent::QuestionCreated(QuestionCreated {
            question_id: id.into(),
            title: "How do lifetimes work?".into(),
            content: "<p>I keep getting <code>E0597</code></p>".into(),
            created_at: Utc.with_ymd_and_hms(2025, 12, 24, 14, 11, 34).unwrap(),
            tags: vec!["rust".into(), "lifetimes".into()],
        })
    }

    fn setup() -> (Arc<MemoryIndex>, Arc<dyn SearchIndex>) {
        let memory = Arc::new(MemoryIndex::new());
        let index: Arc<dyn SearchIndex> = memory.clone();
        (memory, index)
    }

    #[tokio::test]
    async fn test_create_builds_document() {
        let (memory, index) = setup();
        let projection = QuestionCreatedProjection::new(index, COLLECTION);

        let outcome = projection.apply(&created("q1")).await.unwrap();
        assert_eq!(outcome.change, DocumentChange::Created);

        let doc = memory.document(COLLECTION, "q1").await.unwrap();
        assert_eq!(doc.content, "I keep getting E0597");
        assert_eq!(doc.tags, vec!["rust", "lifetimes"]);
        assert_eq!(doc.created_at, 1_766_585_494);
        assert!(!doc.has_accepted_answer);
        assert_eq!(doc.answer_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_idempotent() {
        let (memory, index) = setup();
        let projection = QuestionCreatedProjection::new(index, COLLECTION);

        projection.apply(&created("q1")).await.unwrap();
        let once = memory.document(COLLECTION, "q1").await.unwrap();

        let outcome = projection.apply(&created("q1")).await.unwrap();
        let twice = memory.document(COLLECTION, "q1").await.unwrap();

        assert_eq!(outcome.change, DocumentChange::AlreadyApplied);
        assert_eq!(once, twice);
        assert_eq!(memory.document_count(COLLECTION).await, 1);
    }

    #[tokio::test]
    async fn test_update_patches_owned_fields_only() {
        let (memory, index) = setup();
        QuestionCreatedProjection::new(index.clone(), COLLECTION)
            .apply(&created("q1"))
            .await
            .unwrap();
        index
            .update_document(
                COLLECTION,
                "q1",
                &DocumentPatch {
                    answer_count: Some(4),
                    has_accepted_answer: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let before = memory.document(COLLECTION, "q1").await.unwrap();

        let update = DomainEvent::QuestionUpdated(QuestionUpdated {
            question_id: "q1".into(),
            title: "Edited".into(),
            content: "<em>new</em> body".into(),
            tags: vec!["borrowck".into()],
        });
        QuestionUpdatedProjection::new(index, COLLECTION)
            .apply(&update)
            .await
            .unwrap();

        let after = memory.document(COLLECTION, "q1").await.unwrap();
        assert_eq!(after.title, "Edited");
        assert_eq!(after.content, "new body");
        assert_eq!(after.tags, vec!["borrowck"]);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.answer_count, 4);
        assert!(after.has_accepted_answer);
    }

    #[tokio::test]
    async fn test_update_of_missing_document_fails() {
        let (_, index) = setup();
        let update = DomainEvent::QuestionUpdated(QuestionUpdated {
            question_id: "ghost".into(),
            title: "t".into(),
            content: "c".into(),
            tags: vec![],
        });

        let err = QuestionUpdatedProjection::new(index, COLLECTION)
            .apply(&update)
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Index(IndexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_missing_document_is_noop() {
        let (_, index) = setup();
        let delete = DomainEvent::QuestionDeleted(QuestionDeleted {
            question_id: "q1".into(),
        });

        let outcome = QuestionDeletedProjection::new(index, COLLECTION)
            .apply(&delete)
            .await
            .unwrap();
        assert_eq!(outcome.change, DocumentChange::AlreadyApplied);
    }

    #[tokio::test]
    async fn test_delete_removes_document() {
        let (memory, index) = setup();
        QuestionCreatedProjection::new(index.clone(), COLLECTION)
            .apply(&created("q1"))
            .await
            .unwrap();

        let delete = DomainEvent::QuestionDeleted(QuestionDeleted {
            question_id: "q1".into(),
        });
        let outcome = QuestionDeletedProjection::new(index, COLLECTION)
            .apply(&delete)
            .await
            .unwrap();

        assert_eq!(outcome.change, DocumentChange::Deleted);
        assert!(memory.document(COLLECTION, "q1").await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_event_kind_is_rejected() {
        let (_, index) = setup();
        let err = QuestionDeletedProjection::new(index, COLLECTION)
            .apply(&created("q1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::UnexpectedEvent { .. }));
    }
}
