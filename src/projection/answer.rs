//! Answer projections. Both are targeted single-field patches.

use super::{DocumentChange, Projection, ProjectionError, ProjectionOutcome};
use crate::event::DomainEvent;
use crate::index::{DocumentPatch, SearchIndex};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Mirrors the question's answer total into `answerCount`.
pub struct AnswerCountProjection {
    index: Arc<dyn SearchIndex>,
    collection: String,
}

impl AnswerCountProjection {
    pub fn new(index: Arc<dyn SearchIndex>, collection: &str) -> Self {
        Self {
            index,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl Projection for AnswerCountProjection {
    fn name(&self) -> &'static str {
        "answer-count"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<ProjectionOutcome, ProjectionError> {
        let DomainEvent::AnswerCountChanged(changed) = event else {
            return Err(ProjectionError::UnexpectedEvent {
                projection: self.name(),
                kind: event.kind(),
            });
        };

        let patch = DocumentPatch {
            answer_count: Some(changed.answer_count),
            ..Default::default()
        };
        self.index
            .update_document(&self.collection, &changed.question_id, &patch)
            .await?;

        info!(
            id = %changed.question_id,
            answer_count = changed.answer_count,
            "Document answer count updated"
        );
        Ok(ProjectionOutcome::new(
            self.name(),
            &changed.question_id,
            DocumentChange::Patched,
        ))
    }
}

/// Flags the question as having an accepted answer.
pub struct AnswerAcceptedProjection {
    index: Arc<dyn SearchIndex>,
    collection: String,
}

impl AnswerAcceptedProjection {
    pub fn new(index: Arc<dyn SearchIndex>, collection: &str) -> Self {
        Self {
            index,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl Projection for AnswerAcceptedProjection {
    fn name(&self) -> &'static str {
        "answer-accepted"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<ProjectionOutcome, ProjectionError> {
        let DomainEvent::AnswerAccepted(accepted) = event else {
            return Err(ProjectionError::UnexpectedEvent {
                projection: self.name(),
                kind: event.kind(),
            });
        };

        let patch = DocumentPatch {
            has_accepted_answer: Some(true),
            ..Default::default()
        };
        self.index
            .update_document(&self.collection, &accepted.question_id, &patch)
            .await?;

        info!(
            id = %accepted.question_id,
            answer_id = %accepted.answer_id,
            "Document marked as answered"
        );
        Ok(ProjectionOutcome::new(
            self.name(),
            &accepted.question_id,
            DocumentChange::Patched,
        ))
    }
}
