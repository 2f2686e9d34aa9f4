//! Projections from domain events into search documents.
//!
//! Each event kind has one [`Projection`]. A projection holds nothing but a
//! handle to the search index, so all of its effects land in the index, and
//! it must be idempotent: applying the same event twice leaves the document
//! exactly as applying it once.
//!
//! | Event                | Effect on the document                         |
//! |----------------------|------------------------------------------------|
//! | `QuestionCreated`    | create (duplicate id counts as done)           |
//! | `QuestionUpdated`    | patch `title`, `content`, `tags`               |
//! | `QuestionDeleted`    | delete (missing document counts as done)       |
//! | `AnswerCountChanged` | patch `answerCount`                            |
//! | `AnswerAccepted`     | patch `hasAcceptedAnswer = true`               |

pub mod answer;
pub mod question;

use crate::event::{DomainEvent, EventKind};
use crate::index::{IndexError, SearchIndex};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

pub use answer::{AnswerAcceptedProjection, AnswerCountProjection};
pub use question::{QuestionCreatedProjection, QuestionDeletedProjection, QuestionUpdatedProjection};

/// Anything between angle brackets, across line breaks.
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<.*?>").expect("static regex"));

/// Errors that can occur while projecting an event.
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// The search index rejected or failed the write
    #[error("search index error: {0}")]
    Index(#[from] IndexError),

    /// The projection was handed an event of a different kind
    #[error("projection '{projection}' cannot handle {kind} events")]
    UnexpectedEvent {
        projection: &'static str,
        kind: EventKind,
    },
}

/// Result of a successful projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionOutcome {
    pub projection: &'static str,
    pub document_id: String,
    pub change: DocumentChange,
}

/// What happened to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChange {
    Created,
    Patched,
    Deleted,
    /// The index already reflected the event (duplicate create, delete of a
    /// missing document)
    AlreadyApplied,
}

impl ProjectionOutcome {
    pub fn new(projection: &'static str, document_id: &str, change: DocumentChange) -> Self {
        Self {
            projection,
            document_id: document_id.to_string(),
            change,
        }
    }
}

/// Folds one kind of domain event into the search index.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    async fn apply(&self, event: &DomainEvent) -> Result<ProjectionOutcome, ProjectionError>;
}

/// Remove markup tags, keeping the text between them.
pub fn strip_html(content: &str) -> String {
    HTML_TAG.replace_all(content, "").into_owned()
}

/// The projection registered for `kind`. The match is exhaustive so a new
/// event variant cannot ship without a projection.
pub fn projection_for(
    kind: EventKind,
    index: Arc<dyn SearchIndex>,
    collection: &str,
) -> Arc<dyn Projection> {
    match kind {
        EventKind::QuestionCreated => Arc::new(QuestionCreatedProjection::new(index, collection)),
        EventKind::QuestionUpdated => Arc::new(QuestionUpdatedProjection::new(index, collection)),
        EventKind::QuestionDeleted => Arc::new(QuestionDeletedProjection::new(index, collection)),
        EventKind::AnswerCountChanged => Arc::new(AnswerCountProjection::new(index, collection)),
        EventKind::AnswerAccepted => Arc::new(AnswerAcceptedProjection::new(index, collection)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(strip_html("no markup"), "no markup");
        assert_eq!(strip_html("<a\nhref=\"x\">link</a>"), "link");
        assert_eq!(strip_html("a < b"), "a < b");
    }

    #[test]
    fn test_stripped_content_has_no_markup() {
        let inputs = [
            "<div><p>One</p><p>Two</p></div>",
            "<pre><code class=\"rust\">fn main() {}</code></pre>",
            "<img src=\"x.png\"/>text<br>",
            "<ul>\n<li>a</li>\n<li>b</li>\n</ul>",
        ];
        for input in inputs {
            let stripped = strip_html(input);
            assert!(!HTML_TAG.is_match(&stripped), "residual markup in {stripped:?}");
        }
    }

    #[test]
    fn test_every_kind_has_a_projection() {
        let index: Arc<dyn SearchIndex> = Arc::new(MemoryIndex::new());
        let names: Vec<_> = EventKind::ALL
            .into_iter()
            .map(|kind| projection_for(kind, index.clone(), "questions").name())
            .collect();

        assert_eq!(
            names,
            vec![
                "question-created",
                "question-updated",
                "question-deleted",
                "answer-count",
                "answer-accepted",
            ]
        );
    }
}
