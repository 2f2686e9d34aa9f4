//! Event dispatcher - routes incoming messages to projections.
//!
//! The [`Dispatcher`] decodes a message envelope into a [`DomainEvent`],
//! looks up the [`Projection`] registered for its [`EventKind`] and decides
//! what the consumer should tell the broker.
//!
//! ```text
//! message (type: "AnswerCountChanged", x-retry-count: 1)
//!     │
//!     ▼
//! ┌─────────────────────────────────────────┐
//! │            DISPATCHER                   │
//! │                                         │
//! │  1. Decode envelope        fail -> DeadLetter
//! │  2. handlers[kind]         none -> DeadLetter
//! │  3. projection.apply()     ok   -> Ack
//! │                            err  -> Retry / DeadLetter
//! └─────────────────────────────────────────┘
//! ```
//!
//! Failures are retried until the message has been redelivered
//! `max_retries` times; after that it is dead-lettered so a poison message
//! cannot loop forever.

use crate::event::{DomainEvent, EventKind};
use crate::index::SearchIndex;
use crate::projection::{projection_for, Projection, ProjectionError, ProjectionOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default number of redeliveries before a failing message is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors that can occur during dispatch.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no projection registered for {0} events")]
    NoHandler(EventKind),

    #[error("projection '{projection}' failed: {source}")]
    ProjectionFailed {
        projection: &'static str,
        #[source]
        source: ProjectionError,
    },
}

/// A message as received from the queue.
#[derive(Debug, Clone, Copy)]
pub struct IncomingMessage<'a> {
    /// Raw JSON envelope
    pub body: &'a [u8],

    /// Event name from the transport metadata, if the publisher set one
    pub type_hint: Option<&'a str>,

    /// How many times this message has already been retried
    pub retry_count: u32,
}

/// What the consumer should do with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue
    Ack,

    /// Failed; redeliver as attempt `retry_count`
    Retry { retry_count: u32, error: String },

    /// Give up; route to the dead-letter queue
    DeadLetter { reason: String },
}

/// Routes domain events to their projections.
///
/// Wrap in `Arc` to share across the consumer's per-message tasks. The
/// dispatcher does not serialize work per document id; concurrent writes to
/// the same document are left to the index.
pub struct Dispatcher {
    handlers: HashMap<EventKind, Arc<dyn Projection>>,
    max_retries: u32,
}

impl Dispatcher {
    /// Create a dispatcher with no projections registered.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// A dispatcher with the standard projection for every event kind.
    pub fn with_projections(index: Arc<dyn SearchIndex>, collection: &str) -> Self {
        let mut dispatcher = Self::new();
        for kind in EventKind::ALL {
            dispatcher.on(kind, projection_for(kind, index.clone(), collection));
        }
        dispatcher
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Register the projection for an event kind, replacing any previous one.
    pub fn on(&mut self, kind: EventKind, projection: Arc<dyn Projection>) {
        debug!(
            kind = %kind,
            projection = %projection.name(),
            "Registering projection"
        );
        self.handlers.insert(kind, projection);
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Apply a decoded event through its projection.
    pub async fn dispatch(&self, event: &DomainEvent) -> Result<ProjectionOutcome, DispatchError> {
        let kind = event.kind();
        let projection = self
            .handlers
            .get(&kind)
            .ok_or(DispatchError::NoHandler(kind))?;

        debug!(
            kind = %kind,
            id = %event.question_id(),
            projection = %projection.name(),
            "Dispatching event"
        );

        projection
            .apply(event)
            .await
            .map_err(|source| DispatchError::ProjectionFailed {
                projection: projection.name(),
                source,
            })
    }

    /// Decode, dispatch and decide the message's fate.
    pub async fn handle(&self, message: IncomingMessage<'_>) -> Disposition {
        let event = match DomainEvent::from_envelope(message.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable message, dead-lettering");
                return Disposition::DeadLetter {
                    reason: e.to_string(),
                };
            }
        };

        if let Some(hint) = message.type_hint {
            if hint != event.kind().as_str() {
                warn!(
                    type_hint = %hint,
                    kind = %event.kind(),
                    "Message type property does not match envelope, dead-lettering"
                );
                return Disposition::DeadLetter {
                    reason: format!(
                        "type property '{}' does not match envelope type '{}'",
                        hint,
                        event.kind()
                    ),
                };
            }
        }

        match self.dispatch(&event).await {
            Ok(outcome) => {
                info!(
                    kind = %event.kind(),
                    id = %outcome.document_id,
                    change = ?outcome.change,
                    "Event projected"
                );
                Disposition::Ack
            }
            Err(e @ DispatchError::NoHandler(_)) => {
                warn!(error = %e, "Dead-lettering event without projection");
                Disposition::DeadLetter {
                    reason: e.to_string(),
                }
            }
            Err(e) if message.retry_count >= self.max_retries => {
                warn!(
                    kind = %event.kind(),
                    id = %event.question_id(),
                    error = %e,
                    retry_count = message.retry_count,
                    max_retries = self.max_retries,
                    "Max retries exceeded, dead-lettering"
                );
                Disposition::DeadLetter {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                warn!(
                    kind = %event.kind(),
                    id = %event.question_id(),
                    error = %e,
                    retry_count = message.retry_count,
                    "Projection failed, scheduling retry"
                );
                Disposition::Retry {
                    retry_count: message.retry_count + 1,
                    error: e.to_string(),
                }
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AnswerCountChanged, QuestionDeleted};
    use crate::index::MemoryIndex;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProjection {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Projection for CountingProjection {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn apply(&self, event: &DomainEvent) -> Result<ProjectionOutcome, ProjectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProjectionOutcome::new(
                self.name(),
                event.question_id(),
                crate::projection::DocumentChange::Patched,
            ))
        }
    }

    fn envelope(event: &DomainEvent) -> Vec<u8> {
        event.to_envelope().unwrap()
    }

    fn message(body: &[u8], retry_count: u32) -> IncomingMessage<'_> {
        IncomingMessage {
            body,
            type_hint: None,
            retry_count,
        }
    }

    fn answer_count(id: &str) -> DomainEvent {
        DomainEvent::AnswerCountChanged(AnswerCountChanged {
            question_id: id.into(),
            answer_count: 2,
        })
    }

    #[test]
    fn test_standard_table_covers_every_kind() {
        let dispatcher = Dispatcher::with_projections(Arc::new(MemoryIndex::new()), "questions");
        assert_eq!(dispatcher.handler_count(), EventKind::ALL.len());
        for kind in EventKind::ALL {
            assert!(dispatcher.has_handler(kind));
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let projection = Arc::new(CountingProjection {
            calls: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new();
        dispatcher.on(EventKind::AnswerCountChanged, projection.clone());

        let body = envelope(&answer_count("q1"));
        assert_eq!(dispatcher.handle(message(&body, 0)).await, Disposition::Ack);
        assert_eq!(projection.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_handler_dead_letters() {
        let dispatcher = Dispatcher::new();
        let body = envelope(&answer_count("q1"));

        let disposition = dispatcher.handle(message(&body, 0)).await;
        assert!(matches!(disposition, Disposition::DeadLetter { .. }));
    }

    #[tokio::test]
    async fn test_malformed_message_dead_letters() {
        let dispatcher = Dispatcher::with_projections(Arc::new(MemoryIndex::new()), "questions");
        let disposition = dispatcher.handle(message(b"not json", 0)).await;
        assert!(matches!(disposition, Disposition::DeadLetter { .. }));
    }

    #[tokio::test]
    async fn test_type_hint_mismatch_dead_letters() {
        let dispatcher = Dispatcher::with_projections(Arc::new(MemoryIndex::new()), "questions");
        let body = envelope(&DomainEvent::QuestionDeleted(QuestionDeleted {
            question_id: "q1".into(),
        }));
        let msg = IncomingMessage {
            body: &body,
            type_hint: Some("QuestionCreated"),
            retry_count: 0,
        };

        assert!(matches!(
            dispatcher.handle(msg).await,
            Disposition::DeadLetter { .. }
        ));
    }

    #[tokio::test]
    async fn test_failure_retries_then_dead_letters() {
        // Patch against a document that does not exist fails every time
        let dispatcher = Dispatcher::with_projections(Arc::new(MemoryIndex::new()), "questions")
            .with_max_retries(2);
        let body = envelope(&answer_count("missing"));

        let first = dispatcher.handle(message(&body, 0)).await;
        assert!(matches!(first, Disposition::Retry { retry_count: 1, .. }));

        let second = dispatcher.handle(message(&body, 1)).await;
        assert!(matches!(second, Disposition::Retry { retry_count: 2, .. }));

        let third = dispatcher.handle(message(&body, 2)).await;
        assert!(matches!(third, Disposition::DeadLetter { .. }));
    }

    #[tokio::test]
    async fn test_delete_of_unknown_document_acks() {
        let dispatcher = Dispatcher::with_projections(Arc::new(MemoryIndex::new()), "questions");
        let body = envelope(&DomainEvent::QuestionDeleted(QuestionDeleted {
            question_id: "q1".into(),
        }));
        let msg = IncomingMessage {
            body: &body,
            type_hint: Some("QuestionDeleted"),
            retry_count: 0,
        };

        assert_eq!(dispatcher.handle(msg).await, Disposition::Ack);
    }
}
