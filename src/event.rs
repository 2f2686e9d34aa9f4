//! Domain events published by the question store.
//!
//! Every business fact the search side cares about is a variant of
//! [`DomainEvent`]. On the wire an event travels as an envelope:
//!
//! ```json
//! {
//!   "type": "QuestionCreated",
//!   "payload": {
//!     "questionId": "q-42",
//!     "title": "Why does the borrow checker reject this?",
//!     "content": "<p>...</p>",
//!     "createdAt": "2025-12-24T14:11:34Z",
//!     "tags": ["rust", "lifetimes"]
//!   }
//! }
//! ```
//!
//! The `type` field selects the variant, the `payload` carries its fields in
//! camelCase. `questionId` is the only join key between the question store
//! and the search index, so an envelope with an empty id is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{kind} event has an empty questionId")]
    EmptyQuestionId { kind: EventKind },
}

/// A question was asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionCreated {
    pub question_id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A question's title, body or tags were edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionUpdated {
    pub question_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionDeleted {
    pub question_id: String,
}

/// An answer was posted or removed; carries the new total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerCountChanged {
    pub question_id: String,
    pub answer_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerAccepted {
    pub question_id: String,
    pub answer_id: String,
}

/// A fact about a question, as published to the `questions` exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DomainEvent {
    QuestionCreated(QuestionCreated),
    QuestionUpdated(QuestionUpdated),
    QuestionDeleted(QuestionDeleted),
    AnswerCountChanged(AnswerCountChanged),
    AnswerAccepted(AnswerAccepted),
}

/// Fieldless mirror of [`DomainEvent`], used as a registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    QuestionCreated,
    QuestionUpdated,
    QuestionDeleted,
    AnswerCountChanged,
    AnswerAccepted,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::QuestionCreated,
        EventKind::QuestionUpdated,
        EventKind::QuestionDeleted,
        EventKind::AnswerCountChanged,
        EventKind::AnswerAccepted,
    ];

    /// Name used in the envelope `type` field and the AMQP `type` property.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::QuestionCreated => "QuestionCreated",
            EventKind::QuestionUpdated => "QuestionUpdated",
            EventKind::QuestionDeleted => "QuestionDeleted",
            EventKind::AnswerCountChanged => "AnswerCountChanged",
            EventKind::AnswerAccepted => "AnswerAccepted",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::QuestionCreated(_) => EventKind::QuestionCreated,
            DomainEvent::QuestionUpdated(_) => EventKind::QuestionUpdated,
            DomainEvent::QuestionDeleted(_) => EventKind::QuestionDeleted,
            DomainEvent::AnswerCountChanged(_) => EventKind::AnswerCountChanged,
            DomainEvent::AnswerAccepted(_) => EventKind::AnswerAccepted,
        }
    }

    /// The question this fact is about.
    pub fn question_id(&self) -> &str {
        match self {
            DomainEvent::QuestionCreated(e) => &e.question_id,
            DomainEvent::QuestionUpdated(e) => &e.question_id,
            DomainEvent::QuestionDeleted(e) => &e.question_id,
            DomainEvent::AnswerCountChanged(e) => &e.question_id,
            DomainEvent::AnswerAccepted(e) => &e.question_id,
        }
    }

    /// Serialize into the JSON envelope.
    pub fn to_envelope(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a JSON envelope, rejecting events without a join key.
    pub fn from_envelope(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let event: DomainEvent = serde_json::from_slice(bytes)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.question_id().trim().is_empty() {
            return Err(EnvelopeError::EmptyQuestionId { kind: self.kind() });
        }
        Ok(())
    }
}
