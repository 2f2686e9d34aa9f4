//! Event publisher (writer side).
//!
//! Publishing happens after the writer's local commit and there is no outbox:
//! if the process dies between the two, the event is lost. Every publish
//! waits for the broker's confirm so a nack surfaces as an error.

use crate::event::{DomainEvent, EventKind};
use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel};
use std::future::Future;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

/// AMQP persistent delivery mode
const PERSISTENT: u8 = 2;

const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker rejected message {message_id}")]
    Nacked { message_id: String },

    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Acknowledgement of a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub kind: EventKind,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<PublishReceipt, PublishError>;
}

/// AMQP message properties for an event envelope.
pub fn message_properties(kind: EventKind, message_id: &str) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(PERSISTENT)
        .with_type(kind.as_str().into())
        .with_message_id(message_id.into())
        .with_timestamp(Utc::now().timestamp().max(0) as u64)
}

/// Publishes envelopes to the question exchange with publisher confirms.
pub struct AmqpPublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpPublisher {
    /// Put `channel` into confirm mode and publish through it.
    pub async fn new(channel: Channel, exchange: &str) -> Result<Self, PublishError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            channel,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<PublishReceipt, PublishError> {
        let kind = event.kind();
        let message_id = Uuid::new_v4().to_string();
        let body = event.to_envelope()?;

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                &body,
                message_properties(kind, &message_id),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            error!(message_id = %message_id, kind = %kind, "Broker nacked event");
            return Err(PublishError::Nacked { message_id });
        }

        info!(
            message_id = %message_id,
            kind = %kind,
            id = %event.question_id(),
            exchange = %self.exchange,
            "Event published"
        );
        Ok(PublishReceipt { message_id, kind })
    }
}

/// Collects published events in memory. Used by tests and local runs
/// without a broker.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<DomainEvent>>,
    unavailable: Mutex<Option<String>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self
            .unavailable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
    }

    pub fn published(&self) -> Vec<DomainEvent> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<PublishReceipt, PublishError> {
        let failure = self
            .unavailable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(reason) = failure {
            return Err(PublishError::Unavailable(reason));
        }

        event.to_envelope()?;
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());

        debug!(kind = %event.kind(), id = %event.question_id(), "Event recorded");
        Ok(PublishReceipt {
            message_id: Uuid::new_v4().to_string(),
            kind: event.kind(),
        })
    }
}

/// Result of a commit followed by a best-effort publish.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,

    /// `None` when the commit succeeded but the publish did not
    pub receipt: Option<PublishReceipt>,
}

/// Run the local commit, then publish `event` only if it succeeded.
///
/// A failed publish does not undo the commit; it is logged and reported as a
/// missing receipt.
pub async fn publish_after_commit<T, E, Fut>(
    publisher: &dyn Publisher,
    commit: Fut,
    event: &DomainEvent,
) -> Result<Committed<T>, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let value = commit.await?;

    let receipt = match publisher.publish(event).await {
        Ok(receipt) => Some(receipt),
        Err(e) => {
            error!(
                kind = %event.kind(),
                id = %event.question_id(),
                error = %e,
                "Committed change was not published; search index will miss it"
            );
            None
        }
    };

    Ok(Committed { value, receipt })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AnswerAccepted, QuestionDeleted};

    fn deleted(id: &str) -> DomainEvent {
        DomainEvent::QuestionDeleted(QuestionDeleted {
            question_id: id.into(),
        })
    }

    #[test]
    fn test_message_properties() {
        let props = message_properties(EventKind::AnswerAccepted, "m-1");
        assert_eq!(
            props.kind().as_ref().map(|k| k.as_str()),
            Some("AnswerAccepted")
        );
        assert_eq!(props.message_id().as_ref().map(|m| m.as_str()), Some("m-1"));
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(CONTENT_TYPE)
        );
        assert!(props.timestamp().is_some());
    }

    #[tokio::test]
    async fn test_memory_publisher_records() {
        let publisher = MemoryPublisher::new();
        let event = DomainEvent::AnswerAccepted(AnswerAccepted {
            question_id: "q1".into(),
            answer_id: "a1".into(),
        });

        let receipt = publisher.publish(&event).await.unwrap();
        assert_eq!(receipt.kind, EventKind::AnswerAccepted);
        assert!(Uuid::parse_str(&receipt.message_id).is_ok());
        assert_eq!(publisher.published(), vec![event]);
    }

    #[tokio::test]
    async fn test_publish_after_commit_publishes_on_success() {
        let publisher = MemoryPublisher::new();
        let event = deleted("q1");

        let committed = publish_after_commit(&publisher, async { Ok::<_, String>(7) }, &event)
            .await
            .unwrap();

        assert_eq!(committed.value, 7);
        assert!(committed.receipt.is_some());
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_publishes_nothing() {
        let publisher = MemoryPublisher::new();
        let event = deleted("q1");

        let result = publish_after_commit(
            &publisher,
            async { Err::<(), _>("constraint violation".to_string()) },
            &event,
        )
        .await;

        assert_eq!(result.unwrap_err(), "constraint violation");
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_commit() {
        let publisher = MemoryPublisher::new();
        publisher.fail_with("broker down");

        let committed =
            publish_after_commit(&publisher, async { Ok::<_, String>("saved") }, &deleted("q1"))
                .await
                .unwrap();

        assert_eq!(committed.value, "saved");
        assert!(committed.receipt.is_none());
    }
}
