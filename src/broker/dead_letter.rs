//! Dead-letter sink for messages the consumer gives up on.
//!
//! A dead-lettered message is republished to the dead-letter exchange with
//! the failure attached as headers, so whoever inspects the dead-letter
//! queue can see why it landed there:
//!
//! | header               | value                           |
//! |----------------------|---------------------------------|
//! | `x-last-error`       | last handler or decode error    |
//! | `x-retry-count`      | retries spent before giving up  |
//! | `x-dead-lettered-at` | RFC 3339 timestamp              |
//!
//! If that publish fails the consumer falls back to rejecting the delivery
//! without requeue, which the queue's `x-dead-letter-exchange` argument
//! routes to the same place, minus the headers.
//!
//! Queue depth is read by [`DeadLetterDepth`] on a throwaway channel per
//! call. A passive declare of a missing queue closes its channel, and that
//! must never take the publishing channel down with it.

use super::connection::Broker;
use super::settle::DeadLetterSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

pub const LAST_ERROR_HEADER: &str = "x-last-error";
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const DEAD_LETTERED_AT_HEADER: &str = "x-dead-lettered-at";

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("dead-letter exchange nacked the message")]
    Nacked,
}

/// Why and when a message was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMessage {
    pub reason: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailedMessage {
    pub fn new(reason: impl Into<String>, retry_count: u32) -> Self {
        Self {
            reason: reason.into(),
            retry_count,
            failed_at: Utc::now(),
        }
    }

    /// The original headers plus the failure headers.
    pub fn headers(&self, original: Option<&FieldTable>) -> FieldTable {
        let mut headers = original.cloned().unwrap_or_default();
        headers.insert(
            LAST_ERROR_HEADER.into(),
            AMQPValue::LongString(LongString::from(self.reason.as_str())),
        );
        headers.insert(
            RETRY_COUNT_HEADER.into(),
            AMQPValue::LongUInt(self.retry_count),
        );
        headers.insert(
            DEAD_LETTERED_AT_HEADER.into(),
            AMQPValue::LongString(LongString::from(self.failed_at.to_rfc3339().as_str())),
        );
        headers
    }
}

/// Publishes failed messages to the dead-letter exchange.
#[derive(Clone)]
pub struct DeadLetterQueue {
    channel: Channel,
    exchange: String,
    queue: String,
}

impl DeadLetterQueue {
    /// Use `channel` exclusively for dead-lettering; it is put in confirm mode.
    pub async fn new(channel: Channel, exchange: &str, queue: &str) -> Result<Self, DeadLetterError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            channel,
            exchange: exchange.to_string(),
            queue: queue.to_string(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    /// Republish `body` to the dead-letter exchange.
    async fn send(
        &self,
        body: &[u8],
        properties: &BasicProperties,
        failure: &FailedMessage,
    ) -> Result<(), DeadLetterError> {
        let properties = properties
            .clone()
            .with_headers(failure.headers(properties.headers().as_ref()));

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                body,
                properties.clone(),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            error!(exchange = %self.exchange, "Dead-letter publish nacked");
            return Err(DeadLetterError::Nacked);
        }

        info!(
            message_id = ?properties.message_id().as_ref().map(|m| m.as_str()),
            kind = ?properties.kind().as_ref().map(|k| k.as_str()),
            retry_count = failure.retry_count,
            reason = %failure.reason,
            "Message moved to dead-letter queue"
        );
        Ok(())
    }
}

/// Number of messages waiting in a queue.
#[async_trait]
pub trait QueueDepth: Send + Sync {
    fn queue(&self) -> &str;

    async fn depth(&self) -> Result<u32, DeadLetterError>;
}

/// Reads the dead-letter queue depth on a fresh channel per call.
pub struct DeadLetterDepth {
    broker: Arc<Broker>,
    queue: String,
}

impl DeadLetterDepth {
    pub fn new(broker: Arc<Broker>, queue: &str) -> Self {
        Self {
            broker,
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl QueueDepth for DeadLetterDepth {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn depth(&self) -> Result<u32, DeadLetterError> {
        let channel = self.broker.channel().await?;
        let declared = channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        // Already closed by the broker if the declare failed
        if channel.status().connected() {
            if let Err(e) = channel.close(200, "depth read").await {
                debug!(error = %e, "Failed to close depth channel");
            }
        }

        Ok(declared?.message_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_headers() {
        let failure = FailedMessage::new("index unavailable", 3);
        let headers = failure.headers(None);

        assert_eq!(
            headers.inner().get(LAST_ERROR_HEADER),
            Some(&AMQPValue::LongString("index unavailable".into()))
        );
        assert_eq!(
            headers.inner().get(RETRY_COUNT_HEADER),
            Some(&AMQPValue::LongUInt(3))
        );
        assert!(headers.inner().contains_key(DEAD_LETTERED_AT_HEADER));
    }

    #[test]
    fn test_original_headers_are_kept() {
        let mut original = FieldTable::default();
        original.insert("x-trace".into(), AMQPValue::LongString("abc".into()));
        original.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(1));

        let headers = FailedMessage::new("boom", 3).headers(Some(&original));

        assert_eq!(
            headers.inner().get("x-trace"),
            Some(&AMQPValue::LongString("abc".into()))
        );
        assert_eq!(
            headers.inner().get(RETRY_COUNT_HEADER),
            Some(&AMQPValue::LongUInt(3))
        );
    }
}
