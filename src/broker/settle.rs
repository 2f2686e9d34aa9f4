//! Turning a [`Disposition`] into broker actions.
//!
//! The consumer never talks to the broker directly when finishing a
//! delivery. It hands the decision to a [`Settler`], which acts through
//! three seams:
//!
//! - [`Acknowledge`]: ack, requeue or discard the original delivery
//! - [`Republish`]: put a retried copy back on the queue
//! - [`DeadLetterSink`]: park a message on the dead-letter exchange
//!
//! ```text
//! Ack        ──► ack                              Acked
//! Retry      ──► sleep, republish ─ confirmed ──► ack      Retried
//!                                 └ otherwise ──► requeue  Requeued
//! DeadLetter ──► dead-letter ─ ok ────────────► ack      DeadLettered
//!                            └ failed ────────► discard  Rejected
//! ```

use super::consumer::{retry_delay, retry_headers};
use super::dead_letter::{DeadLetterError, FailedMessage};
use crate::dispatch::Disposition;
use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions};
use lapin::{BasicProperties, Channel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Final state of the original delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    /// A copy with a bumped retry count is queued; the original is acked
    Retried,
    /// The retry copy was not confirmed; the original goes back as-is
    Requeued,
    DeadLettered,
    /// Dead-lettering failed; the queue's own dead-letter exchange takes it
    Rejected,
}

/// Acknowledgement of the original delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), lapin::Error>;

    /// Negative acknowledgement with requeue.
    async fn requeue(&self) -> Result<(), lapin::Error>;

    /// Reject without requeue.
    async fn discard(&self) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), lapin::Error> {
        Acker::ack(self, BasicAckOptions::default()).await
    }

    async fn requeue(&self) -> Result<(), lapin::Error> {
        Acker::nack(
            self,
            BasicNackOptions {
                requeue: true,
                ..Default::default()
            },
        )
        .await
    }

    async fn discard(&self) -> Result<(), lapin::Error> {
        Acker::reject(self, BasicRejectOptions { requeue: false }).await
    }
}

/// Puts a retried message back on its queue.
#[async_trait]
pub trait Republish: Send + Sync {
    /// `Ok(false)` when the broker nacked the copy.
    async fn republish(&self, body: &[u8], properties: BasicProperties) -> Result<bool, lapin::Error>;
}

/// Publishes retries to a queue through the default exchange.
///
/// The channel must be in confirm mode.
pub struct QueueRepublisher {
    channel: Channel,
    queue: String,
}

impl QueueRepublisher {
    pub fn new(channel: Channel, queue: &str) -> Self {
        Self {
            channel,
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl Republish for QueueRepublisher {
    async fn republish(&self, body: &[u8], properties: BasicProperties) -> Result<bool, lapin::Error> {
        let confirmation = self
            .channel
            .basic_publish("", &self.queue, BasicPublishOptions::default(), body, properties)
            .await?
            .await?;

        Ok(!confirmation.is_nack())
    }
}

/// Where messages go once the consumer gives up on them.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(
        &self,
        body: &[u8],
        properties: &BasicProperties,
        failure: &FailedMessage,
    ) -> Result<(), DeadLetterError>;
}

/// Applies dispositions through the settlement seams.
#[derive(Clone)]
pub struct Settler {
    retries: Arc<dyn Republish>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_base_delay: Duration,
}

impl Settler {
    pub fn new(
        retries: Arc<dyn Republish>,
        dead_letters: Arc<dyn DeadLetterSink>,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            retries,
            dead_letters,
            retry_base_delay,
        }
    }

    /// Finish one delivery. `retry_count` is the count the delivery arrived
    /// with; an error means the final ack/nack/reject itself failed.
    pub async fn settle(
        &self,
        delivery: &dyn Acknowledge,
        body: &[u8],
        properties: &BasicProperties,
        retry_count: u32,
        disposition: &Disposition,
    ) -> Result<Settlement, lapin::Error> {
        match disposition {
            Disposition::Ack => {
                delivery.ack().await?;
                Ok(Settlement::Acked)
            }
            Disposition::Retry { retry_count, error } => {
                self.retry(delivery, body, properties, *retry_count, error)
                    .await
            }
            Disposition::DeadLetter { reason } => {
                self.dead_letter(delivery, body, properties, retry_count, reason)
                    .await
            }
        }
    }

    async fn retry(
        &self,
        delivery: &dyn Acknowledge,
        body: &[u8],
        properties: &BasicProperties,
        retry_count: u32,
        error: &str,
    ) -> Result<Settlement, lapin::Error> {
        let delay = retry_delay(self.retry_base_delay, retry_count);
        debug!(
            retry_count = retry_count,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry"
        );
        tokio::time::sleep(delay).await;

        let copy = properties.clone().with_headers(retry_headers(
            properties.headers().as_ref(),
            retry_count,
            error,
        ));

        let confirmed = match self.retries.republish(body, copy).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(error = %e, "Republish failed");
                false
            }
        };

        if confirmed {
            delivery.ack().await?;
            return Ok(Settlement::Retried);
        }

        warn!(retry_count = retry_count, "Retry not confirmed, requeueing original");
        delivery.requeue().await?;
        Ok(Settlement::Requeued)
    }

    async fn dead_letter(
        &self,
        delivery: &dyn Acknowledge,
        body: &[u8],
        properties: &BasicProperties,
        retry_count: u32,
        reason: &str,
    ) -> Result<Settlement, lapin::Error> {
        let failure = FailedMessage::new(reason, retry_count);

        match self.dead_letters.send(body, properties, &failure).await {
            Ok(()) => {
                delivery.ack().await?;
                Ok(Settlement::DeadLettered)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Dead-letter publish failed, rejecting to queue's dead-letter exchange"
                );
                delivery.discard().await?;
                Ok(Settlement::Rejected)
            }
        }
    }
}
