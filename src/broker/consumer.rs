//! Queue consumer - feeds deliveries to the [`Dispatcher`].
//!
//! Every delivery is handled in its own task, bounded by the channel's
//! prefetch. Nothing orders work per question id: two events for the same
//! document may be applied concurrently.
//!
//! ```text
//! delivery ──► Dispatcher::handle ──► Disposition ──► Settler::settle
//! ```
//!
//! The consumer only ends cleanly on shutdown. A broker that closes the
//! delivery stream is an error, so the process exits non-zero and gets
//! restarted.

use super::dead_letter::{DeadLetterQueue, LAST_ERROR_HEADER, RETRY_COUNT_HEADER};
use super::settle::{QueueRepublisher, Settler};
use crate::dispatch::{Dispatcher, Disposition, IncomingMessage};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

/// Default broker prefetch
pub const DEFAULT_PREFETCH: u16 = 10;

/// Default base delay before a retried message is republished
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Largest backoff multiplier (2^5)
const MAX_BACKOFF_EXPONENT: u32 = 5;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("delivery stream closed by broker")]
    StreamClosed,

    #[error("consumer task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
    pub retry_base_delay: Duration,
}

/// Running totals of message outcomes.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Ack => &self.acked,
            Disposition::Retry { .. } => &self.retried,
            Disposition::DeadLetter { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Backoff before republishing retry number `retry_count`, capped at 32x.
pub fn retry_delay(base: Duration, retry_count: u32) -> Duration {
    base.saturating_mul(1 << retry_count.min(MAX_BACKOFF_EXPONENT))
}

/// Read `x-retry-count`, treating a missing or unreadable header as zero.
pub fn retry_count(headers: Option<&FieldTable>) -> u32 {
    let Some(value) = headers.and_then(|h| h.inner().get(RETRY_COUNT_HEADER)) else {
        return 0;
    };

    match value {
        AMQPValue::ShortShortUInt(n) => u32::from(*n),
        AMQPValue::ShortUInt(n) => u32::from(*n),
        AMQPValue::LongUInt(n) => *n,
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).unwrap_or(0),
        AMQPValue::ShortInt(n) => u32::try_from(*n).unwrap_or(0),
        AMQPValue::LongInt(n) => u32::try_from(*n).unwrap_or(0),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).unwrap_or(0),
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes())
            .trim()
            .parse()
            .unwrap_or(0),
        _ => 0,
    }
}

/// Headers for the republished copy of a retried message.
pub fn retry_headers(original: Option<&FieldTable>, retry_count: u32, error: &str) -> FieldTable {
    let mut headers = original.cloned().unwrap_or_default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(retry_count));
    headers.insert(
        LAST_ERROR_HEADER.into(),
        AMQPValue::LongString(LongString::from(error)),
    );
    headers
}

/// The AMQP `type` property, used as a routing hint.
pub fn type_hint(properties: &BasicProperties) -> Option<&str> {
    properties.kind().as_ref().map(|k| k.as_str())
}

/// Fold a joined consumer task into the process outcome. Only a consumer
/// that stopped because shutdown was requested counts as success.
pub fn consumer_exit(
    joined: Result<Result<(), ConsumerError>, JoinError>,
) -> Result<(), ConsumerError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ConsumerError::Task(e.to_string())),
    }
}

/// Everything a delivery task needs.
struct DeliveryHandler {
    dispatcher: Arc<Dispatcher>,
    settler: Settler,
    stats: Arc<ConsumerStats>,
}

impl DeliveryHandler {
    async fn process(&self, delivery: Delivery) {
        let message = IncomingMessage {
            body: &delivery.data,
            type_hint: type_hint(&delivery.properties),
            retry_count: retry_count(delivery.properties.headers().as_ref()),
        };

        let disposition = self.dispatcher.handle(message).await;
        self.stats.record(&disposition);

        let settled = self
            .settler
            .settle(
                &delivery.acker,
                &delivery.data,
                &delivery.properties,
                message.retry_count,
                &disposition,
            )
            .await;

        if let Err(e) = settled {
            error!(
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Failed to settle delivery; broker will redeliver"
            );
        }
    }
}

/// Consumes the search queue until shutdown.
pub struct QueueConsumer {
    channel: Channel,
    settings: ConsumerSettings,
    handler: Arc<DeliveryHandler>,
}

impl QueueConsumer {
    /// Take ownership of `channel` for consuming and republishing retries.
    pub async fn new(
        channel: Channel,
        settings: ConsumerSettings,
        dispatcher: Arc<Dispatcher>,
        dead_letters: DeadLetterQueue,
        stats: Arc<ConsumerStats>,
    ) -> Result<Self, ConsumerError> {
        channel
            .basic_qos(settings.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let settler = Settler::new(
            Arc::new(QueueRepublisher::new(channel.clone(), &settings.queue)),
            Arc::new(dead_letters),
            settings.retry_base_delay,
        );
        let handler = Arc::new(DeliveryHandler {
            dispatcher,
            settler,
            stats,
        });

        Ok(Self {
            channel,
            settings,
            handler,
        })
    }

    /// Consume until `stop` resolves or the broker ends the stream, then
    /// cancel the subscription and wait for in-flight deliveries. Returns
    /// `Ok` only when stopped by `stop`.
    pub async fn run(self, stop: impl Future<Output = ()>) -> Result<(), ConsumerError> {
        tokio::pin!(stop);
        let channel = &self.channel;
        let mut deliveries = channel
            .basic_consume(
                &self.settings.queue,
                &self.settings.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %self.settings.queue,
            consumer_tag = %self.settings.consumer_tag,
            prefetch = self.settings.prefetch,
            "Consumer started"
        );

        let mut in_flight = JoinSet::new();
        let mut result = Ok(());

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("Shutdown signal received, stopping consumer");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let handler = self.handler.clone();
                        in_flight.spawn(async move { handler.process(delivery).await });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Delivery stream failed");
                        result = Err(e.into());
                        break;
                    }
                    None => {
                        error!("Delivery stream closed by broker");
                        result = Err(ConsumerError::StreamClosed);
                        break;
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Delivery task panicked");
                    }
                }
            }
        }

        if let Err(e) = channel
            .basic_cancel(&self.settings.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(error = %e, "Failed to cancel consumer");
        }

        info!(in_flight = in_flight.len(), "Draining in-flight deliveries");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Delivery task panicked");
            }
        }

        let stats = self.handler.stats.snapshot();
        info!(
            acked = stats.acked,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        result
    }
}
