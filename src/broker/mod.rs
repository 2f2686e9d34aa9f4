//! AMQP plumbing: connection, topology, publishing, consuming and
//! dead-lettering.

pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod publisher;
pub mod settle;
pub mod topology;

pub use connection::{
    connect_with_retry, retry_with_backoff, AmqpConnector, Broker, ConnectionError, Connector,
    RetryNotice, RetryPolicy,
};
pub use consumer::{
    consumer_exit, ConsumerError, ConsumerSettings, ConsumerStats, QueueConsumer, StatsSnapshot,
};
pub use dead_letter::{
    DeadLetterDepth, DeadLetterError, DeadLetterQueue, FailedMessage, QueueDepth,
};
pub use publisher::{
    publish_after_commit, AmqpPublisher, Committed, MemoryPublisher, PublishError, PublishReceipt,
    Publisher,
};
pub use settle::{
    Acknowledge, DeadLetterSink, QueueRepublisher, Republish, Settlement, Settler,
};
pub use topology::{declare, Declaration, Topology, TopologyError};
