//! Exchange and queue topology.
//!
//! ```text
//!  writer ──► [questions] (fanout) ──► questions.search ──► reader
//!                                          │ rejected
//!                                          ▼
//!                     [questions.dlx] (fanout) ──► questions.search.dlq
//! ```
//!
//! Declarations are idempotent: declaring an exchange or queue that already
//! exists with the same arguments is a no-op on the broker, so every process
//! declares what it uses on every start.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use thiserror::Error;
use tracing::{debug, info};

/// Queue argument naming the exchange rejected messages are routed to
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to declare {what}: {source}")]
    Declare {
        what: String,
        #[source]
        source: lapin::Error,
    },
}

/// The reader's side of the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

/// Static description of what a process needs on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Exchange carrying question domain events
    pub exchange: String,

    /// Present for consuming processes
    pub queue: Option<QueueTopology>,
}

/// A single idempotent broker declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange {
        name: String,
    },
    Queue {
        name: String,
        dead_letter_exchange: Option<String>,
    },
    Binding {
        queue: String,
        exchange: String,
    },
}

impl Topology {
    /// Publisher-only topology: just the exchange.
    pub fn publisher(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: None,
        }
    }

    /// Consumer topology with a durable queue and its dead-letter path.
    pub fn consumer(
        exchange: &str,
        queue: &str,
        dead_letter_exchange: &str,
        dead_letter_queue: &str,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: Some(QueueTopology {
                queue: queue.to_string(),
                dead_letter_exchange: dead_letter_exchange.to_string(),
                dead_letter_queue: dead_letter_queue.to_string(),
            }),
        }
    }

    /// Declarations in dependency order: exchanges, then queues, then bindings.
    pub fn declarations(&self) -> Vec<Declaration> {
        let mut declarations = vec![Declaration::Exchange {
            name: self.exchange.clone(),
        }];

        if let Some(q) = &self.queue {
            declarations.push(Declaration::Exchange {
                name: q.dead_letter_exchange.clone(),
            });
            declarations.push(Declaration::Queue {
                name: q.queue.clone(),
                dead_letter_exchange: Some(q.dead_letter_exchange.clone()),
            });
            declarations.push(Declaration::Queue {
                name: q.dead_letter_queue.clone(),
                dead_letter_exchange: None,
            });
            declarations.push(Declaration::Binding {
                queue: q.queue.clone(),
                exchange: self.exchange.clone(),
            });
            declarations.push(Declaration::Binding {
                queue: q.dead_letter_queue.clone(),
                exchange: q.dead_letter_exchange.clone(),
            });
        }

        declarations
    }
}

fn queue_arguments(dead_letter_exchange: Option<&str>) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(dlx) = dead_letter_exchange {
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(dlx.into()),
        );
    }
    arguments
}

/// Ensure every declaration of `topology` exists on the broker.
pub async fn declare(channel: &Channel, topology: &Topology) -> Result<(), TopologyError> {
    for declaration in topology.declarations() {
        debug!(declaration = ?declaration, "Declaring");

        match &declaration {
            Declaration::Exchange { name } => {
                channel
                    .exchange_declare(
                        name,
                        ExchangeKind::Fanout,
                        ExchangeDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|source| TopologyError::Declare {
                        what: format!("exchange '{}'", name),
                        source,
                    })?;
            }
            Declaration::Queue {
                name,
                dead_letter_exchange,
            } => {
                channel
                    .queue_declare(
                        name,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        queue_arguments(dead_letter_exchange.as_deref()),
                    )
                    .await
                    .map_err(|source| TopologyError::Declare {
                        what: format!("queue '{}'", name),
                        source,
                    })?;
            }
            Declaration::Binding { queue, exchange } => {
                channel
                    .queue_bind(
                        queue,
                        exchange,
                        "",
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|source| TopologyError::Declare {
                        what: format!("binding '{}' -> '{}'", exchange, queue),
                        source,
                    })?;
            }
        }
    }

    info!(
        exchange = %topology.exchange,
        queue = ?topology.queue.as_ref().map(|q| q.queue.as_str()),
        "Broker topology declared"
    );
    Ok(())
}
