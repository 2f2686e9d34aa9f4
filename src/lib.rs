//! # overflow-sync
//!
//! Keeps a full-text search index of questions eventually consistent with
//! the question store, and serves tag-aware search over it.
//!
//! ## Architecture
//!
//! ```text
//! writer ── Publisher ──► [questions] ──► questions.search ──► QueueConsumer
//!                                                                  │
//!                                              Dispatcher ◄────────┘
//!                                                  │
//!                                   Projection ──► SearchIndex ◄── /search
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Domain events and their JSON envelope
//! - [`broker`]: AMQP connection, topology, publisher, consumer, dead letters
//! - [`dispatch`]: Routes decoded events to projections, decides ack/retry
//! - [`projection`]: One projection per event kind, writing the index
//! - [`index`]: Search index trait, Typesense client, in-memory index, bootstrap
//! - [`query`]: `[tag]` extraction from free-text queries
//! - [`api`]: Reader search API and writer relay
//! - [`config`]: TOML configuration
//! - [`shutdown`]: Graceful shutdown signal

pub mod api;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod index;
pub mod projection;
pub mod query;
pub mod shutdown;

// Re-export commonly used types at crate root
pub use dispatch::{Dispatcher, Disposition};
pub use event::{DomainEvent, EventKind};
pub use index::{SearchDocument, SearchIndex};
pub use projection::Projection;

/// Exchange carrying question domain events
pub const DEFAULT_EXCHANGE: &str = "questions";

/// Durable queue feeding the search projection
pub const DEFAULT_QUEUE: &str = "questions.search";

/// Search collection holding question documents
pub const DEFAULT_COLLECTION: &str = "questions";
