//! overflow-sync reader service.
//!
//! Bootstraps the search collection, consumes question events from the
//! broker into the index and serves `/search`.
//!
//! # Environment Variables
//!
//! - `OVERFLOW_CONFIG`: Config file path (default: "config/overflow.toml")
//! - `BROKER_URL`, `SEARCH_URL`, `SEARCH_API_KEY`, `PORT`: config overrides
//! - `RUST_LOG`: Logging level (default: "info")

use overflow_sync::api::{search_router, SearchState};
use overflow_sync::broker::{
    consumer_exit, declare, Broker, ConsumerStats, DeadLetterDepth, DeadLetterQueue,
    QueueConsumer,
};
use overflow_sync::config::OverflowConfig;
use overflow_sync::index::{ensure_schema, question_schema, SearchIndex, TypesenseIndex};
use overflow_sync::shutdown::{ShutdownCause, ShutdownSignal};
use overflow_sync::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OverflowConfig::load()?;
    let collection = config.search.collection.clone();

    // 1. Search collection
    let index: Arc<dyn SearchIndex> = Arc::new(
        TypesenseIndex::new(config.search.url.clone(), config.search.api_key.clone())
            .with_timeout(config.search_timeout()),
    );
    let outcome = ensure_schema(index.as_ref(), &question_schema(&collection)).await?;
    info!(collection = %collection, outcome = ?outcome, "Search collection ready");

    // 2. Broker connection and topology
    let broker = Arc::new(Broker::connect(&config.broker.url, &config.broker.retry_policy()).await?);
    declare(&broker.channel().await?, &config.broker.consumer_topology()).await?;

    // 3. Consumer
    let dispatcher = Arc::new(
        Dispatcher::with_projections(index.clone(), &collection)
            .with_max_retries(config.consumer.max_retries),
    );
    let dead_letters = DeadLetterQueue::new(
        broker.channel().await?,
        &config.broker.dead_letter_exchange(),
        &config.broker.dead_letter_queue(),
    )
    .await?;
    let stats = Arc::new(ConsumerStats::new());
    let consumer = QueueConsumer::new(
        broker.channel().await?,
        config.consumer_settings(),
        dispatcher,
        dead_letters,
        stats.clone(),
    )
    .await?;

    let shutdown = ShutdownSignal::new();
    let server_shutdown = shutdown.notified();
    let consumer_stop = shutdown.notified();

    let consumer_signal = shutdown.clone();
    let consumer_task = tokio::spawn(async move {
        let result = consumer.run(consumer_stop).await;
        if let Err(e) = &result {
            error!(error = %e, "Consumer failed, shutting down");
        }
        // Stop serving once the consumer is gone
        consumer_signal.trigger(ShutdownCause::ConsumerStopped);
        result
    });

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    // 4. HTTP
    let state = Arc::new(
        SearchState::new(index, &collection, config.search.page_size)
            .with_consumer(
                stats,
                Some(Arc::new(DeadLetterDepth::new(
                    broker.clone(),
                    &config.broker.dead_letter_queue(),
                ))),
            ),
    );
    let app = search_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("overflow-sync listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(server_shutdown)
        .await?;

    // 5. Drain and close
    info!(cause = ?shutdown.cause(), "HTTP server stopped, draining consumer");
    let exit = match tokio::time::timeout(shutdown.timeout(), consumer_task).await {
        Ok(joined) => consumer_exit(joined),
        Err(_) => {
            warn!(
                timeout_secs = shutdown.timeout().as_secs(),
                "Consumer did not drain in time"
            );
            Ok(())
        }
    };

    match Arc::try_unwrap(broker) {
        Ok(broker) => {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "Failed to close broker connection cleanly");
            }
        }
        Err(_) => warn!("Broker still in use at shutdown, leaving connection to drop"),
    }

    match exit {
        Ok(()) => {
            info!("Consumer drained, overflow-sync stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "overflow-sync stopped because the consumer failed");
            Err(e.into())
        }
    }
}
