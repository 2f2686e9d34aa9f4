//! Writer-side relay.
//!
//! The question service calls `POST /api/v1/events` after committing a
//! change; the relay publishes the envelope to the `questions` exchange.
//!
//! # Environment Variables
//!
//! - `OVERFLOW_CONFIG`: Config file path (default: "config/overflow.toml")
//! - `BROKER_URL`, `PORT`: config overrides
//! - `RUST_LOG`: Logging level (default: "info")

use overflow_sync::api::{relay_router, RelayState};
use overflow_sync::broker::{declare, AmqpPublisher, Broker};
use overflow_sync::config::OverflowConfig;
use overflow_sync::shutdown::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OverflowConfig::load()?;

    let broker = Broker::connect(&config.broker.url, &config.broker.retry_policy()).await?;
    declare(&broker.channel().await?, &config.broker.publisher_topology()).await?;

    let publisher = AmqpPublisher::new(broker.channel().await?, &config.broker.exchange).await?;
    let broker = Arc::new(broker);

    let state = Arc::new(RelayState::new(Arc::new(publisher)).with_broker(broker.clone()));
    let app = relay_router(state);

    let shutdown = ShutdownSignal::new();
    let server_shutdown = shutdown.notified();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("overflow-sync writer relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(server_shutdown)
        .await?;

    match Arc::try_unwrap(broker) {
        Ok(broker) => {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "Failed to close broker connection cleanly");
            }
        }
        Err(_) => warn!("Broker still in use at shutdown, leaving connection to drop"),
    }

    info!("Writer relay stopped");
    Ok(())
}
