//! BarterWave Offer Server
//!
//! HTTP front for the offer and trade lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use barterwave_server::services::notify::TracingNotifier;
use barterwave_server::services::offers::{LifecyclePolicy, OfferService};
use barterwave_server::services::store::MemoryStore;
use barterwave_server::services::sweeper;
use barterwave_server::{create_router, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "barterwave_server=debug,notifications=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    tracing::info!("Starting BarterWave offer server");
    tracing::info!(
        timer_minutes = config.default_timer_minutes,
        max_extensions = config.max_timer_extensions,
        max_pin_attempts = config.max_pin_attempts,
        sweep_secs = config.sweep_interval_secs,
        "Lifecycle policy loaded"
    );

    let offers = OfferService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(TracingNotifier),
        LifecyclePolicy::from(&config),
    );
    let state = AppState::new(offers);

    sweeper::spawn(
        Arc::clone(&state.offers),
        Duration::from_secs(config.sweep_interval_secs),
    );

    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
