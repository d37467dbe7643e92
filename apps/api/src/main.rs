use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use appointment_cell::services::clock::SystemClock;
use appointment_cell::services::notification::{
    LoggingNotificationSender, NotificationDispatcher, NotificationOutbox,
};
use appointment_cell::services::sweeper::ExpirySweeper;
use appointment_cell::{
    AppointmentBookingService, AppointmentCellState, InMemoryStore, SchedulingStores, SupabaseStore,
};
use shared_config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Barbershop API server");

    let config = Arc::new(AppConfig::from_env());

    let stores = if config.is_configured() {
        SchedulingStores::from_backend(Arc::new(SupabaseStore::new(&config)))
    } else {
        warn!("Supabase is not configured, appointments are kept in memory only");
        SchedulingStores::from_backend(Arc::new(InMemoryStore::new()))
    };

    let (outbox, notifications) = NotificationOutbox::channel();
    let dispatcher = NotificationDispatcher::new(
        notifications,
        Arc::new(LoggingNotificationSender),
        config.notification_max_attempts,
    )
    .spawn();

    let booking = Arc::new(
        AppointmentBookingService::new(stores, Arc::new(SystemClock)).with_outbox(outbox),
    );

    let (sweeper, sweeper_shutdown) = ExpirySweeper::new(
        Arc::clone(&booking),
        Duration::from_secs(config.sweep_interval_minutes.max(1) * 60),
    );
    let sweeper = sweeper.spawn();

    let state = AppointmentCellState {
        config: Arc::clone(&config),
        booking,
    };

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper_shutdown.trigger();
    if let Err(e) = sweeper.await {
        warn!("Expiry sweeper ended abnormally: {}", e);
    }

    // The router owned the last outbox handle, so the dispatcher drains and exits.
    match tokio::time::timeout(Duration::from_secs(10), dispatcher).await {
        Ok(Err(e)) => warn!("Notification dispatcher ended abnormally: {}", e),
        Err(_) => warn!("Notification dispatcher did not drain in time"),
        Ok(Ok(())) => {}
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
