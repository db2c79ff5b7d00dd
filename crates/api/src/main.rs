//! Semo Billing API Server
//!
//! The HTTP boundary for the credit ledger and webhook reconciliation
//! engine: provider webhook intake plus credit operation endpoints.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,semo_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Semo Billing API v{}", env!("CARGO_PKG_VERSION"));

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    // Migrations run on a dedicated direct-connection pool with longer
    // timeouts, then release their connections before serving starts.
    tracing::info!("Running database migrations...");
    let migration_pool = semo_shared::create_migration_pool(&database_url).await?;
    semo_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    tracing::info!("Connecting to database...");
    let pool = semo_shared::create_pool(&database_url).await?;
    tracing::info!("Database connection established");

    let state = AppState::new(pool);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
