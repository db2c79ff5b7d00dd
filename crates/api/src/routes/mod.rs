//! Route table.

pub mod credits;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(webhooks::receive))
        .route("/credits/{subject_id}/balance", get(credits::get_balance))
        .route("/credits/{subject_id}/allocate", post(credits::allocate))
        .route("/credits/{subject_id}/use", post(credits::use_credits))
        .route("/credits/{subject_id}/adjust", post(credits::adjust))
        .route("/credits/{subject_id}/history", get(credits::history))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
