pub mod health;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::experiments::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Operator API
        .route(
            "/api/v1/experiments",
            get(handlers::handle_list_experiments).post(handlers::handle_create_experiment),
        )
        .route(
            "/api/v1/experiments/:id",
            get(handlers::handle_get_experiment).delete(handlers::handle_delete_experiment),
        )
        .route(
            "/api/v1/experiments/:id/status",
            patch(handlers::handle_update_status),
        )
        .route(
            "/api/v1/experiments/:id/results",
            get(handlers::handle_get_results).post(handlers::handle_refresh_results),
        )
        // Visitor API (called by the routing layer)
        .route("/api/v1/assign/:key", post(handlers::handle_assign))
        .route("/api/v1/convert/:key", post(handlers::handle_convert))
        // Scheduled jobs
        .route(
            "/api/v1/cron/refresh-results",
            post(handlers::handle_cron_refresh),
        )
        .with_state(state)
}
