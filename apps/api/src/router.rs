use std::sync::Arc;

use axum::{routing::get, Router};

use shared_config::AppConfig;
use telehealth_session_cell::router::telehealth_session_routes;

pub fn create_router(state: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/", get(|| async { "Telecare API is running!" }))
        .nest("/telehealth", telehealth_session_routes(state.clone()))
}
