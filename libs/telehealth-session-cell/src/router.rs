// libs/telehealth-session-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::*;

/// Creates the telehealth session routes.
///
/// The patient surface is public at the HTTP layer; every handler behind it
/// runs the token validator before anything else, so the access token in the
/// path is the sole credential.
pub fn telehealth_session_routes(state: Arc<AppConfig>) -> Router {
    // Patient-facing routes (token-gated, no bearer auth)
    let patient_routes = Router::new()
        .route("/health", get(telehealth_health_check))
        .route("/join/{token}", get(resolve_patient_link))
        .route("/join/{token}/identity", post(submit_identity))
        .route("/join/{token}/consent", post(submit_consent))
        .route("/join/{token}/meeting", post(patient_meeting_credentials));

    // Clinician-facing routes (authentication required)
    let clinician_routes = Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", get(get_session_detail))
        .route("/sessions/{session_id}/meeting", post(doctor_meeting_credentials))
        .route("/sessions/{session_id}/end", delete(end_session))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(patient_routes)
        .merge(clinician_routes)
        .with_state(state)
}
