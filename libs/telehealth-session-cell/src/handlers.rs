// libs/telehealth-session-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{
    ClientMeta, CreateSessionRequest, RecordConsentRequest, TelehealthError, VerifyIdentityRequest,
};
use crate::services::{PatientAccessService, RealtimeMeetingsClient, SessionLifecycleService};

/// Caller network metadata for consent rows and audit entries. Proxied
/// deployments put the originating address first in x-forwarded-for.
fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    ClientMeta {
        ip_address,
        user_agent,
    }
}

// ==============================================================================
// PATIENT-FACING HANDLERS (unauthenticated, token-gated)
// ==============================================================================

/// Resolve a patient access link into the waiting-room view.
#[axum::debug_handler]
pub async fn resolve_patient_link(
    State(state): State<Arc<AppConfig>>,
    Path(token): Path<String>,
) -> Result<Json<Value>, AppError> {
    let access_service = PatientAccessService::new(&state);

    let view = access_service
        .session_overview(&token)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => {
                AppError::NotFound("Session link not recognized".to_string())
            }
            TelehealthError::Expired => AppError::Gone("Access link has expired".to_string()),
            TelehealthError::SessionClosed { status } => {
                AppError::Gone(format!("Session is already {}", status))
            }
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!(view)))
}

/// Submit the last 4 digits of the identity document.
#[axum::debug_handler]
pub async fn submit_identity(
    State(state): State<Arc<AppConfig>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(request): Json<VerifyIdentityRequest>,
) -> Result<Json<Value>, AppError> {
    let access_service = PatientAccessService::new(&state);
    let meta = client_meta(&headers);

    let verified = access_service
        .verify_identity(&token, &request.document_digits, &meta)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => {
                AppError::NotFound("Session link not recognized".to_string())
            }
            TelehealthError::Expired => AppError::Gone("Access link has expired".to_string()),
            TelehealthError::SessionClosed { status } => {
                AppError::Gone(format!("Session is already {}", status))
            }
            TelehealthError::InvalidInput(message) => AppError::BadRequest(message),
            TelehealthError::Unauthorized => {
                AppError::Auth("Identity digits do not match our records".to_string())
            }
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({ "verified": verified })))
}

/// Record informed consent for the session.
#[axum::debug_handler]
pub async fn submit_consent(
    State(state): State<Arc<AppConfig>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RecordConsentRequest>,
) -> Result<Json<Value>, AppError> {
    let access_service = PatientAccessService::new(&state);
    let meta = client_meta(&headers);

    let outcome = access_service
        .record_consent(&token, request, &meta)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => {
                AppError::NotFound("Session link not recognized".to_string())
            }
            TelehealthError::Expired => AppError::Gone("Access link has expired".to_string()),
            TelehealthError::SessionClosed { status } => {
                AppError::Gone(format!("Session is already {}", status))
            }
            TelehealthError::InvalidInput(message) => AppError::BadRequest(message),
            TelehealthError::Forbidden(message) => AppError::Forbidden(message),
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({
        "accepted": outcome.accepted,
        "already_consented": outcome.already_consented
    })))
}

/// Issue patient meeting credentials once every gate has passed.
#[axum::debug_handler]
pub async fn patient_meeting_credentials(
    State(state): State<Arc<AppConfig>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service =
        SessionLifecycleService::new(&state).map_err(|e| AppError::Internal(e.to_string()))?;
    let meta = client_meta(&headers);

    let (credentials, status) = lifecycle_service
        .patient_join(&token, &meta)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => {
                AppError::NotFound("Session link not recognized".to_string())
            }
            TelehealthError::Expired => AppError::Gone("Access link has expired".to_string()),
            TelehealthError::SessionClosed { status } => {
                AppError::Gone(format!("Session is already {}", status))
            }
            TelehealthError::Forbidden(message) => AppError::Forbidden(message),
            TelehealthError::ProvisioningUnavailable(_) => AppError::ExternalService(
                "Video service temporarily unavailable, please retry".to_string(),
            ),
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({
        "success": true,
        "status": status,
        "meeting": credentials.meeting,
        "attendee": credentials.attendee
    })))
}

/// Health check for the telehealth subsystem.
#[axum::debug_handler]
pub async fn telehealth_health_check(
    State(state): State<Arc<AppConfig>>,
) -> Result<Json<Value>, AppError> {
    if !state.is_meetings_configured() {
        return Ok(Json(json!({
            "status": "not_configured",
            "meetings_configured": false,
            "message": "Meeting provider not configured"
        })));
    }

    let meetings_client =
        RealtimeMeetingsClient::new(&state).map_err(|e| AppError::Internal(e.to_string()))?;

    let provider_healthy = meetings_client.health_check().await.unwrap_or(false);

    Ok(Json(json!({
        "status": if provider_healthy { "healthy" } else { "unhealthy" },
        "meetings_configured": true,
        "provider_status": if provider_healthy { "connected" } else { "error" }
    })))
}

// ==============================================================================
// CLINICIAN-FACING HANDLERS (authenticated)
// ==============================================================================

/// Create the telehealth session for a remotely scheduled appointment.
#[axum::debug_handler]
pub async fn create_session(
    State(state): State<Arc<AppConfig>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service =
        SessionLifecycleService::new(&state).map_err(|e| AppError::Internal(e.to_string()))?;

    let session = lifecycle_service
        .create_for_appointment(request, &user)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => AppError::NotFound("Appointment not found".to_string()),
            TelehealthError::InvalidInput(message) => AppError::BadRequest(message),
            TelehealthError::Forbidden(message) => AppError::Forbidden(message),
            TelehealthError::AlreadyExists => {
                AppError::Conflict("A session already exists for this appointment".to_string())
            }
            _ => AppError::Internal(e.to_string()),
        })?;

    let patient_link = format!("{}/join/{}", state.patient_portal_base_url, session.patient_token);

    Ok(Json(json!({
        "success": true,
        "session_id": session.id,
        "appointment_id": session.appointment_id,
        "status": session.status,
        "patient_link": patient_link,
        "patient_token_expires_at": session.patient_token_expires_at,
        "message": "Telehealth session created"
    })))
}

/// Full session detail for the clinician console.
#[axum::debug_handler]
pub async fn get_session_detail(
    State(state): State<Arc<AppConfig>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service =
        SessionLifecycleService::new(&state).map_err(|e| AppError::Internal(e.to_string()))?;

    let detail = lifecycle_service
        .session_detail(session_id, &user)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => AppError::NotFound("Session not found".to_string()),
            TelehealthError::Forbidden(message) => AppError::Forbidden(message),
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!(detail)))
}

/// Doctor joins the session and receives meeting credentials.
#[axum::debug_handler]
pub async fn doctor_meeting_credentials(
    State(state): State<Arc<AppConfig>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service =
        SessionLifecycleService::new(&state).map_err(|e| AppError::Internal(e.to_string()))?;

    let credentials = lifecycle_service
        .doctor_join(session_id, &user)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => AppError::NotFound("Session not found".to_string()),
            TelehealthError::SessionClosed { status } => {
                AppError::Gone(format!("Session is already {}", status))
            }
            TelehealthError::Forbidden(message) => AppError::Forbidden(message),
            TelehealthError::ProvisioningUnavailable(_) => AppError::ExternalService(
                "Video service temporarily unavailable, please retry".to_string(),
            ),
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({
        "success": true,
        "meeting": credentials.meeting,
        "attendee": credentials.attendee
    })))
}

/// Terminate a session (doctor-initiated only).
#[axum::debug_handler]
pub async fn end_session(
    State(state): State<Arc<AppConfig>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service =
        SessionLifecycleService::new(&state).map_err(|e| AppError::Internal(e.to_string()))?;

    let summary = lifecycle_service
        .terminate(session_id, &user)
        .await
        .map_err(|e| match e {
            TelehealthError::NotFound => AppError::NotFound("Session not found".to_string()),
            TelehealthError::Forbidden(message) => AppError::Forbidden(message),
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({
        "success": true,
        "session_id": summary.session_id,
        "already_finished": summary.already_finished,
        "duration_seconds": summary.duration_seconds,
        "message": "Session terminated"
    })))
}
