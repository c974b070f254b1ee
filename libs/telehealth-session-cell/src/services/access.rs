// libs/telehealth-session-cell/src/services/access.rs
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{
    ActorRole, ClientMeta, ConsentOutcome, PatientSessionView, RecordConsentRequest,
    SessionConsent, SessionEventType, TelehealthSession, TelehealthError,
};
use crate::services::appointments::AppointmentStore;
use crate::services::audit::SessionAuditService;

/// The patient-side security gate: token validation, identity verification
/// and consent recording, enforced in that order on every request.
///
/// Nothing here trusts client-supplied state; each call re-checks its
/// preconditions against the persisted session row.
pub struct PatientAccessService {
    supabase: Arc<SupabaseClient>,
    appointments: AppointmentStore,
    audit: SessionAuditService,
}

impl PatientAccessService {
    pub fn new(config: &AppConfig) -> Self {
        let supabase = Arc::new(SupabaseClient::new(config));
        Self {
            appointments: AppointmentStore::new(supabase.clone()),
            audit: SessionAuditService::new(supabase.clone()),
            supabase,
        }
    }

    // ==========================================================================
    // TOKEN VALIDATION
    // ==========================================================================

    /// Resolve the session behind a patient access token, or fail with the
    /// first violated check. Read-only; the single choke point for every
    /// unauthenticated endpoint.
    pub async fn resolve_session(&self, token: &str) -> Result<TelehealthSession, TelehealthError> {
        // Tokens are generated alphanumeric; anything else can't exist.
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TelehealthError::NotFound);
        }

        let query = format!("/rest/v1/telehealth_sessions?patient_token=eq.{}", token);
        let rows: Vec<TelehealthSession> = self
            .supabase
            .select(&query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        let session = rows.into_iter().next().ok_or(TelehealthError::NotFound)?;

        if session.token_expired_at(Utc::now()) {
            debug!("Rejected expired patient token for session {}", session.id);
            return Err(TelehealthError::Expired);
        }

        if session.is_terminal() {
            debug!(
                "Rejected patient token for {} session {}",
                session.status, session.id
            );
            return Err(TelehealthError::SessionClosed {
                status: session.status.to_string(),
            });
        }

        Ok(session)
    }

    /// What the patient waiting room is allowed to display.
    pub async fn session_overview(
        &self,
        token: &str,
    ) -> Result<PatientSessionView, TelehealthError> {
        let session = self.resolve_session(token).await?;
        let appointment = self.appointments.get(session.appointment_id).await?;
        let consent = self.find_active_consent(session.id).await?;

        Ok(PatientSessionView {
            doctor_name: appointment.doctor_name,
            doctor_specialty: appointment.doctor_specialty,
            clinic_name: appointment.clinic_name,
            scheduled_at: appointment.scheduled_at,
            status: session.status,
            identity_verified: session.identity_verified_at.is_some(),
            consent_recorded: consent.is_some(),
        })
    }

    // ==========================================================================
    // IDENTITY VERIFICATION GATE
    // ==========================================================================

    /// Check the supplied digits against the last 4 digits of the
    /// appointment's identity document. One-way: once verified, subsequent
    /// calls succeed without re-checking, so a reloaded page cannot be used
    /// as a re-verification oracle.
    pub async fn verify_identity(
        &self,
        token: &str,
        supplied_digits: &str,
        meta: &ClientMeta,
    ) -> Result<bool, TelehealthError> {
        // Malformed input is rejected before any session lookup and is not
        // logged as a failed verification attempt.
        if supplied_digits.len() != 4 || !supplied_digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(TelehealthError::InvalidInput(
                "Identity check requires exactly 4 digits".to_string(),
            ));
        }

        let session = self.resolve_session(token).await?;

        if session.identity_verified_at.is_some() {
            debug!("Identity already verified for session {}", session.id);
            return Ok(true);
        }

        let appointment = self.appointments.get(session.appointment_id).await.map_err(|e| {
            match e {
                // A session without its appointment is a data fault, not a
                // patient-visible miss.
                TelehealthError::NotFound => {
                    TelehealthError::Database("Appointment missing for session".to_string())
                }
                other => other,
            }
        })?;

        let expected = last_four_digits(&appointment.patient_document);

        if expected.as_deref() != Some(supplied_digits) {
            self.audit
                .record(
                    session.id,
                    ActorRole::Patient,
                    Some(&appointment.patient_id.to_string()),
                    SessionEventType::IdentityFailed,
                    json!({
                        "method": "document_last_digits",
                        "ip_address": meta.ip_address,
                    }),
                )
                .await;
            return Err(TelehealthError::Unauthorized);
        }

        let now = Utc::now();
        let query = format!(
            "/rest/v1/telehealth_sessions?id=eq.{}&identity_verified_at=is.null",
            session.id
        );
        let changes = json!({
            "identity_verified_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let updated: Vec<TelehealthSession> = self
            .supabase
            .update_where(&query, changes, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        if updated.is_empty() {
            // A concurrent submission won the conditional write; the flag is
            // one-way, so this call still counts as verified.
            debug!("Identity concurrently verified for session {}", session.id);
            return Ok(true);
        }

        info!("Identity verified for session {}", session.id);

        self.audit
            .record(
                session.id,
                ActorRole::Patient,
                Some(&appointment.patient_id.to_string()),
                SessionEventType::IdentityVerified,
                json!({
                    "method": "document_last_digits",
                    "ip_address": meta.ip_address,
                }),
            )
            .await;

        Ok(true)
    }

    // ==========================================================================
    // CONSENT RECORDER
    // ==========================================================================

    /// Record the informed-consent fact for this session. Idempotent: a
    /// retried request or reloaded page short-circuits instead of erroring
    /// or duplicating the row.
    pub async fn record_consent(
        &self,
        token: &str,
        request: RecordConsentRequest,
        meta: &ClientMeta,
    ) -> Result<ConsentOutcome, TelehealthError> {
        // There is no decline-and-continue path.
        if !request.consent_given {
            return Err(TelehealthError::InvalidInput(
                "Consent must be affirmatively given".to_string(),
            ));
        }

        let session = self.resolve_session(token).await?;

        if session.identity_verified_at.is_none() {
            self.audit
                .record(
                    session.id,
                    ActorRole::Patient,
                    None,
                    SessionEventType::ConsentBlocked,
                    json!({
                        "reason": "identity_not_verified",
                        "ip_address": meta.ip_address,
                    }),
                )
                .await;
            return Err(TelehealthError::Forbidden(
                "Identity verification is required before consent".to_string(),
            ));
        }

        if self.find_active_consent(session.id).await?.is_some() {
            debug!("Consent already recorded for session {}", session.id);
            return Ok(ConsentOutcome {
                accepted: true,
                already_consented: true,
            });
        }

        let consent_version = request.consent_version.unwrap_or_else(|| "1.0".to_string());
        let row = json!({
            "id": Uuid::new_v4(),
            "session_id": session.id,
            "consent_given": true,
            "consent_version": consent_version,
            "ip_address": meta.ip_address,
            "user_agent": meta.user_agent,
            "created_at": Utc::now().to_rfc3339(),
        });

        let consent: SessionConsent = self
            .supabase
            .insert("/rest/v1/session_consents", row, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        info!("Consent {} recorded for session {}", consent.id, session.id);

        self.audit
            .record(
                session.id,
                ActorRole::Patient,
                None,
                SessionEventType::ConsentGiven,
                json!({
                    "consent_version": consent.consent_version,
                    "ip_address": meta.ip_address,
                }),
            )
            .await;

        Ok(ConsentOutcome {
            accepted: true,
            already_consented: false,
        })
    }

    /// The earliest active consent row, if any. One active row is sufficient
    /// for every downstream gate.
    pub async fn find_active_consent(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SessionConsent>, TelehealthError> {
        let query = format!(
            "/rest/v1/session_consents?session_id=eq.{}&consent_given=eq.true&order=created_at.asc",
            session_id
        );
        let rows: Vec<SessionConsent> = self
            .supabase
            .select(&query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        Ok(rows.into_iter().next())
    }
}

/// Normalize an identity document to digits and take the last four.
/// Documents arrive formatted ("123.456.789-01") or plain; only the digits
/// participate in the comparison.
pub fn last_four_digits(document: &str) -> Option<String> {
    let digits: Vec<char> = document.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].iter().collect())
}
