// libs/telehealth-session-cell/src/services/meeting.rs
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{
    AttendeeDescriptor, MeetingDescriptor, ParticipantRole, TelehealthSession, TelehealthError,
};
use crate::services::provider::RealtimeMeetingsClient;

/// Idempotent create-or-fetch of the external meeting resource, plus
/// per-participant attendee credentials.
///
/// Multiple stateless service instances can run this concurrently for the
/// same session (doctor console open while the patient page polls), so the
/// persisted `meeting_id` is claimed through a conditional write instead of
/// any in-process lock.
pub struct MeetingProvisioningService {
    supabase: Arc<SupabaseClient>,
    provider: RealtimeMeetingsClient,
}

impl MeetingProvisioningService {
    pub fn new(config: &AppConfig) -> Result<Self, TelehealthError> {
        Ok(Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            provider: RealtimeMeetingsClient::new(config)?,
        })
    }

    /// Return the session's meeting descriptor, provisioning it on first use.
    ///
    /// Loser of a concurrent provisioning race releases its redundant meeting
    /// (best effort) and converges on the winner's descriptor.
    pub async fn ensure_meeting(
        &self,
        session: &TelehealthSession,
    ) -> Result<MeetingDescriptor, TelehealthError> {
        if let Some(descriptor) = &session.meeting_data {
            debug!(
                "Meeting {} already provisioned for session {}",
                descriptor.meeting_id, session.id
            );
            return Ok(descriptor.clone());
        }

        // Correlate provisioning with the session so provider-side retries
        // de-duplicate.
        let descriptor = self.provider.create_meeting(&session.id.to_string()).await?;

        let now = Utc::now();
        let query = format!(
            "/rest/v1/telehealth_sessions?id=eq.{}&meeting_id=is.null",
            session.id
        );
        let changes = json!({
            "meeting_id": descriptor.meeting_id,
            "meeting_data": descriptor,
            "updated_at": now.to_rfc3339(),
        });

        let updated: Vec<TelehealthSession> = self
            .supabase
            .update_where(&query, changes, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        if !updated.is_empty() {
            info!(
                "Provisioned meeting {} for session {}",
                descriptor.meeting_id, session.id
            );
            return Ok(descriptor);
        }

        // Lost the race: another participant claimed the column first. Drop
        // the redundant meeting and adopt the winner's descriptor.
        warn!(
            "Concurrent provisioning detected for session {}, discarding meeting {}",
            session.id, descriptor.meeting_id
        );
        if let Err(e) = self.provider.delete_meeting(&descriptor.meeting_id).await {
            warn!(
                "Failed to release redundant meeting {}: {}",
                descriptor.meeting_id, e
            );
        }

        let current = self.fetch_session(session.id).await?;
        current
            .meeting_data
            .ok_or_else(|| TelehealthError::Database(
                "Session lost provisioning race but holds no meeting descriptor".to_string(),
            ))
    }

    /// Mint a fresh attendee credential for one (session, role) join attempt.
    pub async fn create_attendee(
        &self,
        meeting_id: &str,
        role: ParticipantRole,
        internal_id: Uuid,
    ) -> Result<AttendeeDescriptor, TelehealthError> {
        let external_identity = role.external_identity(internal_id);
        self.provider.create_attendee(meeting_id, &external_identity).await
    }

    /// Best-effort release of the external meeting resource. The caller
    /// decides whether a failure matters; termination does not abort on it.
    pub async fn release_meeting(&self, meeting_id: &str) -> Result<(), TelehealthError> {
        self.provider.delete_meeting(meeting_id).await
    }

    pub async fn provider_healthy(&self) -> bool {
        self.provider.health_check().await.unwrap_or(false)
    }

    async fn fetch_session(&self, session_id: Uuid) -> Result<TelehealthSession, TelehealthError> {
        let query = format!("/rest/v1/telehealth_sessions?id=eq.{}", session_id);
        let rows: Vec<TelehealthSession> = self
            .supabase
            .select(&query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        rows.into_iter().next().ok_or(TelehealthError::NotFound)
    }
}
