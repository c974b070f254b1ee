// libs/telehealth-session-cell/src/services/lifecycle.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::auth::User;

use crate::models::{
    ActorRole, AppointmentModality, Appointment, AttendeeDescriptor, ClientMeta,
    CreateSessionRequest, MeetingCredentials, ParticipantRole, ParticipantView,
    SessionDetailResponse, SessionEventType, SessionParticipant, SessionStatus, TelehealthSession,
    TelehealthError, TerminationSummary,
};
use crate::services::access::PatientAccessService;
use crate::services::appointments::AppointmentStore;
use crate::services::audit::SessionAuditService;
use crate::services::meeting::MeetingProvisioningService;

const PATIENT_TOKEN_LEN: usize = 48;

/// Owner of the session state machine.
///
/// States: scheduled -> waiting -> in_progress -> finished, with cancelled
/// reachable from any non-terminal state. Transitions are persisted through
/// conditional writes so concurrent requests against the same session row
/// converge instead of clobbering each other.
pub struct SessionLifecycleService {
    supabase: Arc<SupabaseClient>,
    access: PatientAccessService,
    appointments: AppointmentStore,
    audit: SessionAuditService,
    meetings: MeetingProvisioningService,
    portal_base_url: String,
    patient_link_ttl_hours: i64,
}

impl SessionLifecycleService {
    pub fn new(config: &AppConfig) -> Result<Self, TelehealthError> {
        let supabase = Arc::new(SupabaseClient::new(config));
        Ok(Self {
            access: PatientAccessService::new(config),
            appointments: AppointmentStore::new(supabase.clone()),
            audit: SessionAuditService::new(supabase.clone()),
            meetings: MeetingProvisioningService::new(config)?,
            portal_base_url: config.patient_portal_base_url.clone(),
            patient_link_ttl_hours: config.patient_link_ttl_hours,
            supabase,
        })
    }

    // ==========================================================================
    // SESSION CREATION
    // ==========================================================================

    /// Create the session for a remotely scheduled appointment, minting the
    /// patient access token. One session per appointment.
    pub async fn create_for_appointment(
        &self,
        request: CreateSessionRequest,
        user: &User,
    ) -> Result<TelehealthSession, TelehealthError> {
        let appointment = self.appointments.get(request.appointment_id).await?;

        if appointment.modality != AppointmentModality::Remote {
            return Err(TelehealthError::InvalidInput(
                "Appointment is not scheduled for remote care".to_string(),
            ));
        }

        self.verify_doctor_access(&appointment, user)?;

        let existing_query = format!(
            "/rest/v1/telehealth_sessions?appointment_id=eq.{}",
            appointment.id
        );
        let existing: Vec<TelehealthSession> = self
            .supabase
            .select(&existing_query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        if !existing.is_empty() {
            return Err(TelehealthError::AlreadyExists);
        }

        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let patient_token = generate_patient_token();
        let expires_at = appointment.scheduled_at + Duration::hours(self.patient_link_ttl_hours);

        let row = json!({
            "id": session_id,
            "appointment_id": appointment.id,
            "status": SessionStatus::Scheduled,
            "patient_token": patient_token,
            "patient_token_expires_at": expires_at.to_rfc3339(),
            "identity_verified_at": null,
            "meeting_id": null,
            "meeting_data": null,
            "started_at": null,
            "finished_at": null,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let session: TelehealthSession = self
            .supabase
            .insert("/rest/v1/telehealth_sessions", row, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        // One participant row per role, filled in at join time.
        for role in [ParticipantRole::Doctor, ParticipantRole::Patient] {
            let participant = json!({
                "id": Uuid::new_v4(),
                "session_id": session_id,
                "role": role,
                "attendee_id": null,
                "attendee_data": null,
                "join_time": null,
                "leave_time": null,
            });
            let _: SessionParticipant = self
                .supabase
                .insert("/rest/v1/session_participants", participant, None)
                .await
                .map_err(|e| TelehealthError::Database(e.to_string()))?;
        }

        info!(
            "Created telehealth session {} for appointment {}",
            session.id, appointment.id
        );

        Ok(session)
    }

    // ==========================================================================
    // JOIN TRANSITIONS
    // ==========================================================================

    /// Patient-side meeting credential issuance. The final gate of the
    /// patient chain: token -> identity -> consent -> meeting. Consent is
    /// re-checked here; a client cannot skip steps by calling endpoints out
    /// of order.
    pub async fn patient_join(
        &self,
        token: &str,
        meta: &ClientMeta,
    ) -> Result<(MeetingCredentials, SessionStatus), TelehealthError> {
        let session = self.access.resolve_session(token).await?;

        if self.access.find_active_consent(session.id).await?.is_none() {
            return Err(TelehealthError::Forbidden(
                "Informed consent is required before joining".to_string(),
            ));
        }

        let appointment = self.appointments.get(session.appointment_id).await?;

        let meeting = self.meetings.ensure_meeting(&session).await?;
        let attendee = self
            .meetings
            .create_attendee(&meeting.meeting_id, ParticipantRole::Patient, appointment.patient_id)
            .await?;

        self.record_join(session.id, ParticipantRole::Patient, &attendee).await?;

        let mut status = session.status;
        if session.status == SessionStatus::Scheduled {
            let query = format!(
                "/rest/v1/telehealth_sessions?id=eq.{}&status=eq.scheduled",
                session.id
            );
            let changes = json!({
                "status": SessionStatus::Waiting,
                "updated_at": Utc::now().to_rfc3339(),
            });
            let updated: Vec<TelehealthSession> = self
                .supabase
                .update_where(&query, changes, None)
                .await
                .map_err(|e| TelehealthError::Database(e.to_string()))?;

            // Empty means the session already moved past scheduled; waiting
            // is the floor either way.
            status = updated
                .into_iter()
                .next()
                .map(|s| s.status)
                .unwrap_or(SessionStatus::Waiting);
        }

        self.audit
            .record(
                session.id,
                ActorRole::Patient,
                Some(&appointment.patient_id.to_string()),
                SessionEventType::PatientJoined,
                json!({ "ip_address": meta.ip_address }),
            )
            .await;

        Ok((MeetingCredentials { meeting, attendee }, status))
    }

    /// Doctor-side join: provisions the meeting if needed and marks the
    /// clinical encounter as begun. No token gate; ordinary session auth.
    pub async fn doctor_join(
        &self,
        session_id: Uuid,
        user: &User,
    ) -> Result<MeetingCredentials, TelehealthError> {
        let session = self.get_session(session_id).await?;
        let appointment = self.appointments.get(session.appointment_id).await?;
        self.verify_doctor_access(&appointment, user)?;

        if session.is_terminal() {
            return Err(TelehealthError::SessionClosed {
                status: session.status.to_string(),
            });
        }

        let meeting = self.meetings.ensure_meeting(&session).await?;
        let attendee = self
            .meetings
            .create_attendee(&meeting.meeting_id, ParticipantRole::Doctor, appointment.doctor_id)
            .await?;

        self.record_join(session.id, ParticipantRole::Doctor, &attendee).await?;

        let now = Utc::now();
        let mut transitioned = false;
        if session.status != SessionStatus::InProgress {
            let query = format!(
                "/rest/v1/telehealth_sessions?id=eq.{}&status=in.(scheduled,waiting)",
                session.id
            );
            let mut changes = json!({
                "status": SessionStatus::InProgress,
                "updated_at": now.to_rfc3339(),
            });
            if session.started_at.is_none() {
                changes["started_at"] = json!(now.to_rfc3339());
            }
            let updated: Vec<TelehealthSession> = self
                .supabase
                .update_where(&query, changes, None)
                .await
                .map_err(|e| TelehealthError::Database(e.to_string()))?;
            transitioned = !updated.is_empty();
        }

        self.audit
            .record(
                session.id,
                ActorRole::Doctor,
                Some(&appointment.doctor_id.to_string()),
                SessionEventType::DoctorJoined,
                json!({}),
            )
            .await;

        if transitioned {
            self.audit
                .record(
                    session.id,
                    ActorRole::Doctor,
                    Some(&appointment.doctor_id.to_string()),
                    SessionEventType::SessionStarted,
                    json!({ "started_at": now.to_rfc3339() }),
                )
                .await;
        }

        Ok(MeetingCredentials { meeting, attendee })
    }

    // ==========================================================================
    // TERMINATION
    // ==========================================================================

    /// Doctor-initiated termination. Idempotent on terminal sessions; each
    /// cleanup step is independently fault-tolerant.
    pub async fn terminate(
        &self,
        session_id: Uuid,
        user: &User,
    ) -> Result<TerminationSummary, TelehealthError> {
        let session = self.get_session(session_id).await?;
        let appointment = self.appointments.get(session.appointment_id).await?;
        self.verify_doctor_access(&appointment, user)?;

        if session.is_terminal() {
            debug!("Session {} already {}", session.id, session.status);
            return Ok(TerminationSummary {
                session_id: session.id,
                already_finished: true,
                duration_seconds: stored_duration_seconds(&session),
            });
        }

        // The external resource may have expired naturally; a failed release
        // never aborts termination.
        if let Some(meeting_id) = &session.meeting_id {
            if let Err(e) = self.meetings.release_meeting(meeting_id).await {
                warn!("Failed to release meeting {}: {}", meeting_id, e);
            }
        }

        let now = Utc::now();
        let duration_seconds = session
            .started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0);

        let query = format!(
            "/rest/v1/telehealth_sessions?id=eq.{}&status=in.(scheduled,waiting,in_progress)",
            session.id
        );
        let changes = json!({
            "status": SessionStatus::Finished,
            "finished_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });
        let updated: Vec<TelehealthSession> = self
            .supabase
            .update_where(&query, changes, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        if updated.is_empty() {
            // Concurrent termination landed first; nothing left to do.
            debug!("Session {} concurrently terminated", session.id);
            return Ok(TerminationSummary {
                session_id: session.id,
                already_finished: true,
                duration_seconds,
            });
        }

        self.set_leave_time(session.id, ParticipantRole::Doctor, now).await?;
        self.appointments.mark_completed(appointment.id, now).await?;

        self.audit
            .record(
                session.id,
                ActorRole::Doctor,
                Some(&appointment.doctor_id.to_string()),
                SessionEventType::SessionEnded,
                json!({ "duration_seconds": duration_seconds }),
            )
            .await;

        info!(
            "Session {} finished after {}s",
            session.id, duration_seconds
        );

        Ok(TerminationSummary {
            session_id: session.id,
            already_finished: false,
            duration_seconds,
        })
    }

    // ==========================================================================
    // CLINICIAN READ SIDE
    // ==========================================================================

    /// Full session detail for the clinician console: participants (join
    /// secrets stripped), consent record, audit trail in creation order, and
    /// the reconstructed patient link.
    pub async fn session_detail(
        &self,
        session_id: Uuid,
        user: &User,
    ) -> Result<SessionDetailResponse, TelehealthError> {
        let session = self.get_session(session_id).await?;
        let appointment = self.appointments.get(session.appointment_id).await?;
        self.verify_doctor_access(&appointment, user)?;

        let participants_query = format!(
            "/rest/v1/session_participants?session_id=eq.{}&order=role.asc",
            session.id
        );
        let participants: Vec<SessionParticipant> = self
            .supabase
            .select(&participants_query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        let consent = self.access.find_active_consent(session.id).await?;
        let events = self.audit.list_for_session(session.id).await?;

        let patient_link = format!("{}/join/{}", self.portal_base_url, session.patient_token);

        Ok(SessionDetailResponse {
            id: session.id,
            appointment_id: session.appointment_id,
            status: session.status,
            meeting_id: session.meeting_id,
            identity_verified_at: session.identity_verified_at,
            started_at: session.started_at,
            finished_at: session.finished_at,
            created_at: session.created_at,
            participants: participants.into_iter().map(ParticipantView::from).collect(),
            consent,
            events,
            patient_link,
        })
    }

    pub async fn provider_healthy(&self) -> bool {
        self.meetings.provider_healthy().await
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    async fn get_session(&self, session_id: Uuid) -> Result<TelehealthSession, TelehealthError> {
        let query = format!("/rest/v1/telehealth_sessions?id=eq.{}", session_id);
        let rows: Vec<TelehealthSession> = self
            .supabase
            .select(&query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        rows.into_iter().next().ok_or(TelehealthError::NotFound)
    }

    fn verify_doctor_access(
        &self,
        appointment: &Appointment,
        user: &User,
    ) -> Result<(), TelehealthError> {
        if user.is_admin() {
            return Ok(());
        }

        let user_id = Uuid::parse_str(&user.id).map_err(|_| {
            TelehealthError::Forbidden("Caller identity is not a clinician".to_string())
        })?;

        if appointment.doctor_id != user_id {
            return Err(TelehealthError::Forbidden(
                "Session belongs to a different clinician".to_string(),
            ));
        }

        Ok(())
    }

    /// Re-joining updates the existing (session, role) row; the row is only
    /// created here for sessions predating placeholder rows.
    async fn record_join(
        &self,
        session_id: Uuid,
        role: ParticipantRole,
        attendee: &AttendeeDescriptor,
    ) -> Result<(), TelehealthError> {
        let now = Utc::now();
        let query = format!(
            "/rest/v1/session_participants?session_id=eq.{}&role=eq.{}",
            session_id, role
        );
        let changes = json!({
            "attendee_id": attendee.attendee_id,
            "attendee_data": attendee,
            "join_time": now.to_rfc3339(),
        });

        let updated: Vec<SessionParticipant> = self
            .supabase
            .update_where(&query, changes, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        if updated.is_empty() {
            let row = json!({
                "id": Uuid::new_v4(),
                "session_id": session_id,
                "role": role,
                "attendee_id": attendee.attendee_id,
                "attendee_data": attendee,
                "join_time": now.to_rfc3339(),
                "leave_time": null,
            });
            let _: SessionParticipant = self
                .supabase
                .insert("/rest/v1/session_participants", row, None)
                .await
                .map_err(|e| TelehealthError::Database(e.to_string()))?;
        }

        Ok(())
    }

    async fn set_leave_time(
        &self,
        session_id: Uuid,
        role: ParticipantRole,
        at: DateTime<Utc>,
    ) -> Result<(), TelehealthError> {
        let query = format!(
            "/rest/v1/session_participants?session_id=eq.{}&role=eq.{}",
            session_id, role
        );
        let changes = json!({ "leave_time": at.to_rfc3339() });

        let _updated: Vec<SessionParticipant> = self
            .supabase
            .update_where(&query, changes, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        Ok(())
    }
}

fn stored_duration_seconds(session: &TelehealthSession) -> i64 {
    match (session.started_at, session.finished_at) {
        (Some(started), Some(finished)) => (finished - started).num_seconds().max(0),
        _ => 0,
    }
}

fn generate_patient_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PATIENT_TOKEN_LEN)
        .map(char::from)
        .collect()
}
