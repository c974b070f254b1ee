// libs/telehealth-session-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// TELEHEALTH SESSION DOMAIN MODELS
// ==============================================================================

/// One telehealth session per remotely scheduled appointment. The row is the
/// single source of truth for the access gates and the lifecycle state; no
/// component caches it across requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelehealthSession {
    pub id: Uuid,
    pub appointment_id: Uuid,

    pub status: SessionStatus,

    // Patient access link credential. Unique, high entropy, unusable past
    // the expiry instant regardless of session status.
    pub patient_token: String,
    pub patient_token_expires_at: DateTime<Utc>,

    // One-way flag: set exactly once, never cleared.
    pub identity_verified_at: Option<DateTime<Utc>>,

    // Populated on first successful provisioning call, by either participant.
    pub meeting_id: Option<String>,
    pub meeting_data: Option<MeetingDescriptor>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TelehealthSession {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SessionStatus::Finished | SessionStatus::Cancelled)
    }

    pub fn token_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.patient_token_expires_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Waiting,
    InProgress,
    Finished,
    Cancelled,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Scheduled => write!(f, "scheduled"),
            SessionStatus::Waiting => write!(f, "waiting"),
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Finished => write!(f, "finished"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Doctor,
    Patient,
}

impl ParticipantRole {
    /// External identity handed to the meeting provider. Embeds the role and
    /// the internal id so the provider's identity space cannot collide across
    /// roles or sessions.
    pub fn external_identity(&self, internal_id: Uuid) -> String {
        match self {
            ParticipantRole::Doctor => format!("DOCTOR_{}", internal_id),
            ParticipantRole::Patient => format!("PATIENT_{}", internal_id),
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRole::Doctor => write!(f, "doctor"),
            ParticipantRole::Patient => write!(f, "patient"),
        }
    }
}

/// One row per (session, role). Re-joining updates `join_time` and mints a
/// fresh attendee rather than duplicating the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParticipant {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: ParticipantRole,
    pub attendee_id: Option<String>,
    pub attendee_data: Option<AttendeeDescriptor>,
    pub join_time: Option<DateTime<Utc>>,
    pub leave_time: Option<DateTime<Utc>>,
}

/// Append-only informed-consent record. Duplicates are tolerated upstream but
/// short-circuited before a second row is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConsent {
    pub id: Uuid,
    pub session_id: Uuid,
    pub consent_given: bool,
    pub consent_version: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// AUDIT LOG MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEventType {
    IdentityVerified,
    IdentityFailed,
    ConsentGiven,
    ConsentBlocked,
    PatientJoined,
    DoctorJoined,
    SessionStarted,
    SessionEnded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Doctor,
    Patient,
    System,
}

/// Immutable once written. Logging must never block or fail the operation it
/// documents; write failures are surfaced to operators as warnings only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    pub actor_role: ActorRole,
    pub actor_id: Option<String>,
    pub event_type: SessionEventType,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// APPOINTMENT COLLABORATOR MODELS
// ==============================================================================

/// Read-mostly view of the appointment record store. The engine reads identity
/// and scheduling fields and writes a single status/end-time update on
/// termination; scheduling itself lives elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub clinic_id: Uuid,
    pub clinic_name: String,
    pub doctor_name: String,
    pub doctor_specialty: String,
    pub patient_document: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: String,
    pub modality: AppointmentModality,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentModality {
    Remote,
    InPerson,
}

// ==============================================================================
// MEETING PROVIDER MODELS
// ==============================================================================

/// External meeting resource descriptor, persisted on the session row once
/// provisioning succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingDescriptor {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
    #[serde(rename = "mediaRegion", skip_serializing_if = "Option::is_none")]
    pub media_region: Option<String>,
    #[serde(rename = "joinUrl", skip_serializing_if = "Option::is_none")]
    pub join_url: Option<String>,
}

/// Per-participant meeting credential minted by the provider. The join token
/// is a secret: it is returned to the joining participant only and never
/// included in clinician-facing read responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendeeDescriptor {
    #[serde(rename = "attendeeId")]
    pub attendee_id: String,
    #[serde(rename = "externalUserId")]
    pub external_user_id: String,
    #[serde(rename = "joinToken")]
    pub join_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateMeetingRequest {
    #[serde(rename = "clientRequestToken")]
    pub client_request_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMeetingResponse {
    #[serde(rename = "meetingId")]
    pub meeting_id: Option<String>,
    #[serde(rename = "mediaRegion")]
    pub media_region: Option<String>,
    #[serde(rename = "joinUrl")]
    pub join_url: Option<String>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAttendeeRequest {
    #[serde(rename = "externalUserId")]
    pub external_user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAttendeeResponse {
    #[serde(rename = "attendeeId")]
    pub attendee_id: Option<String>,
    #[serde(rename = "externalUserId")]
    pub external_user_id: Option<String>,
    #[serde(rename = "joinToken")]
    pub join_token: Option<String>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
}

// ==============================================================================
// API REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub appointment_id: Uuid,
}

/// What an unauthenticated patient is allowed to see about their session.
/// Never echoes the token nor internal identifiers beyond what the waiting
/// room UI needs.
#[derive(Debug, Clone, Serialize)]
pub struct PatientSessionView {
    pub doctor_name: String,
    pub doctor_specialty: String,
    pub clinic_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub identity_verified: bool,
    pub consent_recorded: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyIdentityRequest {
    pub document_digits: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordConsentRequest {
    #[serde(default)]
    pub consent_given: bool,
    pub consent_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsentOutcome {
    pub accepted: bool,
    pub already_consented: bool,
}

/// Meeting + attendee descriptors handed to a participant once every gate on
/// their side has passed.
#[derive(Debug, Clone, Serialize)]
pub struct MeetingCredentials {
    pub meeting: MeetingDescriptor,
    pub attendee: AttendeeDescriptor,
}

/// Participant as exposed on the clinician-facing detail endpoint: the
/// attendee join secret is stripped.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantView {
    pub role: ParticipantRole,
    pub attendee_id: Option<String>,
    pub join_time: Option<DateTime<Utc>>,
    pub leave_time: Option<DateTime<Utc>>,
}

impl From<SessionParticipant> for ParticipantView {
    fn from(p: SessionParticipant) -> Self {
        Self {
            role: p.role,
            attendee_id: p.attendee_id,
            join_time: p.join_time,
            leave_time: p.leave_time,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetailResponse {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub status: SessionStatus,
    pub meeting_id: Option<String>,
    pub identity_verified_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<ParticipantView>,
    pub consent: Option<SessionConsent>,
    pub events: Vec<SessionEvent>,
    // Reconstructed server-side for display in the clinician console; not a
    // credential handed to third parties.
    pub patient_link: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminationSummary {
    pub session_id: Uuid,
    pub already_finished: bool,
    pub duration_seconds: i64,
}

/// Caller network metadata captured for consent rows and audit entries.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

// ==============================================================================
// ERROR HANDLING
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TelehealthError {
    #[error("Session not found")]
    NotFound,

    #[error("Patient access link has expired")]
    Expired,

    #[error("Session is no longer joinable: {status}")]
    SessionClosed { status: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Identity verification failed")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("A session already exists for this appointment")]
    AlreadyExists,

    #[error("Meeting provider unavailable: {0}")]
    ProvisioningUnavailable(String),

    #[error("Meeting provider not configured")]
    NotConfigured,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<reqwest::Error> for TelehealthError {
    fn from(err: reqwest::Error) -> Self {
        TelehealthError::ProvisioningUnavailable(err.to_string())
    }
}

impl From<anyhow::Error> for TelehealthError {
    fn from(err: anyhow::Error) -> Self {
        TelehealthError::Database(err.to_string())
    }
}
