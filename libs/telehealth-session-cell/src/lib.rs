// libs/telehealth-session-cell/src/lib.rs
//! # Telehealth Session Cell
//!
//! Access control and lifecycle management for remote clinical encounters.
//! An unauthenticated patient is granted time-boxed, identity-verified,
//! consent-gated access to a live video session tied to a scheduled
//! appointment; the session moves through a bounded state machine while every
//! security-relevant decision is recorded in an append-only event log.
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------+
//! |                   Telehealth Session Cell                  |
//! +------------------------------------------------------------+
//! |  handlers.rs     |  HTTP endpoint handlers                 |
//! |  router.rs       |  Route definitions                      |
//! |  models.rs       |  Data structures & DTOs                 |
//! |  services/       |  Business logic layer                   |
//! |    access.rs     |  Token validator, identity gate,        |
//! |                  |  consent recorder                       |
//! |    meeting.rs    |  Idempotent meeting provisioning        |
//! |    provider.rs   |  Realtime meetings API client           |
//! |    lifecycle.rs  |  Session state machine                  |
//! |    audit.rs      |  Append-only session event log          |
//! |    appointments.rs| Appointment store collaborator         |
//! +------------------------------------------------------------+
//! ```
//!
//! ## Patient access chain
//!
//! Every patient-facing request re-runs the gates in order: access token
//! (existence, expiry, session state) -> identity verification (last 4
//! digits of the identity document, one-way flag) -> informed consent
//! (append-only, idempotent) -> meeting credential issuance. Endpoints
//! cannot be called out of order; each one re-checks its preconditions
//! against the persisted session row.
//!
//! ## Known gaps
//!
//! Identity-verification attempts are not rate limited and idle sessions do
//! not auto-cancel; both are follow-up hardening items, deliberately not
//! improvised here.

pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use models::{
    AttendeeDescriptor, MeetingCredentials, MeetingDescriptor, ParticipantRole, SessionEvent,
    SessionEventType, SessionStatus, TelehealthError, TelehealthSession,
};

pub use services::{
    MeetingProvisioningService, PatientAccessService, RealtimeMeetingsClient,
    SessionAuditService, SessionLifecycleService,
};

pub use router::telehealth_session_routes;
