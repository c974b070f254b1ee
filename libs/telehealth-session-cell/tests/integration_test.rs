use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_config::AppConfig;
use shared_utils::test_utils::{TestConfig, TestUser};
use telehealth_session_cell::models::{
    CreateSessionRequest, ClientMeta, MeetingDescriptor, RecordConsentRequest, SessionStatus,
    TelehealthError, TelehealthSession,
};
use telehealth_session_cell::services::{
    MeetingProvisioningService, PatientAccessService, SessionLifecycleService,
};

// ==============================================================================
// FIXTURES
// ==============================================================================

fn store_config(store: &MockServer) -> AppConfig {
    let mut config = TestConfig::default().to_app_config();
    config.supabase_url = store.uri();
    config
}

fn full_config(store: &MockServer, meetings: &MockServer) -> AppConfig {
    let mut config = store_config(store);
    config.meetings_base_url = meetings.uri();
    config
}

fn session_row(
    id: Uuid,
    appointment_id: Uuid,
    token: &str,
    status: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "appointment_id": appointment_id,
        "status": status,
        "patient_token": token,
        "patient_token_expires_at": (Utc::now() + Duration::hours(2)).to_rfc3339(),
        "identity_verified_at": null,
        "meeting_id": null,
        "meeting_data": null,
        "started_at": null,
        "finished_at": null,
        "created_at": Utc::now().to_rfc3339(),
        "updated_at": Utc::now().to_rfc3339(),
    })
}

fn appointment_row(id: Uuid, patient_id: Uuid, doctor_id: Uuid) -> serde_json::Value {
    json!({
        "id": id,
        "patient_id": patient_id,
        "doctor_id": doctor_id,
        "clinic_id": Uuid::new_v4(),
        "clinic_name": "Centro Clinic",
        "doctor_name": "Dr. Ana Souza",
        "doctor_specialty": "Dermatology",
        "patient_document": "123.456.789-01",
        "scheduled_at": (Utc::now() + Duration::minutes(10)).to_rfc3339(),
        "duration_minutes": 30,
        "status": "confirmed",
        "modality": "remote",
        "ended_at": null,
    })
}

fn consent_row(session_id: Uuid) -> serde_json::Value {
    json!({
        "id": Uuid::new_v4(),
        "session_id": session_id,
        "consent_given": true,
        "consent_version": "1.0",
        "ip_address": "203.0.113.7",
        "user_agent": "test-agent",
        "created_at": Utc::now().to_rfc3339(),
    })
}

fn participant_row(session_id: Uuid, role: &str) -> serde_json::Value {
    json!({
        "id": Uuid::new_v4(),
        "session_id": session_id,
        "role": role,
        "attendee_id": null,
        "attendee_data": null,
        "join_time": null,
        "leave_time": null,
    })
}

fn event_row(session_id: Uuid, event_type: &str) -> serde_json::Value {
    json!({
        "id": Uuid::new_v4(),
        "session_id": session_id,
        "actor_role": "patient",
        "actor_id": null,
        "event_type": event_type,
        "metadata": {},
        "created_at": Utc::now().to_rfc3339(),
    })
}

fn parse_session(row: serde_json::Value) -> TelehealthSession {
    serde_json::from_value(row).unwrap()
}

async fn mount_events_sink(store: &MockServer, session_id: Uuid) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/session_events"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([event_row(session_id, "PATIENT_JOINED")])),
        )
        .mount(store)
        .await;
}

// ==============================================================================
// TOKEN VALIDATOR
// ==============================================================================

#[tokio::test]
async fn test_unknown_token_is_not_found() {
    let store = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    let result = service.resolve_session("doesnotexist42").await;

    assert_matches!(result, Err(TelehealthError::NotFound));
}

#[tokio::test]
async fn test_expired_token_rejected_on_every_gate() {
    let store = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let token = "expiredtokenvalue123";

    let mut row = session_row(session_id, appointment_id, token, "waiting");
    row["patient_token_expires_at"] = json!((Utc::now() - Duration::hours(1)).to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;

    let meetings = MockServer::start().await;
    let config = full_config(&store, &meetings);
    let access = PatientAccessService::new(&config);
    let lifecycle = SessionLifecycleService::new(&config).unwrap();
    let meta = ClientMeta::default();

    assert_matches!(
        access.resolve_session(token).await,
        Err(TelehealthError::Expired)
    );
    assert_matches!(
        access.verify_identity(token, "8901", &meta).await,
        Err(TelehealthError::Expired)
    );
    assert_matches!(
        access
            .record_consent(
                token,
                RecordConsentRequest {
                    consent_given: true,
                    consent_version: Some("1.0".to_string())
                },
                &meta
            )
            .await,
        Err(TelehealthError::Expired)
    );
    assert_matches!(
        lifecycle.patient_join(token, &meta).await,
        Err(TelehealthError::Expired)
    );
}

#[tokio::test]
async fn test_stale_link_to_finished_session_is_closed() {
    let store = MockServer::start().await;
    let token = "finishedtokenvalue99";
    let row = session_row(Uuid::new_v4(), Uuid::new_v4(), token, "finished");

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    let result = service.resolve_session(token).await;

    assert_matches!(result, Err(TelehealthError::SessionClosed { .. }));
}

// ==============================================================================
// IDENTITY VERIFICATION GATE
// ==============================================================================

#[tokio::test]
async fn test_identity_malformed_input_rejected_before_lookup() {
    // No mock store at all: the format check must fire before any I/O.
    let service = PatientAccessService::new(&TestConfig::default().to_app_config());
    let meta = ClientMeta::default();

    for bad in ["12a4", "123", "12345", ""] {
        let result = service.verify_identity("sometoken123", bad, &meta).await;
        assert_matches!(result, Err(TelehealthError::InvalidInput(_)), "digits {:?}", bad);
    }
}

#[tokio::test]
async fn test_identity_wrong_digits_unauthorized_and_audited() {
    let store = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();
    let token = "identitytokenvalue1";

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([session_row(
            session_id,
            appointment_id,
            token,
            "scheduled"
        )])))
        .mount(&store)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            patient_id,
            Uuid::new_v4()
        )])))
        .mount(&store)
        .await;

    // The failed attempt must land in the audit trail.
    Mock::given(method("POST"))
        .and(path("/rest/v1/session_events"))
        .and(body_partial_json(json!({ "event_type": "IDENTITY_FAILED" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([event_row(session_id, "IDENTITY_FAILED")])),
        )
        .expect(1)
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    let result = service
        .verify_identity(token, "0000", &ClientMeta::default())
        .await;

    assert_matches!(result, Err(TelehealthError::Unauthorized));
}

#[tokio::test]
async fn test_identity_correct_digits_sets_one_way_flag() {
    let store = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let token = "identitytokenvalue2";

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([session_row(
            session_id,
            appointment_id,
            token,
            "scheduled"
        )])))
        .mount(&store)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            Uuid::new_v4(),
            Uuid::new_v4()
        )])))
        .mount(&store)
        .await;

    // Conditional write: only fires while the flag is still null.
    let mut verified_row = session_row(session_id, appointment_id, token, "scheduled");
    verified_row["identity_verified_at"] = json!(Utc::now().to_rfc3339());
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("identity_verified_at", "is.null"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([verified_row])))
        .expect(1)
        .mount(&store)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/session_events"))
        .and(body_partial_json(json!({ "event_type": "IDENTITY_VERIFIED" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([event_row(session_id, "IDENTITY_VERIFIED")])),
        )
        .expect(1)
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    // Document is 123.456.789-01; digits only, last four = 8901.
    let result = service
        .verify_identity(token, "8901", &ClientMeta::default())
        .await;

    assert_matches!(result, Ok(true));
}

#[tokio::test]
async fn test_identity_already_verified_short_circuits() {
    let store = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let token = "identitytokenvalue3";

    let mut row = session_row(session_id, Uuid::new_v4(), token, "waiting");
    row["identity_verified_at"] = json!(Utc::now().to_rfc3339());

    // Only the session lookup is mocked. If the gate re-checked the digits it
    // would hit the (unmocked) appointment store and fail.
    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    let result = service
        .verify_identity(token, "0000", &ClientMeta::default())
        .await;

    assert_matches!(result, Ok(true));
}

// ==============================================================================
// CONSENT RECORDER
// ==============================================================================

#[tokio::test]
async fn test_consent_without_identity_is_forbidden() {
    let store = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let token = "consenttokenvalue11";

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([session_row(
            session_id,
            Uuid::new_v4(),
            token,
            "scheduled"
        )])))
        .mount(&store)
        .await;

    // No consent row may be written.
    Mock::given(method("POST"))
        .and(path("/rest/v1/session_consents"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([consent_row(session_id)])))
        .expect(0)
        .mount(&store)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/session_events"))
        .and(body_partial_json(json!({ "event_type": "CONSENT_BLOCKED" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([event_row(session_id, "CONSENT_BLOCKED")])),
        )
        .expect(1)
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    let result = service
        .record_consent(
            token,
            RecordConsentRequest {
                consent_given: true,
                consent_version: Some("1.0".to_string()),
            },
            &ClientMeta::default(),
        )
        .await;

    assert_matches!(result, Err(TelehealthError::Forbidden(_)));
}

#[tokio::test]
async fn test_consent_is_idempotent() {
    let store = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let token = "consenttokenvalue22";

    let mut row = session_row(session_id, Uuid::new_v4(), token, "scheduled");
    row["identity_verified_at"] = json!(Utc::now().to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/session_consents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([consent_row(session_id)])))
        .mount(&store)
        .await;

    // Re-submission must create no second row and no duplicate audit entry.
    Mock::given(method("POST"))
        .and(path("/rest/v1/session_consents"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([consent_row(session_id)])))
        .expect(0)
        .mount(&store)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/session_events"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([event_row(session_id, "CONSENT_GIVEN")])),
        )
        .expect(0)
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    let outcome = service
        .record_consent(
            token,
            RecordConsentRequest {
                consent_given: true,
                consent_version: Some("1.0".to_string()),
            },
            &ClientMeta::default(),
        )
        .await
        .unwrap();

    assert!(outcome.accepted);
    assert!(outcome.already_consented);
}

#[tokio::test]
async fn test_consent_recorded_once() {
    let store = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let token = "consenttokenvalue33";

    let mut row = session_row(session_id, Uuid::new_v4(), token, "scheduled");
    row["identity_verified_at"] = json!(Utc::now().to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/session_consents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&store)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/session_consents"))
        .and(body_partial_json(json!({ "consent_given": true, "consent_version": "2.1" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([consent_row(session_id)])))
        .expect(1)
        .mount(&store)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/session_events"))
        .and(body_partial_json(json!({ "event_type": "CONSENT_GIVEN" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([event_row(session_id, "CONSENT_GIVEN")])),
        )
        .expect(1)
        .mount(&store)
        .await;

    let service = PatientAccessService::new(&store_config(&store));
    let outcome = service
        .record_consent(
            token,
            RecordConsentRequest {
                consent_given: true,
                consent_version: Some("2.1".to_string()),
            },
            &ClientMeta::default(),
        )
        .await
        .unwrap();

    assert!(outcome.accepted);
    assert!(!outcome.already_consented);
}

// ==============================================================================
// MEETING PROVISIONING
// ==============================================================================

#[tokio::test]
async fn test_ensure_meeting_returns_cached_descriptor() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;

    let mut row = session_row(Uuid::new_v4(), Uuid::new_v4(), "cachedtok1", "waiting");
    row["meeting_id"] = json!("m-cached");
    row["meeting_data"] = json!({ "meetingId": "m-cached", "mediaRegion": "eu-west-1" });
    let session = parse_session(row);

    // No provider mock is mounted: any provisioning attempt would fail.
    let service = MeetingProvisioningService::new(&full_config(&store, &meetings)).unwrap();
    let descriptor = service.ensure_meeting(&session).await.unwrap();

    assert_eq!(descriptor.meeting_id, "m-cached");
}

#[tokio::test]
async fn test_ensure_meeting_provisions_and_claims_column() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;

    let session = parse_session(session_row(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "provisiontok1",
        "scheduled",
    ));

    Mock::given(method("POST"))
        .and(path("/apps/test-app-id/meetings"))
        .and(body_partial_json(json!({ "clientRequestToken": session.id.to_string() })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meetingId": "m-new",
            "mediaRegion": "sa-east-1",
            "joinUrl": "https://meet.example/m-new"
        })))
        .expect(1)
        .mount(&meetings)
        .await;

    let mut claimed = session_row(session.id, session.appointment_id, "provisiontok1", "scheduled");
    claimed["meeting_id"] = json!("m-new");
    claimed["meeting_data"] = json!({ "meetingId": "m-new", "mediaRegion": "sa-east-1" });
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("meeting_id", "is.null"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([claimed])))
        .expect(1)
        .mount(&store)
        .await;

    let service = MeetingProvisioningService::new(&full_config(&store, &meetings)).unwrap();
    let descriptor = service.ensure_meeting(&session).await.unwrap();

    assert_eq!(descriptor.meeting_id, "m-new");
}

#[tokio::test]
async fn test_ensure_meeting_race_loser_adopts_winner() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;

    let session = parse_session(session_row(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "racetokenvalue12",
        "scheduled",
    ));

    // Our provisioning succeeds...
    Mock::given(method("POST"))
        .and(path("/apps/test-app-id/meetings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meetingId": "m-loser"
        })))
        .mount(&meetings)
        .await;

    // ...but the conditional write finds the column already claimed.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("meeting_id", "is.null"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&store)
        .await;

    // The redundant meeting is released...
    Mock::given(method("DELETE"))
        .and(path("/apps/test-app-id/meetings/m-loser"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&meetings)
        .await;

    // ...and the winner's descriptor is re-read from the session row.
    let mut winner = session_row(session.id, session.appointment_id, "racetokenvalue12", "waiting");
    winner["meeting_id"] = json!("m-winner");
    winner["meeting_data"] = json!({ "meetingId": "m-winner" });
    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([winner])))
        .mount(&store)
        .await;

    let service = MeetingProvisioningService::new(&full_config(&store, &meetings)).unwrap();
    let descriptor = service.ensure_meeting(&session).await.unwrap();

    assert_eq!(descriptor.meeting_id, "m-winner");
}

// ==============================================================================
// LIFECYCLE: PATIENT JOIN
// ==============================================================================

#[tokio::test]
async fn test_patient_join_without_consent_is_forbidden() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let token = "joinwithoutconsent1";

    let mut row = session_row(session_id, Uuid::new_v4(), token, "scheduled");
    row["identity_verified_at"] = json!(Utc::now().to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/session_consents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&store)
        .await;

    // No provider mock: provisioning must not be reached.
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let result = service.patient_join(token, &ClientMeta::default()).await;

    assert_matches!(result, Err(TelehealthError::Forbidden(_)));
}

#[tokio::test]
async fn test_patient_join_happy_path_reaches_waiting() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();
    let token = "happyjointoken1234";

    let mut row = session_row(session_id, appointment_id, token, "scheduled");
    row["identity_verified_at"] = json!(Utc::now().to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/session_consents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([consent_row(session_id)])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            patient_id,
            Uuid::new_v4()
        )])))
        .mount(&store)
        .await;

    Mock::given(method("POST"))
        .and(path("/apps/test-app-id/meetings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "meetingId": "m-join" })))
        .mount(&meetings)
        .await;

    let mut claimed = session_row(session_id, appointment_id, token, "scheduled");
    claimed["meeting_id"] = json!("m-join");
    claimed["meeting_data"] = json!({ "meetingId": "m-join" });
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("meeting_id", "is.null"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([claimed])))
        .mount(&store)
        .await;

    // The attendee identity embeds the role and the patient id.
    Mock::given(method("POST"))
        .and(path("/apps/test-app-id/meetings/m-join/attendees"))
        .and(body_partial_json(json!({
            "externalUserId": format!("PATIENT_{}", patient_id)
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "attendeeId": "att-patient",
            "externalUserId": format!("PATIENT_{}", patient_id),
            "joinToken": "jt-secret"
        })))
        .expect(1)
        .mount(&meetings)
        .await;

    let mut joined = participant_row(session_id, "patient");
    joined["attendee_id"] = json!("att-patient");
    joined["join_time"] = json!(Utc::now().to_rfc3339());
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/session_participants"))
        .and(query_param("role", "eq.patient"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([joined])))
        .expect(1)
        .mount(&store)
        .await;

    let mut waiting = session_row(session_id, appointment_id, token, "waiting");
    waiting["meeting_id"] = json!("m-join");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("status", "eq.scheduled"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([waiting])))
        .expect(1)
        .mount(&store)
        .await;

    mount_events_sink(&store, session_id).await;

    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let (credentials, status) = service
        .patient_join(token, &ClientMeta::default())
        .await
        .unwrap();

    assert_eq!(credentials.meeting.meeting_id, "m-join");
    assert_eq!(credentials.attendee.attendee_id, "att-patient");
    assert_eq!(status, SessionStatus::Waiting);
}

// ==============================================================================
// LIFECYCLE: DOCTOR SIDE
// ==============================================================================

#[tokio::test]
async fn test_doctor_join_starts_the_encounter() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();

    let mut row = session_row(session_id, appointment_id, "doctorjointoken1", "waiting");
    row["meeting_id"] = json!("m-doc");
    row["meeting_data"] = json!({ "meetingId": "m-doc" });

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            Uuid::new_v4(),
            doctor_id
        )])))
        .mount(&store)
        .await;

    Mock::given(method("POST"))
        .and(path("/apps/test-app-id/meetings/m-doc/attendees"))
        .and(body_partial_json(json!({
            "externalUserId": format!("DOCTOR_{}", doctor_id)
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "attendeeId": "att-doctor",
            "externalUserId": format!("DOCTOR_{}", doctor_id),
            "joinToken": "jt-doc"
        })))
        .expect(1)
        .mount(&meetings)
        .await;

    let mut joined = participant_row(session_id, "doctor");
    joined["attendee_id"] = json!("att-doctor");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/session_participants"))
        .and(query_param("role", "eq.doctor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([joined])))
        .expect(1)
        .mount(&store)
        .await;

    // Doctor joining always marks the encounter as begun.
    let mut in_progress = session_row(session_id, appointment_id, "doctorjointoken1", "in_progress");
    in_progress["started_at"] = json!(Utc::now().to_rfc3339());
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("status", "in.(scheduled,waiting)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([in_progress])))
        .expect(1)
        .mount(&store)
        .await;

    mount_events_sink(&store, session_id).await;

    let user = TestUser::doctor("doc@example.com").with_id(doctor_id).to_user();
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let credentials = service.doctor_join(session_id, &user).await.unwrap();

    assert_eq!(credentials.meeting.meeting_id, "m-doc");
    assert_eq!(credentials.attendee.attendee_id, "att-doctor");
}

#[tokio::test]
async fn test_doctor_join_cross_clinician_is_forbidden() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([session_row(
            session_id,
            appointment_id,
            "crossdoctoken12",
            "waiting"
        )])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            Uuid::new_v4(),
            Uuid::new_v4()
        )])))
        .mount(&store)
        .await;

    // Some other clinician entirely.
    let user = TestUser::doctor("other@example.com").to_user();
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let result = service.doctor_join(session_id, &user).await;

    assert_matches!(result, Err(TelehealthError::Forbidden(_)));
}

// ==============================================================================
// LIFECYCLE: TERMINATION
// ==============================================================================

#[tokio::test]
async fn test_terminate_finished_session_is_a_no_op() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();

    let started = Utc::now() - Duration::minutes(30);
    let finished = Utc::now() - Duration::minutes(5);
    let mut row = session_row(session_id, appointment_id, "finishedtoken321", "finished");
    row["started_at"] = json!(started.to_rfc3339());
    row["finished_at"] = json!(finished.to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            Uuid::new_v4(),
            doctor_id
        )])))
        .mount(&store)
        .await;

    // Zero additional writes of any kind.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&store)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&store)
        .await;

    let user = TestUser::doctor("doc@example.com").with_id(doctor_id).to_user();
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let summary = service.terminate(session_id, &user).await.unwrap();

    assert!(summary.already_finished);
    assert_eq!(summary.duration_seconds, (finished - started).num_seconds());
}

#[tokio::test]
async fn test_terminate_in_progress_session() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();

    let mut row = session_row(session_id, appointment_id, "terminatetoken55", "in_progress");
    row["meeting_id"] = json!("m-end");
    row["meeting_data"] = json!({ "meetingId": "m-end" });
    row["started_at"] = json!((Utc::now() - Duration::minutes(10)).to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            patient_id,
            doctor_id
        )])))
        .mount(&store)
        .await;

    // Best-effort release of the external resource.
    Mock::given(method("DELETE"))
        .and(path("/apps/test-app-id/meetings/m-end"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&meetings)
        .await;

    let mut finished = session_row(session_id, appointment_id, "terminatetoken55", "finished");
    finished["finished_at"] = json!(Utc::now().to_rfc3339());
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("status", "in.(scheduled,waiting,in_progress)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([finished])))
        .expect(1)
        .mount(&store)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/session_participants"))
        .and(query_param("role", "eq.doctor"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([participant_row(session_id, "doctor")])),
        )
        .expect(1)
        .mount(&store)
        .await;

    // The linked appointment is completed and stamped.
    let mut completed = appointment_row(appointment_id, patient_id, doctor_id);
    completed["status"] = json!("completed");
    completed["ended_at"] = json!(Utc::now().to_rfc3339());
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(body_partial_json(json!({ "status": "completed" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([completed])))
        .expect(1)
        .mount(&store)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/session_events"))
        .and(body_partial_json(json!({ "event_type": "SESSION_ENDED" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([event_row(session_id, "SESSION_ENDED")])),
        )
        .expect(1)
        .mount(&store)
        .await;

    let user = TestUser::doctor("doc@example.com").with_id(doctor_id).to_user();
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let summary = service.terminate(session_id, &user).await.unwrap();

    assert!(!summary.already_finished);
    assert!(summary.duration_seconds >= 590 && summary.duration_seconds <= 610);
}

// ==============================================================================
// LIFECYCLE: CREATION AND DETAIL
// ==============================================================================

#[tokio::test]
async fn test_create_session_for_remote_appointment() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let appointment_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            Uuid::new_v4(),
            doctor_id
        )])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .and(query_param("appointment_id", format!("eq.{}", appointment_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&store)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([session_row(
            session_id,
            appointment_id,
            "freshtokenvalue77",
            "scheduled"
        )])))
        .expect(1)
        .mount(&store)
        .await;
    // One placeholder participant row per role.
    Mock::given(method("POST"))
        .and(path("/rest/v1/session_participants"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([participant_row(session_id, "doctor")])),
        )
        .expect(2)
        .mount(&store)
        .await;

    let user = TestUser::doctor("doc@example.com").with_id(doctor_id).to_user();
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let session = service
        .create_for_appointment(CreateSessionRequest { appointment_id }, &user)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Scheduled);
    assert_eq!(session.appointment_id, appointment_id);
}

#[tokio::test]
async fn test_create_session_conflicts_on_duplicate() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let appointment_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            Uuid::new_v4(),
            doctor_id
        )])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([session_row(
            Uuid::new_v4(),
            appointment_id,
            "existingtoken88",
            "scheduled"
        )])))
        .mount(&store)
        .await;

    let user = TestUser::doctor("doc@example.com").with_id(doctor_id).to_user();
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let result = service
        .create_for_appointment(CreateSessionRequest { appointment_id }, &user)
        .await;

    assert_matches!(result, Err(TelehealthError::AlreadyExists));
}

#[tokio::test]
async fn test_session_detail_reconstructs_link_and_orders_events() {
    let store = MockServer::start().await;
    let meetings = MockServer::start().await;
    let session_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let token = "detailtokenvalue66";

    let mut row = session_row(session_id, appointment_id, token, "in_progress");
    row["meeting_id"] = json!("m-detail");
    row["identity_verified_at"] = json!(Utc::now().to_rfc3339());

    Mock::given(method("GET"))
        .and(path("/rest/v1/telehealth_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([appointment_row(
            appointment_id,
            Uuid::new_v4(),
            doctor_id
        )])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/session_participants"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            participant_row(session_id, "doctor"),
            participant_row(session_id, "patient"),
        ])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/session_consents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([consent_row(session_id)])))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/session_events"))
        .and(query_param("order", "created_at.asc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            event_row(session_id, "IDENTITY_VERIFIED"),
            event_row(session_id, "CONSENT_GIVEN"),
            event_row(session_id, "PATIENT_JOINED"),
        ])))
        .mount(&store)
        .await;

    let user = TestUser::doctor("doc@example.com").with_id(doctor_id).to_user();
    let service = SessionLifecycleService::new(&full_config(&store, &meetings)).unwrap();
    let detail = service.session_detail(session_id, &user).await.unwrap();

    assert_eq!(detail.id, session_id);
    assert_eq!(detail.participants.len(), 2);
    assert!(detail.consent.is_some());
    assert_eq!(detail.events.len(), 3);
    assert!(detail.patient_link.ends_with(&format!("/join/{}", token)));

    // The serialized detail must not leak attendee join secrets.
    let serialized = serde_json::to_value(&detail).unwrap();
    assert!(serialized["participants"][0].get("attendee_data").is_none());
}

// ==============================================================================
// INVARIANT SMOKE CHECK
// ==============================================================================

#[tokio::test]
async fn test_meeting_descriptor_round_trips_through_session_row() {
    let descriptor = MeetingDescriptor {
        meeting_id: "m-rt".to_string(),
        media_region: Some("us-east-1".to_string()),
        join_url: None,
    };

    let mut row = session_row(Uuid::new_v4(), Uuid::new_v4(), "roundtriptok1", "waiting");
    row["meeting_id"] = json!("m-rt");
    row["meeting_data"] = serde_json::to_value(&descriptor).unwrap();

    let session = parse_session(row);
    assert_eq!(session.meeting_data.unwrap().meeting_id, "m-rt");
}
