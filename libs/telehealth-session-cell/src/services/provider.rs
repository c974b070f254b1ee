// libs/telehealth-session-cell/src/services/provider.rs
use reqwest::Client;
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;

use crate::models::{
    AttendeeDescriptor, CreateAttendeeRequest, CreateAttendeeResponse, CreateMeetingRequest,
    CreateMeetingResponse, MeetingDescriptor, TelehealthError,
};

/// REST client for the external realtime meetings provider.
///
/// The engine treats the provider as a fallible, idempotent-on-read
/// dependency: creation is correlated through a client request token and
/// deletion of an already-gone meeting is a success.
pub struct RealtimeMeetingsClient {
    client: Client,
    app_id: String,
    api_token: String,
    base_url: String,
}

impl RealtimeMeetingsClient {
    pub fn new(config: &AppConfig) -> Result<Self, TelehealthError> {
        if !config.is_meetings_configured() {
            return Err(TelehealthError::NotConfigured);
        }

        Ok(Self {
            client: Client::new(),
            app_id: config.meetings_app_id.clone(),
            api_token: config.meetings_api_token.clone(),
            base_url: config.meetings_base_url.clone(),
        })
    }

    /// Provision a meeting resource.
    /// POST /apps/{appId}/meetings
    pub async fn create_meeting(
        &self,
        client_request_token: &str,
    ) -> Result<MeetingDescriptor, TelehealthError> {
        info!("Provisioning meeting (correlation {})", client_request_token);

        let url = format!("{}/apps/{}/meetings", self.base_url, self.app_id);

        let request_body = CreateMeetingRequest {
            client_request_token: client_request_token.to_string(),
        };

        debug!("Sending meeting creation request to: {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;

        debug!("Meeting creation response: {} - {}", status, response_text);

        if !status.is_success() {
            error!("Meeting creation failed: {} - {}", status, response_text);
            return Err(TelehealthError::ProvisioningUnavailable(format!(
                "HTTP {}: {}",
                status, response_text
            )));
        }

        let meeting: CreateMeetingResponse = serde_json::from_str(&response_text).map_err(|e| {
            TelehealthError::ProvisioningUnavailable(format!(
                "Failed to parse meeting response: {}",
                e
            ))
        })?;

        if let Some(error_code) = &meeting.error_code {
            let message = meeting.error_description.as_deref().unwrap_or("Unknown error");
            error!("Meeting provider error: {} - {}", error_code, message);
            return Err(TelehealthError::ProvisioningUnavailable(format!(
                "{}: {}",
                error_code, message
            )));
        }

        let meeting_id = meeting.meeting_id.ok_or_else(|| {
            TelehealthError::ProvisioningUnavailable(
                "Meeting response missing meetingId".to_string(),
            )
        })?;

        info!("Successfully provisioned meeting: {}", meeting_id);

        Ok(MeetingDescriptor {
            meeting_id,
            media_region: meeting.media_region,
            join_url: meeting.join_url,
        })
    }

    /// Mint a per-participant attendee credential.
    /// POST /apps/{appId}/meetings/{meetingId}/attendees
    pub async fn create_attendee(
        &self,
        meeting_id: &str,
        external_user_id: &str,
    ) -> Result<AttendeeDescriptor, TelehealthError> {
        info!("Creating attendee {} in meeting {}", external_user_id, meeting_id);

        let url = format!(
            "{}/apps/{}/meetings/{}/attendees",
            self.base_url, self.app_id, meeting_id
        );

        let request_body = CreateAttendeeRequest {
            external_user_id: external_user_id.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;

        debug!("Attendee creation response: {} - {}", status, response_text);

        if !status.is_success() {
            error!("Attendee creation failed: {} - {}", status, response_text);
            return Err(TelehealthError::ProvisioningUnavailable(format!(
                "HTTP {}: {}",
                status, response_text
            )));
        }

        let attendee: CreateAttendeeResponse =
            serde_json::from_str(&response_text).map_err(|e| {
                TelehealthError::ProvisioningUnavailable(format!(
                    "Failed to parse attendee response: {}",
                    e
                ))
            })?;

        if let Some(error_code) = &attendee.error_code {
            let message = attendee.error_description.as_deref().unwrap_or("Unknown error");
            error!("Attendee provider error: {} - {}", error_code, message);
            return Err(TelehealthError::ProvisioningUnavailable(format!(
                "{}: {}",
                error_code, message
            )));
        }

        match (attendee.attendee_id, attendee.join_token) {
            (Some(attendee_id), Some(join_token)) => Ok(AttendeeDescriptor {
                attendee_id,
                external_user_id: attendee
                    .external_user_id
                    .unwrap_or_else(|| external_user_id.to_string()),
                join_token,
            }),
            _ => Err(TelehealthError::ProvisioningUnavailable(
                "Attendee response missing credentials".to_string(),
            )),
        }
    }

    /// Release a meeting resource.
    /// DELETE /apps/{appId}/meetings/{meetingId}
    ///
    /// A 404 means the resource already expired on the provider side and is
    /// treated as success.
    pub async fn delete_meeting(&self, meeting_id: &str) -> Result<(), TelehealthError> {
        info!("Releasing meeting: {}", meeting_id);

        let url = format!(
            "{}/apps/{}/meetings/{}",
            self.base_url, self.app_id, meeting_id
        );

        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("Meeting {} already gone on provider side", meeting_id);
            return Ok(());
        }

        if !status.is_success() {
            let response_text = response.text().await?;
            error!("Meeting release failed: {} - {}", status, response_text);
            return Err(TelehealthError::ProvisioningUnavailable(format!(
                "HTTP {}: {}",
                status, response_text
            )));
        }

        info!("Successfully released meeting: {}", meeting_id);
        Ok(())
    }

    /// Connectivity probe for the provider API.
    pub async fn health_check(&self) -> Result<bool, TelehealthError> {
        debug!("Performing meetings provider health check");

        let url = format!("{}/apps/{}", self.base_url, self.app_id);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await?;

        // 404 is acceptable: the app-info endpoint is optional on some plans.
        let is_healthy = response.status().is_success() || response.status() == 404;

        if is_healthy {
            info!("Meetings provider health check passed");
        } else {
            warn!("Meetings provider health check failed: {}", response.status());
        }

        Ok(is_healthy)
    }
}
