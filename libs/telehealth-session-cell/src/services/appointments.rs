// libs/telehealth-session-cell/src/services/appointments.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{Appointment, TelehealthError};

/// Collaborator interface to the appointment record store.
///
/// The engine reads patient/clinician identity and scheduling fields, and
/// writes exactly one status/end-time update when a session terminates. It
/// does not own scheduling.
pub struct AppointmentStore {
    supabase: Arc<SupabaseClient>,
}

impl AppointmentStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    pub async fn get(&self, appointment_id: Uuid) -> Result<Appointment, TelehealthError> {
        debug!("Fetching appointment {}", appointment_id);

        let query = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let rows: Vec<Appointment> = self
            .supabase
            .select(&query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        rows.into_iter().next().ok_or(TelehealthError::NotFound)
    }

    pub async fn mark_completed(
        &self,
        appointment_id: Uuid,
        ended_at: DateTime<Utc>,
    ) -> Result<(), TelehealthError> {
        debug!("Marking appointment {} completed", appointment_id);

        let query = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let changes = json!({
            "status": "completed",
            "ended_at": ended_at.to_rfc3339(),
        });

        let _rows: Vec<Appointment> = self
            .supabase
            .update_where(&query, changes, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))?;

        Ok(())
    }
}
