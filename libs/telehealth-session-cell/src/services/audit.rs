// libs/telehealth-session-cell/src/services/audit.rs
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{ActorRole, SessionEvent, SessionEventType, TelehealthError};

/// Append-only recorder for security and lifecycle events.
///
/// Audit is a side channel, not a transactional participant: a failed write
/// is reported to operators through a warning and never propagates to the
/// operation being documented.
pub struct SessionAuditService {
    supabase: Arc<SupabaseClient>,
}

impl SessionAuditService {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    pub async fn record(
        &self,
        session_id: Uuid,
        actor_role: ActorRole,
        actor_id: Option<&str>,
        event_type: SessionEventType,
        metadata: Value,
    ) {
        match event_type {
            SessionEventType::IdentityFailed | SessionEventType::ConsentBlocked => {
                warn!(
                    session_id = %session_id,
                    actor_role = ?actor_role,
                    event_type = ?event_type,
                    "AUDIT: access denied"
                );
            }
            _ => {
                info!(
                    session_id = %session_id,
                    actor_role = ?actor_role,
                    event_type = ?event_type,
                    "AUDIT: {:?}", event_type
                );
            }
        }

        let row = json!({
            "id": Uuid::new_v4(),
            "session_id": session_id,
            "actor_role": actor_role,
            "actor_id": actor_id,
            "event_type": event_type,
            "metadata": metadata,
            "created_at": Utc::now().to_rfc3339(),
        });

        if let Err(e) = self
            .supabase
            .insert::<SessionEvent>("/rest/v1/session_events", row, None)
            .await
        {
            warn!("Failed to record session event {:?}: {}", event_type, e);
        }
    }

    /// Events for one session in creation order, as exposed on the
    /// clinician-facing detail endpoint.
    pub async fn list_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<SessionEvent>, TelehealthError> {
        let query = format!(
            "/rest/v1/session_events?session_id=eq.{}&order=created_at.asc",
            session_id
        );

        self.supabase
            .select::<SessionEvent>(&query, None)
            .await
            .map_err(|e| TelehealthError::Database(e.to_string()))
    }
}
