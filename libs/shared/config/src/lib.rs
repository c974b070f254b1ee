use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub meetings_app_id: String,
    pub meetings_api_token: String,
    pub meetings_base_url: String,
    pub patient_portal_base_url: String,
    pub patient_link_ttl_hours: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            meetings_app_id: env::var("REALTIME_MEETINGS_APP_ID")
                .unwrap_or_else(|_| {
                    warn!("REALTIME_MEETINGS_APP_ID not set, using empty value");
                    String::new()
                }),
            meetings_api_token: env::var("REALTIME_MEETINGS_API_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("REALTIME_MEETINGS_API_TOKEN not set, using empty value");
                    String::new()
                }),
            meetings_base_url: env::var("REALTIME_MEETINGS_BASE_URL")
                .unwrap_or_else(|_| {
                    warn!("REALTIME_MEETINGS_BASE_URL not set, using default");
                    "https://meetings.telecare.health/v1".to_string()
                }),
            patient_portal_base_url: env::var("PATIENT_PORTAL_BASE_URL")
                .unwrap_or_else(|_| {
                    warn!("PATIENT_PORTAL_BASE_URL not set, using default");
                    "https://app.telecare.health/telehealth".to_string()
                }),
            patient_link_ttl_hours: env::var("PATIENT_LINK_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_meetings_configured(&self) -> bool {
        !self.meetings_app_id.is_empty()
            && !self.meetings_api_token.is_empty()
            && !self.meetings_base_url.is_empty()
    }
}
