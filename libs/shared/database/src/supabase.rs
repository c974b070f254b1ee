use anyhow::{anyhow, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Thin client over the Supabase PostgREST API.
///
/// Write helpers carry `Prefer: return=representation` so every insert/update
/// returns the affected rows. An update with a filter that matched zero rows
/// comes back as an empty array, which is how callers detect a lost
/// conditional write.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.clone(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>, prefer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key).unwrap());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
            );
        }

        if let Some(prefer_value) = prefer {
            headers.insert("Prefer", HeaderValue::from_str(prefer_value).unwrap());
        }

        headers
    }

    async fn send<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        prefer: Option<&str>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let headers = self.get_headers(auth_token, prefer);

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                _ => anyhow!("API error ({}): {}", status, error_text),
            });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.send(method, path, auth_token, body, None).await
    }

    /// SELECT rows. `query` is the PostgREST table path with filters,
    /// e.g. `/rest/v1/telehealth_sessions?patient_token=eq.abc`.
    pub async fn select<T>(&self, query: &str, auth_token: Option<&str>) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.send(Method::GET, query, auth_token, None, None).await
    }

    /// INSERT one row, returning the stored representation.
    pub async fn insert<T>(&self, table_path: &str, row: Value, auth_token: Option<&str>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let mut rows: Vec<T> = self
            .send(
                Method::POST,
                table_path,
                auth_token,
                Some(row),
                Some("return=representation"),
            )
            .await?;

        if rows.is_empty() {
            return Err(anyhow!("Insert into {} returned no rows", table_path));
        }
        Ok(rows.remove(0))
    }

    /// Conditional UPDATE. `query` carries the filters (including any
    /// compare-and-swap condition such as `&meeting_id=is.null`); the returned
    /// vector holds exactly the rows the filter matched. Empty means the
    /// condition no longer held when the write landed.
    pub async fn update_where<T>(
        &self,
        query: &str,
        changes: Value,
        auth_token: Option<&str>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.send(
            Method::PATCH,
            query,
            auth_token,
            Some(changes),
            Some("return=representation"),
        )
        .await
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}
