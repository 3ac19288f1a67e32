use crate::domain::models::TokenSet;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

const HTTP_TIMEOUT_SECONDS: u64 = 30;

/// Remote credential backup, keyed by user identity. Strictly a backup:
/// writes are fire-and-forget from the vault's perspective and failures
/// must never block a foreground operation.
#[async_trait]
pub trait RemoteCredentialStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<TokenSet>, InfraError>;
    async fn upsert(&self, user_id: &str, tokens: &TokenSet) -> Result<(), InfraError>;
    async fn delete(&self, user_id: &str) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct HttpRemoteCredentialStore {
    client: Client,
    base_url: String,
    service_key: String,
}

#[derive(Debug, serde::Serialize)]
struct CredentialRow<'a> {
    user_id: &'a str,
    access_token: &'a str,
    refresh_token: &'a str,
    expires_at: i64,
    updated_at: String,
}

#[derive(Debug, serde::Deserialize)]
struct CredentialRowPayload {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
}

impl HttpRemoteCredentialStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| InfraError::Transient(format!("failed building http client: {error}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            service_key: service_key.into(),
        })
    }

    fn row_endpoint(&self, user_id: &str) -> Result<Url, InfraError> {
        if user_id.trim().is_empty() {
            return Err(InfraError::Validation("user id must not be empty".to_string()));
        }
        let mut url = Url::parse(&self.base_url)
            .map_err(|error| InfraError::Validation(format!("invalid backup base url: {error}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| InfraError::Validation("backup base URL cannot be a base".to_string()))?;
            segments.push("media-credentials");
            segments.push(user_id);
        }
        Ok(url)
    }

    fn http_error(status: reqwest::StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("credential backup error: http {}", status.as_u16())
        } else {
            format!("credential backup error: http {}; body={body}", status.as_u16())
        };
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            InfraError::Auth(message)
        } else {
            InfraError::Transient(message)
        }
    }
}

#[async_trait]
impl RemoteCredentialStore for HttpRemoteCredentialStore {
    async fn load(&self, user_id: &str) -> Result<Option<TokenSet>, InfraError> {
        let endpoint = self.row_endpoint(user_id)?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("network error while loading backup: {error}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Transient(format!("failed reading backup response: {error}")))?;

        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let parsed: CredentialRowPayload = serde_json::from_str(&body).map_err(|error| {
            InfraError::Validation(format!("invalid credential backup payload: {error}"))
        })?;

        let Some(access_token) = parsed.access_token.filter(|value| !value.trim().is_empty()) else {
            return Ok(None);
        };
        let Some(refresh_token) = parsed.refresh_token.filter(|value| !value.trim().is_empty()) else {
            return Ok(None);
        };
        let Some(expires_at) = parsed.expires_at.and_then(DateTime::from_timestamp_millis) else {
            return Ok(None);
        };

        Ok(Some(TokenSet {
            access_token,
            refresh_token,
            expires_at,
        }))
    }

    async fn upsert(&self, user_id: &str, tokens: &TokenSet) -> Result<(), InfraError> {
        let endpoint = self.row_endpoint(user_id)?;
        let row = CredentialRow {
            user_id,
            access_token: &tokens.access_token,
            refresh_token: &tokens.refresh_token,
            expires_at: tokens.expires_at.timestamp_millis(),
            updated_at: Utc::now().to_rfc3339(),
        };

        let response = self
            .client
            .put(endpoint)
            .bearer_auth(&self.service_key)
            .json(&row)
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("network error while writing backup: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), InfraError> {
        let endpoint = self.row_endpoint(user_id)?;
        let response = self
            .client
            .delete(endpoint)
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("network error while deleting backup: {error}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::http_error(status, &body))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRemoteCredentialStore {
    rows: Mutex<HashMap<String, TokenSet>>,
    fail_writes: Mutex<bool>,
}

impl InMemoryRemoteCredentialStore {
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut guard) = self.fail_writes.lock() {
            *guard = fail;
        }
    }

    pub fn row(&self, user_id: &str) -> Option<TokenSet> {
        self.rows
            .lock()
            .ok()
            .and_then(|rows| rows.get(user_id).cloned())
    }

    fn lock_rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TokenSet>>, InfraError> {
        self.rows
            .lock()
            .map_err(|error| InfraError::Credential(format!("remote rows lock poisoned: {error}")))
    }

    fn writes_failing(&self) -> bool {
        self.fail_writes.lock().map(|guard| *guard).unwrap_or(false)
    }
}

#[async_trait]
impl RemoteCredentialStore for InMemoryRemoteCredentialStore {
    async fn load(&self, user_id: &str) -> Result<Option<TokenSet>, InfraError> {
        Ok(self.lock_rows()?.get(user_id).cloned())
    }

    async fn upsert(&self, user_id: &str, tokens: &TokenSet) -> Result<(), InfraError> {
        if self.writes_failing() {
            return Err(InfraError::Transient("backup store unavailable".to_string()));
        }
        self.lock_rows()?.insert(user_id.to_string(), tokens.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), InfraError> {
        if self.writes_failing() {
            return Err(InfraError::Transient("backup store unavailable".to_string()));
        }
        self.lock_rows()?.remove(user_id);
        Ok(())
    }
}
