use crate::domain::models::TokenSet;
use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

/// Durable local persistence for the provider token set. The local store is
/// the source of truth; the remote backend (see `remote_credentials`) only
/// backs it up.
pub trait CredentialStore: Send + Sync {
    fn save_tokens(&self, tokens: &TokenSet) -> Result<(), InfraError>;
    fn load_tokens(&self) -> Result<Option<TokenSet>, InfraError>;
    fn delete_tokens(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
    account_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new("daybook.media.session", "default")
    }
}

#[derive(Debug, serde::Deserialize)]
struct StoredTokenPayload {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
}

fn decode_payload(raw: &str) -> Option<TokenSet> {
    let payload = serde_json::from_str::<StoredTokenPayload>(raw).ok()?;
    let access_token = payload.access_token.filter(|value| !value.trim().is_empty())?;
    let refresh_token = payload.refresh_token.filter(|value| !value.trim().is_empty())?;
    let expires_at = chrono::DateTime::from_timestamp_millis(payload.expires_at?)?;
    Some(TokenSet {
        access_token,
        refresh_token,
        expires_at,
    })
}

impl CredentialStore for KeyringCredentialStore {
    fn save_tokens(&self, tokens: &TokenSet) -> Result<(), InfraError> {
        let payload = serde_json::to_string(tokens)?;
        self.entry()?
            .set_password(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_tokens(&self) -> Result<Option<TokenSet>, InfraError> {
        let raw = match self.entry()?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(InfraError::Credential(error.to_string())),
        };

        match decode_payload(&raw) {
            Some(tokens) => Ok(Some(tokens)),
            None => {
                // Malformed entries are dropped rather than surfaced so the
                // vault falls through to the next load source.
                tracing::warn!("discarding malformed credential entry");
                let _ = self.delete_tokens();
                Ok(None)
            }
        }
    }

    fn delete_tokens(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    tokens: Mutex<Option<String>>,
}

impl InMemoryCredentialStore {
    pub fn seed_raw(&self, raw: impl Into<String>) {
        if let Ok(mut guard) = self.tokens.lock() {
            *guard = Some(raw.into());
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn save_tokens(&self, tokens: &TokenSet) -> Result<(), InfraError> {
        let payload = serde_json::to_string(tokens)?;
        let mut guard = self
            .tokens
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = Some(payload);
        Ok(())
    }

    fn load_tokens(&self) -> Result<Option<TokenSet>, InfraError> {
        let guard = self
            .tokens
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        Ok(guard.as_deref().and_then(decode_payload))
    }

    fn delete_tokens(&self) -> Result<(), InfraError> {
        let mut guard = self
            .tokens
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = None;
        Ok(())
    }
}
