use crate::domain::models::TokenSet;
use crate::infrastructure::config::MediaSessionSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::oauth_client::{CodeExchangeRequest, OAuthHttpClient};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use url::Url;

const VERIFIER_TTL_SECONDS: i64 = 600;
const VERIFIER_ENTROPY_BYTES: usize = 64;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

impl AuthConfig {
    pub fn from_settings(settings: &MediaSessionSettings) -> Self {
        Self {
            client_id: settings.client_id.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            scopes: settings.scopes.clone(),
            authorization_endpoint: settings.authorization_endpoint.clone(),
            token_endpoint: settings.token_endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVerifier {
    pub verifier: String,
    pub issued_at: DateTime<Utc>,
}

/// Short-lived, flow-scoped storage for the PKCE verifier. `take` removes
/// the entry, which is what makes the code exchange at-most-once.
pub trait VerifierStore: Send + Sync {
    fn put(&self, verifier: StoredVerifier) -> Result<(), InfraError>;
    fn take(&self) -> Result<Option<StoredVerifier>, InfraError>;
    fn clear(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Default)]
pub struct InMemoryVerifierStore {
    slot: Mutex<Option<StoredVerifier>>,
}

impl VerifierStore for InMemoryVerifierStore {
    fn put(&self, verifier: StoredVerifier) -> Result<(), InfraError> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|error| InfraError::Credential(format!("verifier lock poisoned: {error}")))?;
        *guard = Some(verifier);
        Ok(())
    }

    fn take(&self) -> Result<Option<StoredVerifier>, InfraError> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|error| InfraError::Credential(format!("verifier lock poisoned: {error}")))?;
        Ok(guard.take())
    }

    fn clear(&self) -> Result<(), InfraError> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|error| InfraError::Credential(format!("verifier lock poisoned: {error}")))?;
        *guard = None;
        Ok(())
    }
}

pub struct PkceAuthFlow<V, C>
where
    V: VerifierStore,
    C: OAuthHttpClient,
{
    config: AuthConfig,
    verifier_store: Arc<V>,
    oauth_client: Arc<C>,
    now_provider: NowProvider,
}

impl<V, C> PkceAuthFlow<V, C>
where
    V: VerifierStore,
    C: OAuthHttpClient,
{
    pub fn new(config: AuthConfig, verifier_store: Arc<V>, oauth_client: Arc<C>) -> Self {
        Self {
            config,
            verifier_store,
            oauth_client,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn begin(&self) -> Result<String, InfraError> {
        if self.config.scopes.is_empty() {
            return Err(InfraError::Flow("at least one scope is required".to_string()));
        }

        let verifier = generate_verifier();
        let challenge = derive_challenge(&verifier);

        self.verifier_store.put(StoredVerifier {
            verifier,
            issued_at: (self.now_provider)(),
        })?;

        let mut url = Url::parse(&self.config.authorization_endpoint)
            .map_err(|error| InfraError::Flow(format!("invalid authorization endpoint: {error}")))?;
        let scope = self.config.scopes.join(" ");

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        Ok(url.to_string())
    }

    pub async fn complete(&self, authorization_code: &str) -> Result<TokenSet, InfraError> {
        if authorization_code.trim().is_empty() {
            return Err(InfraError::Flow("authorization code must not be empty".to_string()));
        }

        let Some(stored) = self.verifier_store.take()? else {
            return Err(InfraError::MissingVerifier);
        };

        let now = (self.now_provider)();
        if now - stored.issued_at > Duration::seconds(VERIFIER_TTL_SECONDS) {
            tracing::debug!("discarding stale pkce verifier");
            return Err(InfraError::MissingVerifier);
        }

        let response = self
            .oauth_client
            .exchange_authorization_code(CodeExchangeRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                redirect_uri: self.config.redirect_uri.clone(),
                authorization_code: authorization_code.to_string(),
                code_verifier: stored.verifier,
            })
            .await?;

        let refresh_token = response.refresh_token.ok_or_else(|| {
            InfraError::Validation("code exchange response missing refresh token".to_string())
        })?;

        let tokens = TokenSet {
            access_token: response.access_token,
            refresh_token,
            expires_at: now + Duration::seconds(response.expires_in),
        };
        tokens.validate().map_err(InfraError::Validation)?;
        Ok(tokens)
    }

    pub fn abandon(&self) -> Result<(), InfraError> {
        self.verifier_store.clear()
    }
}

/// Object-safe face of the PKCE flow, consumed by the session controller.
#[async_trait]
pub trait AuthFlow: Send + Sync {
    fn begin(&self) -> Result<String, InfraError>;
    async fn complete(&self, authorization_code: &str) -> Result<TokenSet, InfraError>;
    fn abandon(&self) -> Result<(), InfraError>;
}

#[async_trait]
impl<V, C> AuthFlow for PkceAuthFlow<V, C>
where
    V: VerifierStore,
    C: OAuthHttpClient,
{
    fn begin(&self) -> Result<String, InfraError> {
        PkceAuthFlow::begin(self)
    }

    async fn complete(&self, authorization_code: &str) -> Result<TokenSet, InfraError> {
        PkceAuthFlow::complete(self, authorization_code).await
    }

    fn abandon(&self) -> Result<(), InfraError> {
        PkceAuthFlow::abandon(self)
    }
}

fn generate_verifier() -> String {
    let mut entropy = [0u8; VERIFIER_ENTROPY_BYTES];
    rand::rng().fill_bytes(&mut entropy);
    URL_SAFE_NO_PAD.encode(entropy)
}

fn derive_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
