use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const HTTP_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct CodeExchangeRequest {
    pub token_endpoint: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub authorization_code: String,
    pub code_verifier: String,
}

#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub token_endpoint: String,
    pub client_id: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Token-endpoint surface of the media provider. The app is a public PKCE
/// client, so no client secret is ever sent.
#[async_trait]
pub trait OAuthHttpClient: Send + Sync {
    async fn exchange_authorization_code(
        &self,
        request: CodeExchangeRequest,
    ) -> Result<TokenResponse, InfraError>;

    async fn refresh_access_token(&self, request: RefreshRequest) -> Result<TokenResponse, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestOAuthClient {
    client: Client,
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponsePayload {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl ReqwestOAuthClient {
    pub fn new() -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| InfraError::Transient(format!("failed building http client: {error}")))?;
        Ok(Self { client })
    }

    async fn post_form(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<TokenResponse, InfraError> {
        let response = self
            .client
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("token request failed: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Transient(format!("failed reading token response: {error}")))?;

        if status.is_server_error() {
            return Err(InfraError::Transient(format!(
                "token endpoint unavailable: http {}",
                status.as_u16()
            )));
        }

        let parsed = serde_json::from_str::<TokenResponsePayload>(&body).map_err(|error| {
            InfraError::Validation(format!("invalid token response payload: {error}"))
        })?;

        if !status.is_success() || parsed.error.is_some() {
            let code = parsed
                .error
                .unwrap_or_else(|| format!("http_{}", status.as_u16()));
            let detail = parsed.error_description.unwrap_or_else(|| body.clone());
            return Err(InfraError::Auth(format!("token endpoint error: {code}; {detail}")));
        }

        let access_token = parsed
            .access_token
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                InfraError::Validation("token response missing access_token".to_string())
            })?;

        Ok(TokenResponse {
            access_token,
            refresh_token: parsed.refresh_token.filter(|value| !value.trim().is_empty()),
            expires_in: parsed.expires_in.unwrap_or(0).max(0),
        })
    }
}

#[async_trait]
impl OAuthHttpClient for ReqwestOAuthClient {
    async fn exchange_authorization_code(
        &self,
        request: CodeExchangeRequest,
    ) -> Result<TokenResponse, InfraError> {
        self.post_form(
            &request.token_endpoint,
            &[
                ("grant_type", "authorization_code".to_string()),
                ("client_id", request.client_id),
                ("code", request.authorization_code),
                ("code_verifier", request.code_verifier),
                ("redirect_uri", request.redirect_uri),
            ],
        )
        .await
    }

    async fn refresh_access_token(&self, request: RefreshRequest) -> Result<TokenResponse, InfraError> {
        self.post_form(
            &request.token_endpoint,
            &[
                ("grant_type", "refresh_token".to_string()),
                ("client_id", request.client_id),
                ("refresh_token", request.refresh_token),
            ],
        )
        .await
    }
}
