use crate::domain::models::TokenSet;
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::oauth_client::{OAuthHttpClient, RefreshRequest};
use crate::infrastructure::remote_credentials::RemoteCredentialStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const REFRESH_BUFFER_SECONDS: i64 = 300;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The bearer-token seam the media client consumes. Obtained immediately
/// before every request; never reused across suspension points.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<Option<String>, InfraError>;

    async fn force_refresh(&self) -> Result<String, InfraError>;
}

pub struct TokenRefresher<L, R, C>
where
    L: CredentialStore,
    R: RemoteCredentialStore + 'static,
    C: OAuthHttpClient,
{
    vault: Arc<CredentialVaultOf<L, R>>,
    oauth_client: Arc<C>,
    token_endpoint: String,
    client_id: String,
    refresh_lock: Mutex<()>,
    now_provider: NowProvider,
}

type CredentialVaultOf<L, R> = crate::application::credentials::CredentialVault<L, R>;

impl<L, R, C> TokenRefresher<L, R, C>
where
    L: CredentialStore,
    R: RemoteCredentialStore + 'static,
    C: OAuthHttpClient,
{
    pub fn new(
        vault: Arc<CredentialVaultOf<L, R>>,
        oauth_client: Arc<C>,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            vault,
            oauth_client,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            refresh_lock: Mutex::new(()),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    // The lock serializes concurrent callers; the post-lock re-check lets
    // late arrivals piggyback on a refresh that completed while they were
    // queued, so one expiring TokenSet costs one network refresh.
    async fn refresh_locked(&self, skip_if_valid: bool) -> Result<String, InfraError> {
        let _guard = self.refresh_lock.lock().await;

        let Some(current) = self.vault.load().await? else {
            return Err(InfraError::SessionExpired);
        };

        let now = (self.now_provider)();
        if skip_if_valid && current.is_valid_at(now, REFRESH_BUFFER_SECONDS) {
            return Ok(current.access_token);
        }

        let refreshed = self
            .oauth_client
            .refresh_access_token(RefreshRequest {
                token_endpoint: self.token_endpoint.clone(),
                client_id: self.client_id.clone(),
                refresh_token: current.refresh_token.clone(),
            })
            .await;

        match refreshed {
            Ok(response) => {
                let replacement = TokenSet {
                    access_token: response.access_token,
                    // Some provider configurations rotate the refresh token,
                    // others omit it and keep the old one valid.
                    refresh_token: response.refresh_token.unwrap_or(current.refresh_token),
                    expires_at: now + Duration::seconds(response.expires_in),
                };
                replacement.validate().map_err(InfraError::Validation)?;
                self.vault.save(&replacement).await?;
                Ok(replacement.access_token)
            }
            Err(error) => {
                // Terminal: a refresh token that failed once cannot be
                // trusted again. Drop everything and require a reconnect.
                // A store that refuses the delete must not downgrade the
                // outcome; the caller still has to see the session as dead.
                tracing::warn!(%error, "token refresh failed, discarding credentials");
                if let Err(error) = self.vault.delete().await {
                    tracing::warn!(%error, "failed deleting credentials after refresh failure");
                }
                Err(InfraError::SessionExpired)
            }
        }
    }
}

#[async_trait]
impl<L, R, C> TokenSource for TokenRefresher<L, R, C>
where
    L: CredentialStore,
    R: RemoteCredentialStore + 'static,
    C: OAuthHttpClient,
{
    async fn access_token(&self) -> Result<Option<String>, InfraError> {
        let Some(current) = self.vault.load().await? else {
            return Ok(None);
        };

        let now = (self.now_provider)();
        if current.is_valid_at(now, REFRESH_BUFFER_SECONDS) {
            return Ok(Some(current.access_token));
        }

        self.refresh_locked(true).await.map(Some)
    }

    async fn force_refresh(&self) -> Result<String, InfraError> {
        self.refresh_locked(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::credentials::CredentialVault;
    use crate::infrastructure::credential_store::InMemoryCredentialStore;
    use crate::infrastructure::oauth_client::{CodeExchangeRequest, TokenResponse};
    use crate::infrastructure::remote_credentials::InMemoryRemoteCredentialStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeOAuthClient {
        refresh_calls: AtomicUsize,
        fail_refresh: bool,
    }

    impl FakeOAuthClient {
        fn succeeding() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                fail_refresh: false,
            }
        }

        fn failing() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                fail_refresh: true,
            }
        }
    }

    #[async_trait]
    impl OAuthHttpClient for FakeOAuthClient {
        async fn exchange_authorization_code(
            &self,
            _request: CodeExchangeRequest,
        ) -> Result<TokenResponse, InfraError> {
            Err(InfraError::Flow("not implemented in fake".to_string()))
        }

        async fn refresh_access_token(
            &self,
            _request: RefreshRequest,
        ) -> Result<TokenResponse, InfraError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            // Simulate network latency so concurrent callers overlap.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            if self.fail_refresh {
                return Err(InfraError::Auth("invalid_grant".to_string()));
            }
            Ok(TokenResponse {
                access_token: "a2".to_string(),
                refresh_token: Some("r2".to_string()),
                expires_in: 3600,
            })
        }
    }

    type TestVault = CredentialVault<InMemoryCredentialStore, InMemoryRemoteCredentialStore>;

    fn vault() -> Arc<TestVault> {
        Arc::new(CredentialVault::new(
            Arc::new(InMemoryCredentialStore::default()),
            Arc::new(InMemoryRemoteCredentialStore::default()),
        ))
    }

    fn refresher(
        vault: Arc<TestVault>,
        client: Arc<FakeOAuthClient>,
    ) -> TokenRefresher<InMemoryCredentialStore, InMemoryRemoteCredentialStore, FakeOAuthClient> {
        TokenRefresher::new(vault, client, "https://accounts.example.com/api/token", "client-id")
    }

    fn token_set(access: &str, refresh: &str, expires_at: DateTime<Utc>) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn fresh_token_makes_no_network_calls() {
        let vault = vault();
        vault
            .save(&token_set("a1", "r1", Utc::now() + Duration::hours(1)))
            .await
            .expect("seed tokens");

        let client = Arc::new(FakeOAuthClient::succeeding());
        let refresher = refresher(vault, Arc::clone(&client));

        let access = refresher.access_token().await.expect("access token");
        assert_eq!(access.as_deref(), Some("a1"));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_tokens_read_as_disconnected() {
        let client = Arc::new(FakeOAuthClient::succeeding());
        let refresher = refresher(vault(), Arc::clone(&client));

        assert!(refresher.access_token().await.expect("access token").is_none());
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_within_the_buffer_is_refreshed_once() {
        let vault = vault();
        // Expires in two minutes: inside the five-minute buffer.
        vault
            .save(&token_set("a1", "r1", Utc::now() + Duration::seconds(120)))
            .await
            .expect("seed tokens");

        let client = Arc::new(FakeOAuthClient::succeeding());
        let refresher = refresher(Arc::clone(&vault), Arc::clone(&client));

        let access = refresher.access_token().await.expect("access token");
        assert_eq!(access.as_deref(), Some("a2"));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);

        let persisted = vault.load().await.expect("load").expect("tokens exist");
        assert_eq!(persisted.access_token, "a2");
        assert_eq!(persisted.refresh_token, "r2");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let vault = vault();
        vault
            .save(&token_set("a1", "r1", Utc::now() - Duration::seconds(1)))
            .await
            .expect("seed expired tokens");

        let client = Arc::new(FakeOAuthClient::succeeding());
        let refresher = Arc::new(refresher(vault, Arc::clone(&client)));

        let first = Arc::clone(&refresher);
        let second = Arc::clone(&refresher);
        let (a, b) = tokio::join!(first.access_token(), second.access_token());

        assert_eq!(a.expect("first caller").as_deref(), Some("a2"));
        assert_eq!(b.expect("second caller").as_deref(), Some("a2"));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotated_refresh_token_falls_back_to_the_previous_one() {
        #[derive(Debug)]
        struct NoRotationClient;

        #[async_trait]
        impl OAuthHttpClient for NoRotationClient {
            async fn exchange_authorization_code(
                &self,
                _request: CodeExchangeRequest,
            ) -> Result<TokenResponse, InfraError> {
                Err(InfraError::Flow("not implemented in fake".to_string()))
            }

            async fn refresh_access_token(
                &self,
                request: RefreshRequest,
            ) -> Result<TokenResponse, InfraError> {
                assert_eq!(request.refresh_token, "r1");
                Ok(TokenResponse {
                    access_token: "a2".to_string(),
                    refresh_token: None,
                    expires_in: 3600,
                })
            }
        }

        let vault = vault();
        vault
            .save(&token_set("a1", "r1", Utc::now() - Duration::seconds(10)))
            .await
            .expect("seed tokens");

        let refresher = TokenRefresher::new(
            Arc::clone(&vault),
            Arc::new(NoRotationClient),
            "https://accounts.example.com/api/token",
            "client-id",
        );

        let access = refresher.access_token().await.expect("access token");
        assert_eq!(access.as_deref(), Some("a2"));

        let persisted = vault.load().await.expect("load").expect("tokens exist");
        assert_eq!(persisted.refresh_token, "r1");
    }

    #[tokio::test]
    async fn failed_refresh_is_terminal() {
        let vault = vault();
        vault
            .save(&token_set("a1", "r1", Utc::now() - Duration::seconds(1)))
            .await
            .expect("seed tokens");

        let client = Arc::new(FakeOAuthClient::failing());
        let refresher = refresher(Arc::clone(&vault), Arc::clone(&client));

        let result = refresher.access_token().await;
        assert!(matches!(result, Err(InfraError::SessionExpired)));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);

        // Credentials are gone everywhere; a later call reads disconnected.
        assert!(vault.load().await.expect("load").is_none());
        assert!(refresher.access_token().await.expect("access token").is_none());
    }

    #[tokio::test]
    async fn refresh_failure_stays_terminal_when_the_local_delete_fails() {
        #[derive(Debug, Default)]
        struct UndeletableStore {
            tokens: std::sync::Mutex<Option<TokenSet>>,
        }

        impl CredentialStore for UndeletableStore {
            fn save_tokens(&self, tokens: &TokenSet) -> Result<(), InfraError> {
                *self.tokens.lock().expect("tokens lock") = Some(tokens.clone());
                Ok(())
            }

            fn load_tokens(&self) -> Result<Option<TokenSet>, InfraError> {
                Ok(self.tokens.lock().expect("tokens lock").clone())
            }

            fn delete_tokens(&self) -> Result<(), InfraError> {
                Err(InfraError::Credential("keyring unavailable".to_string()))
            }
        }

        let vault = Arc::new(CredentialVault::new(
            Arc::new(UndeletableStore::default()),
            Arc::new(InMemoryRemoteCredentialStore::default()),
        ));
        vault
            .save(&token_set("a1", "r1", Utc::now() - Duration::seconds(1)))
            .await
            .expect("seed tokens");

        let client = Arc::new(FakeOAuthClient::failing());
        let refresher = TokenRefresher::new(
            vault,
            Arc::clone(&client),
            "https://accounts.example.com/api/token",
            "client-id",
        );

        // The store error must not replace the terminal condition; only
        // SessionExpired routes the controller to the reconnect affordance.
        let result = refresher.access_token().await;
        assert!(matches!(result, Err(InfraError::SessionExpired)));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_ignores_the_local_expiry_estimate() {
        let vault = vault();
        vault
            .save(&token_set("a1", "r1", Utc::now() + Duration::hours(2)))
            .await
            .expect("seed tokens");

        let client = Arc::new(FakeOAuthClient::succeeding());
        let refresher = refresher(vault, Arc::clone(&client));

        let access = refresher.force_refresh().await.expect("force refresh");
        assert_eq!(access, "a2");
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);
    }
}
