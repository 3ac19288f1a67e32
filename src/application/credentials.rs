use crate::domain::models::TokenSet;
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_credentials::RemoteCredentialStore;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct PendingTokenSlot {
    slot: Mutex<Option<TokenSet>>,
}

impl PendingTokenSlot {
    pub fn put(&self, tokens: TokenSet) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = Some(tokens);
        }
    }

    pub fn take(&self) -> Option<TokenSet> {
        self.slot.lock().ok().and_then(|mut guard| guard.take())
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = None;
        }
    }
}

pub struct CredentialVault<L, R>
where
    L: CredentialStore,
    R: RemoteCredentialStore + 'static,
{
    cache: Mutex<Option<TokenSet>>,
    pending: Arc<PendingTokenSlot>,
    local: Arc<L>,
    remote: Arc<R>,
    user_id: Mutex<Option<String>>,
}

impl<L, R> CredentialVault<L, R>
where
    L: CredentialStore,
    R: RemoteCredentialStore + 'static,
{
    pub fn new(local: Arc<L>, remote: Arc<R>) -> Self {
        Self {
            cache: Mutex::new(None),
            pending: Arc::new(PendingTokenSlot::default()),
            local,
            remote,
            user_id: Mutex::new(None),
        }
    }

    pub fn pending_slot(&self) -> Arc<PendingTokenSlot> {
        Arc::clone(&self.pending)
    }

    pub fn set_user(&self, user_id: impl Into<String>) {
        if let Ok(mut guard) = self.user_id.lock() {
            *guard = Some(user_id.into());
        }
    }

    pub fn clear_user(&self) {
        if let Ok(mut guard) = self.user_id.lock() {
            *guard = None;
        }
    }

    fn current_user(&self) -> Option<String> {
        self.user_id.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn cached(&self) -> Option<TokenSet> {
        self.cache.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_cache(&self, tokens: Option<TokenSet>) {
        if let Ok(mut guard) = self.cache.lock() {
            *guard = tokens;
        }
    }

    // First match wins: cache, pending slot (consumed), local store,
    // remote backup (mirrored locally on success).
    pub async fn load(&self) -> Result<Option<TokenSet>, InfraError> {
        if let Some(cached) = self.cached() {
            if cached.validate().is_ok() {
                return Ok(Some(cached));
            }
            self.set_cache(None);
        }

        if let Some(pending) = self.pending.take() {
            if pending.validate().is_ok() {
                self.local.save_tokens(&pending)?;
                self.set_cache(Some(pending.clone()));
                self.spawn_remote_upsert(pending.clone());
                return Ok(Some(pending));
            }
            tracing::warn!("discarding malformed pending tokens");
        }

        if let Some(local) = self.local.load_tokens()? {
            self.set_cache(Some(local.clone()));
            return Ok(Some(local));
        }

        let Some(user_id) = self.current_user() else {
            return Ok(None);
        };
        match self.remote.load(&user_id).await {
            Ok(Some(remote)) => {
                if let Err(error) = self.local.save_tokens(&remote) {
                    tracing::warn!(%error, "failed mirroring backup credentials locally");
                }
                self.set_cache(Some(remote.clone()));
                Ok(Some(remote))
            }
            Ok(None) => Ok(None),
            Err(error) => {
                // Remote is a backup; an unreachable backup reads as absent.
                tracing::warn!(%error, "credential backup read failed");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, tokens: &TokenSet) -> Result<(), InfraError> {
        tokens.validate().map_err(InfraError::Validation)?;
        self.local.save_tokens(tokens)?;
        self.set_cache(Some(tokens.clone()));
        self.spawn_remote_upsert(tokens.clone());
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), InfraError> {
        self.set_cache(None);
        self.pending.clear();
        self.local.delete_tokens()?;

        if let Some(user_id) = self.current_user() {
            let remote = Arc::clone(&self.remote);
            tokio::spawn(async move {
                if let Err(error) = remote.delete(&user_id).await {
                    tracing::warn!(%error, "credential backup delete failed");
                }
            });
        }
        Ok(())
    }

    fn spawn_remote_upsert(&self, tokens: TokenSet) {
        let Some(user_id) = self.current_user() else {
            return;
        };
        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move {
            if let Err(error) = remote.upsert(&user_id, &tokens).await {
                tracing::warn!(%error, "credential backup write failed");
            }
        });
    }
}

/// The slice of the vault the session controller needs, object-safe so the
/// controller does not have to carry the store type parameters.
#[async_trait]
pub trait TokenVault: Send + Sync {
    fn set_user(&self, user_id: &str);
    fn clear_user(&self);
    async fn save(&self, tokens: &TokenSet) -> Result<(), InfraError>;
    async fn delete(&self) -> Result<(), InfraError>;
}

#[async_trait]
impl<L, R> TokenVault for CredentialVault<L, R>
where
    L: CredentialStore + 'static,
    R: RemoteCredentialStore + 'static,
{
    fn set_user(&self, user_id: &str) {
        CredentialVault::set_user(self, user_id);
    }

    fn clear_user(&self) {
        CredentialVault::clear_user(self);
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), InfraError> {
        CredentialVault::save(self, tokens).await
    }

    async fn delete(&self) -> Result<(), InfraError> {
        CredentialVault::delete(self).await
    }
}
