use crate::application::token_refresher::TokenSource;
use crate::domain::models::{Device, PlaybackSnapshot, RepeatMode, Track, UserProfile};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::media_api::MediaApi;
use std::future::Future;
use std::sync::Arc;

pub struct MediaService<A, T>
where
    A: MediaApi,
    T: TokenSource,
{
    api: Arc<A>,
    tokens: Arc<T>,
}

impl<A, T> MediaService<A, T>
where
    A: MediaApi,
    T: TokenSource,
{
    pub fn new(api: Arc<A>, tokens: Arc<T>) -> Self {
        Self { api, tokens }
    }

    async fn bearer(&self) -> Result<String, InfraError> {
        self.tokens
            .access_token()
            .await?
            .ok_or_else(|| InfraError::Auth("no active session".to_string()))
    }

    // On an auth rejection, force one refresh and retry once. A second
    // rejection propagates so expiry handling stays with the caller.
    async fn with_auth_retry<Out, F, Fut>(&self, call: F) -> Result<Out, InfraError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Out, InfraError>>,
    {
        let token = self.bearer().await?;
        match call(token).await {
            Err(InfraError::Auth(_)) => {
                let token = self.tokens.force_refresh().await?;
                call(token).await
            }
            other => other,
        }
    }

    pub async fn profile(&self) -> Result<UserProfile, InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.profile(&token).await }
        })
        .await
    }

    pub async fn playback_state(&self) -> Result<Option<PlaybackSnapshot>, InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.playback_state(&token).await }
        })
        .await
    }

    pub async fn devices(&self) -> Result<Vec<Device>, InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.devices(&token).await }
        })
        .await
    }

    pub async fn recently_played(&self, limit: u8) -> Result<Vec<Track>, InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.recently_played(&token, limit).await }
        })
        .await
    }

    pub async fn is_track_saved(&self, track_id: &str) -> Result<bool, InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.is_track_saved(&token, track_id).await }
        })
        .await
    }

    pub async fn save_track(&self, track_id: &str) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.save_track(&token, track_id).await }
        })
        .await
    }

    pub async fn remove_saved_track(&self, track_id: &str) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.remove_saved_track(&token, track_id).await }
        })
        .await
    }

    pub async fn play(&self, device_id: Option<&str>) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.play(&token, device_id).await }
        })
        .await
    }

    pub async fn pause(&self) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.pause(&token).await }
        })
        .await
    }

    pub async fn next_track(&self) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.next_track(&token).await }
        })
        .await
    }

    pub async fn previous_track(&self) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.previous_track(&token).await }
        })
        .await
    }

    pub async fn seek(&self, position_ms: u64) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.seek(&token, position_ms).await }
        })
        .await
    }

    pub async fn set_volume(&self, volume_percent: u8) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.set_volume(&token, volume_percent).await }
        })
        .await
    }

    pub async fn set_shuffle(&self, shuffle: bool) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.set_shuffle(&token, shuffle).await }
        })
        .await
    }

    pub async fn set_repeat(&self, mode: RepeatMode) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.set_repeat(&token, mode).await }
        })
        .await
    }

    pub async fn transfer_playback(&self, device_id: &str) -> Result<(), InfraError> {
        let api = Arc::clone(&self.api);
        self.with_auth_retry(move |token| {
            let api = Arc::clone(&api);
            async move { api.transfer_playback(&token, device_id).await }
        })
        .await
    }
}
