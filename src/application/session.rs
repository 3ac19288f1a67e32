use crate::application::auth_flow::AuthFlow;
use crate::application::credentials::TokenVault;
use crate::application::media_service::MediaService;
use crate::application::token_refresher::TokenSource;
use crate::domain::models::{
    ConnectionState, PlaybackSnapshot, Presentation, RepeatMode, SessionState, Track,
};
use crate::infrastructure::artwork::{self, ArtworkFetcher};
use crate::infrastructure::config::MediaSessionSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::media_api::MediaApi;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const RECENT_TRACKS_LIMIT: u8 = 20;

#[derive(Debug, Clone, Copy)]
pub struct PollingPolicy {
    pub tick_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub command_refetch_delay_ms: u64,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            poll_interval_ms: 5_000,
            command_refetch_delay_ms: 500,
        }
    }
}

impl PollingPolicy {
    pub fn from_settings(settings: &MediaSessionSettings) -> Self {
        Self {
            tick_interval_ms: settings.tick_interval_ms,
            poll_interval_ms: settings.poll_interval_ms,
            command_refetch_delay_ms: settings.command_refetch_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpPhase {
    Idle,
    InFlight,
    Done,
}

#[derive(Default)]
struct TimerHandles {
    tick: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

pub struct SessionController<A, T>
where
    A: MediaApi + 'static,
    T: TokenSource + 'static,
{
    media: Arc<MediaService<A, T>>,
    auth: Arc<dyn AuthFlow>,
    vault: Arc<dyn TokenVault>,
    artwork: Arc<dyn ArtworkFetcher>,
    policy: PollingPolicy,
    state: watch::Sender<SessionState>,
    init_phase: Mutex<OpPhase>,
    timers: Mutex<TimerHandles>,
}

impl<A, T> SessionController<A, T>
where
    A: MediaApi + 'static,
    T: TokenSource + 'static,
{
    pub fn new(
        media: Arc<MediaService<A, T>>,
        auth: Arc<dyn AuthFlow>,
        vault: Arc<dyn TokenVault>,
        artwork: Arc<dyn ArtworkFetcher>,
        policy: PollingPolicy,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::default());
        Arc::new(Self {
            media,
            auth,
            vault,
            artwork,
            policy,
            state,
            init_phase: Mutex::new(OpPhase::Idle),
            timers: Mutex::new(TimerHandles::default()),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn connect(&self) -> Result<String, InfraError> {
        self.auth.begin()
    }

    pub async fn handle_callback(self: &Arc<Self>, code: &str) -> Result<(), InfraError> {
        if !self.claim_init() {
            tracing::debug!("ignoring auth callback, initialization already underway");
            return Ok(());
        }
        self.set_connection(ConnectionState::Initializing);

        match self.bring_up_from_code(code).await {
            Ok(()) => {
                self.finish_init(OpPhase::Done);
                Ok(())
            }
            Err(error) => {
                self.finish_init(OpPhase::Idle);
                self.set_connection(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    pub async fn initialize_session(self: &Arc<Self>) -> Result<(), InfraError> {
        if !self.claim_init() {
            return Ok(());
        }
        self.set_connection(ConnectionState::Initializing);

        match self.media.profile().await {
            Ok(profile) => {
                self.establish(profile.id.clone()).await;
                self.state.send_modify(|state| state.profile = Some(profile));
                self.finish_init(OpPhase::Done);
                Ok(())
            }
            Err(error) if error.is_auth() => {
                // No usable credentials anywhere. Not an error; the user
                // simply has not connected yet.
                self.finish_init(OpPhase::Idle);
                self.set_connection(ConnectionState::Disconnected);
                Ok(())
            }
            Err(error) => {
                self.finish_init(OpPhase::Idle);
                self.set_connection(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    async fn bring_up_from_code(self: &Arc<Self>, code: &str) -> Result<(), InfraError> {
        let tokens = self.auth.complete(code).await?;
        self.vault.save(&tokens).await?;

        let profile = self.media.profile().await?;
        self.establish(profile.id.clone()).await;
        self.state.send_modify(|state| state.profile = Some(profile));
        Ok(())
    }

    async fn establish(self: &Arc<Self>, user_id: String) {
        self.vault.set_user(&user_id);
        self.state.send_modify(|state| {
            state.connection = ConnectionState::Connected;
            state.last_error = None;
        });
        self.hydrate().await;
        self.sync_timers();
    }

    async fn hydrate(self: &Arc<Self>) {
        match self.media.playback_state().await {
            Ok(snapshot) => self.apply_snapshot(snapshot),
            Err(error) => tracing::warn!(%error, "initial playback fetch failed"),
        }

        match self.media.devices().await {
            Ok(devices) => self.state.send_modify(|state| state.devices = devices),
            Err(error) => tracing::warn!(%error, "initial device fetch failed"),
        }

        match self.media.recently_played(RECENT_TRACKS_LIMIT).await {
            Ok(tracks) => self.state.send_modify(|state| state.recent_tracks = tracks),
            Err(error) => tracing::warn!(%error, "initial recent-tracks fetch failed"),
        }
    }

    pub async fn refresh_playback(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        match self.media.playback_state().await {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot);
                self.sync_timers();
            }
            Err(error) if error.is_auth() => {
                self.expire_session("session expired, reconnect required").await;
            }
            Err(error) => self.note_failure("playback refresh", &error),
        }
    }

    fn apply_snapshot(self: &Arc<Self>, snapshot: Option<PlaybackSnapshot>) {
        let previous_id = {
            let state = self.state.borrow();
            state
                .playback
                .as_ref()
                .and_then(|playback| playback.track.as_ref())
                .map(|track| track.id.clone())
        };
        let current = snapshot
            .as_ref()
            .and_then(|playback| playback.track.clone());
        let track_changed = previous_id.as_deref() != current.as_ref().map(|track| track.id.as_str());

        self.state.send_modify(|state| {
            state.playback = snapshot;
            if track_changed {
                state.presentation = None;
                state.current_track_liked = false;
            }
        });

        if track_changed {
            if let Some(track) = current {
                self.spawn_track_side_effects(track);
            }
        }
    }

    fn spawn_track_side_effects(self: &Arc<Self>, track: Track) {
        let controller = Arc::downgrade(self);
        let media = Arc::clone(&self.media);
        let fetcher = Arc::clone(&self.artwork);

        tokio::spawn(async move {
            let liked = match media.is_track_saved(&track.id).await {
                Ok(liked) => Some(liked),
                Err(error) => {
                    tracing::warn!(%error, track = %track.id, "liked-status check failed");
                    None
                }
            };

            let presentation = match &track.artwork_url {
                Some(url) => match derive_presentation(fetcher.as_ref(), &track.id, url).await {
                    Ok(presentation) => Some(presentation),
                    Err(error) => {
                        tracing::debug!(%error, track = %track.id, "presentation derivation failed");
                        None
                    }
                },
                None => None,
            };

            let Some(controller) = controller.upgrade() else {
                return;
            };
            controller.state.send_modify(|state| {
                let still_current = state
                    .playback
                    .as_ref()
                    .and_then(|playback| playback.track.as_ref())
                    .is_some_and(|current| current.id == track.id);
                if !still_current {
                    return;
                }
                if let Some(liked) = liked {
                    state.current_track_liked = liked;
                }
                if presentation.is_some() {
                    state.presentation = presentation;
                }
            });
        });
    }

    // ---- command surface -------------------------------------------------
    // Commands are meaningful only on a live session. A stray command from
    // a disconnected UI is dropped rather than routed through the auth
    // error path, which would masquerade as an expired session.

    pub async fn play(self: &Arc<Self>, device_id: Option<&str>) {
        if !self.is_connected() {
            return;
        }
        self.with_playback(|playback| playback.is_playing = true);
        if let Err(error) = self.media.play(device_id).await {
            self.command_failed("play", error).await;
            return;
        }
        self.spawn_delayed_refetch();
        self.sync_timers();
    }

    pub async fn pause(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        self.with_playback(|playback| playback.is_playing = false);
        if let Err(error) = self.media.pause().await {
            self.command_failed("pause", error).await;
            return;
        }
        self.sync_timers();
    }

    pub async fn toggle_play_pause(self: &Arc<Self>) {
        let playing = {
            let state = self.state.borrow();
            state
                .playback
                .as_ref()
                .is_some_and(|playback| playback.is_playing)
        };
        if playing {
            self.pause().await;
        } else {
            self.play(None).await;
        }
    }

    pub async fn next(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        if let Err(error) = self.media.next_track().await {
            self.command_failed("next", error).await;
            return;
        }
        self.spawn_delayed_refetch();
    }

    pub async fn previous(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        if let Err(error) = self.media.previous_track().await {
            self.command_failed("previous", error).await;
            return;
        }
        self.spawn_delayed_refetch();
    }

    pub async fn seek(self: &Arc<Self>, position_ms: u64) {
        if !self.is_connected() {
            return;
        }
        self.with_playback(|playback| {
            playback.progress_ms = position_ms.min(playback.duration_ms);
        });
        if let Err(error) = self.media.seek(position_ms).await {
            self.command_failed("seek", error).await;
        }
    }

    pub async fn set_volume(self: &Arc<Self>, volume_percent: u8) {
        if !self.is_connected() {
            return;
        }
        let volume_percent = volume_percent.min(100);
        self.with_playback(|playback| playback.device_volume = volume_percent);
        if let Err(error) = self.media.set_volume(volume_percent).await {
            self.command_failed("set volume", error).await;
        }
    }

    pub async fn toggle_shuffle(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let desired = {
            let state = self.state.borrow();
            !state
                .playback
                .as_ref()
                .is_some_and(|playback| playback.shuffle)
        };
        self.with_playback(|playback| playback.shuffle = desired);
        if let Err(error) = self.media.set_shuffle(desired).await {
            self.command_failed("toggle shuffle", error).await;
        }
    }

    pub async fn cycle_repeat(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let desired = {
            let state = self.state.borrow();
            state
                .playback
                .as_ref()
                .map_or(RepeatMode::Off, |playback| playback.repeat)
                .cycle()
        };
        self.with_playback(|playback| playback.repeat = desired);
        if let Err(error) = self.media.set_repeat(desired).await {
            self.command_failed("cycle repeat", error).await;
        }
    }

    pub async fn toggle_like(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let (track_id, liked) = {
            let state = self.state.borrow();
            let track_id = state
                .playback
                .as_ref()
                .and_then(|playback| playback.track.as_ref())
                .map(|track| track.id.clone());
            (track_id, state.current_track_liked)
        };
        let Some(track_id) = track_id else {
            return;
        };

        self.state
            .send_modify(|state| state.current_track_liked = !liked);
        let result = if liked {
            self.media.remove_saved_track(&track_id).await
        } else {
            self.media.save_track(&track_id).await
        };
        if let Err(error) = result {
            self.command_failed("toggle like", error).await;
        }
    }

    pub async fn transfer_to_device(self: &Arc<Self>, device_id: &str) {
        if !self.is_connected() {
            return;
        }
        self.state.send_modify(|state| {
            for device in &mut state.devices {
                device.is_active = device.id == device_id;
            }
        });
        if let Err(error) = self.media.transfer_playback(device_id).await {
            self.command_failed("transfer playback", error).await;
            return;
        }
        self.spawn_delayed_refetch();
    }

    pub async fn disconnect(&self) {
        self.abort_timers();
        self.finish_init(OpPhase::Idle);

        if let Err(error) = self.auth.abandon() {
            tracing::warn!(%error, "failed clearing pending auth flow");
        }
        if let Err(error) = self.vault.delete().await {
            tracing::warn!(%error, "failed deleting credentials on disconnect");
        }
        self.vault.clear_user();

        self.state.send_modify(|state| *state = SessionState::default());
    }

    // ---- internals -------------------------------------------------------

    fn claim_init(&self) -> bool {
        let Ok(mut phase) = self.init_phase.lock() else {
            return false;
        };
        if *phase != OpPhase::Idle {
            return false;
        }
        *phase = OpPhase::InFlight;
        true
    }

    fn finish_init(&self, next: OpPhase) {
        if let Ok(mut phase) = self.init_phase.lock() {
            *phase = next;
        }
    }

    fn set_connection(&self, connection: ConnectionState) {
        self.state.send_modify(|state| state.connection = connection);
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connection == ConnectionState::Connected
    }

    fn with_playback(&self, mutate: impl FnOnce(&mut PlaybackSnapshot)) {
        self.state.send_modify(|state| {
            if let Some(playback) = &mut state.playback {
                mutate(playback);
            }
        });
    }

    fn note_failure(&self, what: &str, error: &InfraError) {
        tracing::warn!(%error, "{what} failed");
        let message = format!("{what} failed: {error}");
        self.state
            .send_modify(|state| state.last_error = Some(message));
    }

    async fn command_failed(&self, what: &str, error: InfraError) {
        if error.is_auth() {
            self.expire_session("session expired, reconnect required").await;
        } else {
            // The optimistic update stands; the next authoritative poll
            // reconciles any divergence.
            self.note_failure(what, &error);
        }
    }

    async fn expire_session(&self, reason: &str) {
        self.abort_timers();
        self.finish_init(OpPhase::Idle);

        if let Err(error) = self.vault.delete().await {
            tracing::warn!(%error, "failed deleting credentials on expiry");
        }
        self.vault.clear_user();

        let reason = reason.to_string();
        self.state.send_modify(|state| {
            *state = SessionState::default();
            state.connection = ConnectionState::Error(reason);
        });
    }

    fn sync_timers(self: &Arc<Self>) {
        let should_run = {
            let state = self.state.borrow();
            state.connection == ConnectionState::Connected
                && state
                    .playback
                    .as_ref()
                    .is_some_and(|playback| playback.is_playing)
        };
        if should_run {
            self.ensure_timers();
        } else {
            self.abort_timers();
        }
    }

    fn ensure_timers(self: &Arc<Self>) {
        let Ok(mut timers) = self.timers.lock() else {
            return;
        };

        if timers.tick.is_none() {
            let weak = Arc::downgrade(self);
            let quantum = self.policy.tick_interval_ms;
            timers.tick = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(quantum)).await;
                    let Some(controller) = weak.upgrade() else {
                        break;
                    };
                    controller.state.send_modify(|state| {
                        if let Some(playback) = &mut state.playback {
                            playback.tick(quantum);
                        }
                    });
                }
            }));
        }

        if timers.poll.is_none() {
            let weak = Arc::downgrade(self);
            let interval = self.policy.poll_interval_ms;
            timers.poll = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(interval)).await;
                    let Some(controller) = weak.upgrade() else {
                        break;
                    };
                    controller.refresh_playback().await;
                }
            }));
        }
    }

    fn abort_timers(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.tick.take() {
                handle.abort();
            }
            if let Some(handle) = timers.poll.take() {
                handle.abort();
            }
        }
    }

    fn spawn_delayed_refetch(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.policy.command_refetch_delay_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            controller.refresh_playback().await;
        });
    }
}

async fn derive_presentation(
    fetcher: &dyn ArtworkFetcher,
    track_id: &str,
    artwork_url: &str,
) -> Result<Presentation, InfraError> {
    let bytes = fetcher.fetch(artwork_url).await?;
    let rgb = artwork::dominant_color(&bytes)?;
    Ok(Presentation {
        track_id: track_id.to_string(),
        dominant_color: artwork::color_hex(rgb),
        mood: artwork::mood_from_color(rgb),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Device, TokenSet, UserProfile};
    use async_trait::async_trait;
    use chrono::Utc;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeMediaApi {
        playback: Mutex<Option<PlaybackSnapshot>>,
        liked: AtomicBool,
        fail_commands: AtomicBool,
        profile_calls: AtomicUsize,
        playback_calls: AtomicUsize,
        play_calls: AtomicUsize,
        pause_calls: AtomicUsize,
        next_calls: AtomicUsize,
        save_calls: AtomicUsize,
        remove_calls: AtomicUsize,
        last_repeat: Mutex<Option<RepeatMode>>,
        last_seek: Mutex<Option<u64>>,
    }

    impl FakeMediaApi {
        fn with_playback(snapshot: PlaybackSnapshot) -> Self {
            Self {
                playback: Mutex::new(Some(snapshot)),
                ..Self::default()
            }
        }

        fn command_result(&self) -> Result<(), InfraError> {
            if self.fail_commands.load(Ordering::SeqCst) {
                Err(InfraError::Transient("http 503".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MediaApi for FakeMediaApi {
        async fn profile(&self, _access_token: &str) -> Result<UserProfile, InfraError> {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            Ok(UserProfile {
                id: "user-1".to_string(),
                display_name: "Listener".to_string(),
            })
        }

        async fn playback_state(
            &self,
            _access_token: &str,
        ) -> Result<Option<PlaybackSnapshot>, InfraError> {
            self.playback_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.playback.lock().expect("playback lock").clone())
        }

        async fn devices(&self, _access_token: &str) -> Result<Vec<Device>, InfraError> {
            Ok(vec![Device {
                id: "device-1".to_string(),
                name: "Desk speaker".to_string(),
                is_active: true,
                volume_percent: 50,
            }])
        }

        async fn recently_played(
            &self,
            _access_token: &str,
            _limit: u8,
        ) -> Result<Vec<Track>, InfraError> {
            Ok(Vec::new())
        }

        async fn is_track_saved(
            &self,
            _access_token: &str,
            _track_id: &str,
        ) -> Result<bool, InfraError> {
            Ok(self.liked.load(Ordering::SeqCst))
        }

        async fn save_track(&self, _access_token: &str, _track_id: &str) -> Result<(), InfraError> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            self.liked.store(true, Ordering::SeqCst);
            self.command_result()
        }

        async fn remove_saved_track(
            &self,
            _access_token: &str,
            _track_id: &str,
        ) -> Result<(), InfraError> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            self.liked.store(false, Ordering::SeqCst);
            self.command_result()
        }

        async fn play(
            &self,
            _access_token: &str,
            _device_id: Option<&str>,
        ) -> Result<(), InfraError> {
            self.play_calls.fetch_add(1, Ordering::SeqCst);
            self.command_result()
        }

        async fn pause(&self, _access_token: &str) -> Result<(), InfraError> {
            self.pause_calls.fetch_add(1, Ordering::SeqCst);
            self.command_result()
        }

        async fn next_track(&self, _access_token: &str) -> Result<(), InfraError> {
            self.next_calls.fetch_add(1, Ordering::SeqCst);
            self.command_result()
        }

        async fn previous_track(&self, _access_token: &str) -> Result<(), InfraError> {
            self.command_result()
        }

        async fn seek(&self, _access_token: &str, position_ms: u64) -> Result<(), InfraError> {
            *self.last_seek.lock().expect("seek lock") = Some(position_ms);
            self.command_result()
        }

        async fn set_volume(
            &self,
            _access_token: &str,
            _volume_percent: u8,
        ) -> Result<(), InfraError> {
            self.command_result()
        }

        async fn set_shuffle(&self, _access_token: &str, _shuffle: bool) -> Result<(), InfraError> {
            self.command_result()
        }

        async fn set_repeat(&self, _access_token: &str, mode: RepeatMode) -> Result<(), InfraError> {
            *self.last_repeat.lock().expect("repeat lock") = Some(mode);
            self.command_result()
        }

        async fn transfer_playback(
            &self,
            _access_token: &str,
            _device_id: &str,
        ) -> Result<(), InfraError> {
            self.command_result()
        }
    }

    #[derive(Debug)]
    struct FakeTokenSource {
        token: Mutex<Option<String>>,
    }

    impl FakeTokenSource {
        fn connected() -> Self {
            Self {
                token: Mutex::new(Some("token".to_string())),
            }
        }

        fn empty() -> Self {
            Self {
                token: Mutex::new(None),
            }
        }

        fn expire(&self) {
            *self.token.lock().expect("token lock") = None;
        }
    }

    #[async_trait]
    impl TokenSource for FakeTokenSource {
        async fn access_token(&self) -> Result<Option<String>, InfraError> {
            Ok(self.token.lock().expect("token lock").clone())
        }

        async fn force_refresh(&self) -> Result<String, InfraError> {
            match self.token.lock().expect("token lock").clone() {
                Some(token) => Ok(token),
                None => Err(InfraError::SessionExpired),
            }
        }
    }

    #[derive(Debug, Default)]
    struct FakeAuthFlow {
        fail_complete: AtomicBool,
        complete_calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthFlow for FakeAuthFlow {
        fn begin(&self) -> Result<String, InfraError> {
            Ok("https://accounts.example.com/authorize?code_challenge=c".to_string())
        }

        async fn complete(&self, _authorization_code: &str) -> Result<TokenSet, InfraError> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_complete.load(Ordering::SeqCst) {
                return Err(InfraError::MissingVerifier);
            }
            Ok(TokenSet {
                access_token: "token".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }

        fn abandon(&self) -> Result<(), InfraError> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct FakeVault {
        saved: Mutex<Option<TokenSet>>,
        user: Mutex<Option<String>>,
        deleted: AtomicBool,
    }

    #[async_trait]
    impl TokenVault for FakeVault {
        fn set_user(&self, user_id: &str) {
            *self.user.lock().expect("user lock") = Some(user_id.to_string());
        }

        fn clear_user(&self) {
            *self.user.lock().expect("user lock") = None;
        }

        async fn save(&self, tokens: &TokenSet) -> Result<(), InfraError> {
            *self.saved.lock().expect("saved lock") = Some(tokens.clone());
            Ok(())
        }

        async fn delete(&self) -> Result<(), InfraError> {
            self.deleted.store(true, Ordering::SeqCst);
            *self.saved.lock().expect("saved lock") = None;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FakeArtworkFetcher {
        bytes: Vec<u8>,
    }

    impl FakeArtworkFetcher {
        fn solid(r: u8, g: u8, b: u8) -> Self {
            let buffer = ImageBuffer::from_pixel(8, 8, Rgb([r, g, b]));
            let mut bytes = Vec::new();
            image::DynamicImage::ImageRgb8(buffer)
                .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
                .expect("encode png");
            Self { bytes }
        }
    }

    #[async_trait]
    impl ArtworkFetcher for FakeArtworkFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, InfraError> {
            Ok(self.bytes.clone())
        }
    }

    type TestController = SessionController<FakeMediaApi, FakeTokenSource>;

    struct Harness {
        controller: Arc<TestController>,
        api: Arc<FakeMediaApi>,
        tokens: Arc<FakeTokenSource>,
        auth: Arc<FakeAuthFlow>,
        vault: Arc<FakeVault>,
    }

    fn harness(api: FakeMediaApi, tokens: FakeTokenSource, policy: PollingPolicy) -> Harness {
        let api = Arc::new(api);
        let tokens = Arc::new(tokens);
        let auth = Arc::new(FakeAuthFlow::default());
        let vault = Arc::new(FakeVault::default());
        let media = Arc::new(MediaService::new(Arc::clone(&api), Arc::clone(&tokens)));
        let controller = SessionController::new(
            media,
            Arc::clone(&auth) as Arc<dyn AuthFlow>,
            Arc::clone(&vault) as Arc<dyn TokenVault>,
            Arc::new(FakeArtworkFetcher::solid(200, 40, 40)),
            policy,
        );
        Harness {
            controller,
            api,
            tokens,
            auth,
            vault,
        }
    }

    fn quiet_policy() -> PollingPolicy {
        // Intervals long enough that no timer fires during a test.
        PollingPolicy {
            tick_interval_ms: 60_000,
            poll_interval_ms: 60_000,
            command_refetch_delay_ms: 60_000,
        }
    }

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            title: "Song".to_string(),
            artists: vec!["Artist".to_string()],
            album: "Album".to_string(),
            artwork_url: Some("https://images.example.com/cover.png".to_string()),
            duration_ms: 200_000,
        }
    }

    fn playing_snapshot(track_id: &str, progress_ms: u64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            track: Some(track(track_id)),
            is_playing: true,
            progress_ms,
            duration_ms: 200_000,
            device_volume: 50,
            shuffle: false,
            repeat: RepeatMode::Off,
            fetched_at: Utc::now(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn callback_connects_and_hydrates() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            quiet_policy(),
        );

        h.controller
            .handle_callback("code-1")
            .await
            .expect("callback succeeds");
        settle().await;

        let state = h.controller.current_state();
        assert_eq!(state.connection, ConnectionState::Connected);
        assert_eq!(state.profile.as_ref().map(|p| p.id.as_str()), Some("user-1"));
        assert!(state.playback.is_some());
        assert_eq!(state.devices.len(), 1);
        assert!(h.vault.saved.lock().expect("saved lock").is_some());
        assert_eq!(
            h.vault.user.lock().expect("user lock").as_deref(),
            Some("user-1")
        );
    }

    #[tokio::test]
    async fn failed_callback_releases_the_guard() {
        let h = harness(
            FakeMediaApi::default(),
            FakeTokenSource::connected(),
            quiet_policy(),
        );
        h.auth.fail_complete.store(true, Ordering::SeqCst);

        let result = h.controller.handle_callback("code-1").await;
        assert!(matches!(result, Err(InfraError::MissingVerifier)));
        assert_eq!(
            h.controller.current_state().connection,
            ConnectionState::Disconnected
        );
        assert!(h.vault.saved.lock().expect("saved lock").is_none());

        // The guard was released, so a retried callback goes through.
        h.auth.fail_complete.store(false, Ordering::SeqCst);
        h.controller
            .handle_callback("code-2")
            .await
            .expect("retried callback succeeds");
        assert_eq!(h.auth.complete_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.controller.current_state().connection,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn repeated_triggers_collapse_to_one_initialization() {
        let h = harness(
            FakeMediaApi::default(),
            FakeTokenSource::connected(),
            quiet_policy(),
        );

        h.controller.handle_callback("code-1").await.expect("callback");
        h.controller.initialize_session().await.expect("first trigger");
        h.controller.initialize_session().await.expect("second trigger");

        // Only the callback itself fetched the profile.
        assert_eq!(h.api.profile_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn initialize_without_credentials_stays_disconnected() {
        let h = harness(FakeMediaApi::default(), FakeTokenSource::empty(), quiet_policy());

        h.controller
            .initialize_session()
            .await
            .expect("no credentials is not an error");

        assert_eq!(
            h.controller.current_state().connection,
            ConnectionState::Disconnected
        );
        assert_eq!(h.api.playback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_stops_polling() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            PollingPolicy {
                tick_interval_ms: 5,
                poll_interval_ms: 10,
                command_refetch_delay_ms: 60_000,
            },
        );

        h.controller.handle_callback("code-1").await.expect("callback");
        settle().await;
        assert!(h.api.playback_calls.load(Ordering::SeqCst) >= 2);

        h.controller.disconnect().await;
        h.controller.disconnect().await;

        assert_eq!(
            h.controller.current_state().connection,
            ConnectionState::Disconnected
        );
        assert!(h.vault.deleted.load(Ordering::SeqCst));

        let after_disconnect = h.api.playback_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.api.playback_calls.load(Ordering::SeqCst), after_disconnect);
    }

    #[tokio::test]
    async fn local_tick_advances_progress_between_polls() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            PollingPolicy {
                tick_interval_ms: 5,
                poll_interval_ms: 60_000,
                command_refetch_delay_ms: 60_000,
            },
        );

        h.controller.handle_callback("code-1").await.expect("callback");
        tokio::time::sleep(Duration::from_millis(60)).await;

        let state = h.controller.current_state();
        let progress = state.playback.as_ref().map(|p| p.progress_ms);
        assert!(progress.is_some_and(|p| p > 1_000), "progress was {progress:?}");
        assert!(progress.is_some_and(|p| p <= 200_000));
    }

    #[tokio::test]
    async fn poll_overwrites_locally_ticked_progress() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            PollingPolicy {
                tick_interval_ms: 5,
                poll_interval_ms: 20,
                command_refetch_delay_ms: 60_000,
            },
        );

        h.controller.handle_callback("code-1").await.expect("callback");
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Every poll resets to the authoritative 1000ms, so local drift is
        // bounded by one polling interval's worth of ticks.
        assert!(h.api.playback_calls.load(Ordering::SeqCst) >= 3);
        let state = h.controller.current_state();
        let progress = state.playback.as_ref().map(|p| p.progress_ms);
        assert!(progress.is_some_and(|p| (1_000..2_000).contains(&p)), "progress was {progress:?}");
    }

    #[tokio::test]
    async fn pause_applies_optimistically_and_failure_is_non_fatal() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            quiet_policy(),
        );
        h.controller.handle_callback("code-1").await.expect("callback");
        h.api.fail_commands.store(true, Ordering::SeqCst);

        h.controller.pause().await;

        let state = h.controller.current_state();
        assert_eq!(state.connection, ConnectionState::Connected);
        assert!(state.playback.as_ref().is_some_and(|p| !p.is_playing));
        assert!(state.last_error.is_some());
        assert_eq!(h.api.pause_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn next_schedules_a_reconciling_refetch() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            PollingPolicy {
                tick_interval_ms: 60_000,
                poll_interval_ms: 60_000,
                command_refetch_delay_ms: 5,
            },
        );
        h.controller.handle_callback("code-1").await.expect("callback");
        let baseline = h.api.playback_calls.load(Ordering::SeqCst);

        h.controller.next().await;
        settle().await;

        assert_eq!(h.api.next_calls.load(Ordering::SeqCst), 1);
        assert!(h.api.playback_calls.load(Ordering::SeqCst) > baseline);
    }

    #[tokio::test]
    async fn auth_failure_during_refresh_expires_the_session() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            quiet_policy(),
        );
        h.controller.handle_callback("code-1").await.expect("callback");

        h.tokens.expire();
        h.controller.refresh_playback().await;

        let state = h.controller.current_state();
        assert!(matches!(state.connection, ConnectionState::Error(_)));
        assert!(state.playback.is_none());
        assert!(h.vault.deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn toggle_like_round_trips_through_the_api() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            quiet_policy(),
        );
        h.controller.handle_callback("code-1").await.expect("callback");
        settle().await;
        assert!(!h.controller.current_state().current_track_liked);

        h.controller.toggle_like().await;
        assert!(h.controller.current_state().current_track_liked);
        assert_eq!(h.api.save_calls.load(Ordering::SeqCst), 1);

        h.controller.toggle_like().await;
        assert!(!h.controller.current_state().current_track_liked);
        assert_eq!(h.api.remove_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cycle_repeat_applies_optimistically() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            quiet_policy(),
        );
        h.controller.handle_callback("code-1").await.expect("callback");

        h.controller.cycle_repeat().await;

        let state = h.controller.current_state();
        assert_eq!(state.playback.as_ref().map(|p| p.repeat), Some(RepeatMode::Context));
        assert_eq!(
            *h.api.last_repeat.lock().expect("repeat lock"),
            Some(RepeatMode::Context)
        );
    }

    #[tokio::test]
    async fn seek_clamps_the_optimistic_position() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            quiet_policy(),
        );
        h.controller.handle_callback("code-1").await.expect("callback");

        h.controller.seek(999_999_999).await;

        let state = h.controller.current_state();
        assert_eq!(state.playback.as_ref().map(|p| p.progress_ms), Some(200_000));
        assert_eq!(
            *h.api.last_seek.lock().expect("seek lock"),
            Some(999_999_999)
        );
    }

    #[tokio::test]
    async fn commands_while_disconnected_are_dropped() {
        let h = harness(FakeMediaApi::default(), FakeTokenSource::empty(), quiet_policy());

        h.controller.play(None).await;
        h.controller.pause().await;
        h.controller.next().await;
        h.controller.toggle_like().await;

        // No remote call went out and no credential teardown ran; the
        // controller stays plain Disconnected instead of reporting an
        // expired session that never existed.
        let state = h.controller.current_state();
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert!(state.last_error.is_none());
        assert_eq!(h.api.play_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.api.pause_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.api.next_calls.load(Ordering::SeqCst), 0);
        assert!(!h.vault.deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn presentation_is_derived_for_a_new_track() {
        let h = harness(
            FakeMediaApi::with_playback(playing_snapshot("t1", 1_000)),
            FakeTokenSource::connected(),
            quiet_policy(),
        );

        h.controller.handle_callback("code-1").await.expect("callback");
        settle().await;

        let state = h.controller.current_state();
        let presentation = state.presentation.expect("presentation derived");
        assert_eq!(presentation.track_id, "t1");
        assert_eq!(presentation.dominant_color, "#c82828");
    }
}
