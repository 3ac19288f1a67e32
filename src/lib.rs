//! Media-session core for Daybook: PKCE sign-in against the media
//! provider, credential persistence across a local keyring and a remote
//! backup row, single-flight token refresh, and a polled playback session
//! with locally interpolated progress.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::auth_flow::{
    AuthConfig, AuthFlow, InMemoryVerifierStore, PkceAuthFlow, VerifierStore,
};
pub use application::credentials::{CredentialVault, PendingTokenSlot, TokenVault};
pub use application::media_service::MediaService;
pub use application::session::{PollingPolicy, SessionController};
pub use application::token_refresher::{REFRESH_BUFFER_SECONDS, TokenRefresher, TokenSource};
pub use domain::models::{
    ConnectionState, Device, MoodLabel, PlaybackSnapshot, Presentation, RepeatMode, SessionState,
    TokenSet, Track, UserProfile,
};
pub use infrastructure::error::InfraError;
