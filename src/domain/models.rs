use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.access_token, "token.access_token")?;
        validate_non_empty(&self.refresh_token, "token.refresh_token")?;
        Ok(())
    }

    // Expiry exactly on the buffer boundary counts as expiring.
    pub fn is_valid_at(&self, now: DateTime<Utc>, buffer_seconds: i64) -> bool {
        self.expires_at > now + Duration::seconds(buffer_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub artwork_url: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub volume_percent: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    Off,
    Context,
    Track,
}

impl RepeatMode {
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::Context,
            RepeatMode::Context => RepeatMode::Track,
            RepeatMode::Track => RepeatMode::Off,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            RepeatMode::Off => "off",
            RepeatMode::Context => "context",
            RepeatMode::Track => "track",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        match value {
            "context" => RepeatMode::Context,
            "track" => RepeatMode::Track,
            _ => RepeatMode::Off,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub track: Option<Track>,
    pub is_playing: bool,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub device_volume: u8,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub fetched_at: DateTime<Utc>,
}

impl PlaybackSnapshot {
    pub fn tick(&mut self, quantum_ms: u64) {
        if !self.is_playing {
            return;
        }
        self.progress_ms = self
            .progress_ms
            .saturating_add(quantum_ms)
            .min(self.duration_ms);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
}

impl UserProfile {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "profile.id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    Connected,
    Error(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MoodLabel {
    Energetic,
    Bright,
    Mellow,
    Moody,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presentation {
    pub track_id: String,
    pub dominant_color: String,
    pub mood: MoodLabel,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub profile: Option<UserProfile>,
    pub playback: Option<PlaybackSnapshot>,
    pub devices: Vec<Device>,
    pub recent_tracks: Vec<Track>,
    pub current_track_liked: bool,
    pub presentation: Option<Presentation>,
    pub last_error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            profile: None,
            playback: None,
            devices: Vec::new(),
            recent_tracks: Vec::new(),
            current_track_liked: false,
            presentation: None,
            last_error: None,
        }
    }
}

fn validate_non_empty(value: &str, field: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(())
}
