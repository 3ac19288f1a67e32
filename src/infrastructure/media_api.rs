use crate::domain::models::{Device, PlaybackSnapshot, RepeatMode, Track, UserProfile};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1/";
const HTTP_TIMEOUT_SECONDS: u64 = 30;

/// The subset of the provider REST surface the session core consumes. Every
/// method takes the bearer token explicitly; callers must fetch it
/// immediately before the request (a refresh may have replaced it).
#[async_trait]
pub trait MediaApi: Send + Sync {
    async fn profile(&self, access_token: &str) -> Result<UserProfile, InfraError>;

    // 204 with no body means nothing is playing, not an error.
    async fn playback_state(&self, access_token: &str) -> Result<Option<PlaybackSnapshot>, InfraError>;

    async fn devices(&self, access_token: &str) -> Result<Vec<Device>, InfraError>;

    async fn recently_played(&self, access_token: &str, limit: u8) -> Result<Vec<Track>, InfraError>;

    async fn is_track_saved(&self, access_token: &str, track_id: &str) -> Result<bool, InfraError>;

    async fn save_track(&self, access_token: &str, track_id: &str) -> Result<(), InfraError>;

    async fn remove_saved_track(&self, access_token: &str, track_id: &str) -> Result<(), InfraError>;

    async fn play(&self, access_token: &str, device_id: Option<&str>) -> Result<(), InfraError>;

    async fn pause(&self, access_token: &str) -> Result<(), InfraError>;

    async fn next_track(&self, access_token: &str) -> Result<(), InfraError>;

    async fn previous_track(&self, access_token: &str) -> Result<(), InfraError>;

    async fn seek(&self, access_token: &str, position_ms: u64) -> Result<(), InfraError>;

    async fn set_volume(&self, access_token: &str, volume_percent: u8) -> Result<(), InfraError>;

    async fn set_shuffle(&self, access_token: &str, shuffle: bool) -> Result<(), InfraError>;

    async fn set_repeat(&self, access_token: &str, mode: RepeatMode) -> Result<(), InfraError>;

    async fn transfer_playback(&self, access_token: &str, device_id: &str) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestMediaApi {
    client: Client,
    api_base: String,
}

#[derive(Debug, serde::Deserialize)]
struct ProfilePayload {
    id: String,
    display_name: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ImagePayload {
    url: String,
}

#[derive(Debug, serde::Deserialize)]
struct ArtistPayload {
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct AlbumPayload {
    name: Option<String>,
    images: Option<Vec<ImagePayload>>,
}

#[derive(Debug, serde::Deserialize)]
struct TrackPayload {
    id: Option<String>,
    name: Option<String>,
    artists: Option<Vec<ArtistPayload>>,
    album: Option<AlbumPayload>,
    duration_ms: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct PlaybackDevicePayload {
    id: Option<String>,
    name: Option<String>,
    is_active: Option<bool>,
    volume_percent: Option<u8>,
}

#[derive(Debug, serde::Deserialize)]
struct PlaybackStatePayload {
    item: Option<TrackPayload>,
    is_playing: Option<bool>,
    progress_ms: Option<u64>,
    device: Option<PlaybackDevicePayload>,
    shuffle_state: Option<bool>,
    repeat_state: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct DeviceListPayload {
    devices: Option<Vec<PlaybackDevicePayload>>,
}

#[derive(Debug, serde::Deserialize)]
struct PlayHistoryItemPayload {
    track: Option<TrackPayload>,
}

#[derive(Debug, serde::Deserialize)]
struct RecentlyPlayedPayload {
    items: Option<Vec<PlayHistoryItemPayload>>,
}

#[derive(Debug, serde::Serialize)]
struct TransferRequest<'a> {
    device_ids: [&'a str; 1],
    play: bool,
}

fn track_from_payload(payload: TrackPayload) -> Option<Track> {
    let id = payload.id.filter(|value| !value.trim().is_empty())?;
    let album = payload.album;
    Some(Track {
        id,
        title: payload.name.unwrap_or_default(),
        artists: payload
            .artists
            .unwrap_or_default()
            .into_iter()
            .map(|artist| artist.name)
            .collect(),
        album: album
            .as_ref()
            .and_then(|album| album.name.clone())
            .unwrap_or_default(),
        artwork_url: album
            .and_then(|album| album.images)
            .and_then(|images| images.into_iter().next())
            .map(|image| image.url),
        duration_ms: payload.duration_ms.unwrap_or(0),
    })
}

impl ReqwestMediaApi {
    pub fn new(api_base: impl Into<String>) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| InfraError::Transient(format!("failed building http client: {error}")))?;
        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|error| InfraError::Validation(format!("invalid api base url: {error}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| InfraError::Validation("api base URL cannot be a base".to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn http_error(status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("media api error: http {}", status.as_u16())
        } else {
            format!("media api error: http {}; body={body}", status.as_u16())
        };
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            InfraError::Auth(message)
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            InfraError::Transient(message)
        } else {
            InfraError::Validation(message)
        }
    }

    async fn read_body(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> Result<Option<String>, InfraError> {
        ensure_non_empty(access_token, "access token")?;
        let response = self
            .client
            .request(method, url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("network error: {error}")))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Transient(format!("failed reading response body: {error}")))?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(Some(body))
    }

    async fn send_command(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
        json_body: Option<serde_json::Value>,
    ) -> Result<(), InfraError> {
        ensure_non_empty(access_token, "access token")?;
        let mut request = self.client.request(method, url).bearer_auth(access_token);
        if let Some(body) = json_body {
            request = request.json(&body);
        } else {
            // The provider rejects empty PUT/POST bodies without a length.
            request = request.header(reqwest::header::CONTENT_LENGTH, 0);
        }

        let response = request
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("network error: {error}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::http_error(status, &body))
    }

    fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, InfraError> {
        serde_json::from_str(body)
            .map_err(|error| InfraError::Validation(format!("invalid media api payload: {error}")))
    }
}

#[async_trait]
impl MediaApi for ReqwestMediaApi {
    async fn profile(&self, access_token: &str) -> Result<UserProfile, InfraError> {
        let url = self.endpoint(&["me"])?;
        let body = self
            .read_body(Method::GET, url, access_token)
            .await?
            .ok_or_else(|| InfraError::Validation("empty profile response".to_string()))?;
        let parsed: ProfilePayload = Self::parse(&body)?;
        let profile = UserProfile {
            display_name: parsed.display_name.unwrap_or_else(|| parsed.id.clone()),
            id: parsed.id,
        };
        profile.validate().map_err(InfraError::Validation)?;
        Ok(profile)
    }

    async fn playback_state(&self, access_token: &str) -> Result<Option<PlaybackSnapshot>, InfraError> {
        let url = self.endpoint(&["me", "player"])?;
        let Some(body) = self.read_body(Method::GET, url, access_token).await? else {
            return Ok(None);
        };
        let parsed: PlaybackStatePayload = Self::parse(&body)?;
        let track = parsed.item.and_then(track_from_payload);
        let duration_ms = track.as_ref().map(|track| track.duration_ms).unwrap_or(0);

        Ok(Some(PlaybackSnapshot {
            track,
            is_playing: parsed.is_playing.unwrap_or(false),
            progress_ms: parsed.progress_ms.unwrap_or(0).min(duration_ms),
            duration_ms,
            device_volume: parsed
                .device
                .and_then(|device| device.volume_percent)
                .unwrap_or(0)
                .min(100),
            shuffle: parsed.shuffle_state.unwrap_or(false),
            repeat: parsed
                .repeat_state
                .as_deref()
                .map(RepeatMode::from_wire)
                .unwrap_or(RepeatMode::Off),
            fetched_at: Utc::now(),
        }))
    }

    async fn devices(&self, access_token: &str) -> Result<Vec<Device>, InfraError> {
        let url = self.endpoint(&["me", "player", "devices"])?;
        let Some(body) = self.read_body(Method::GET, url, access_token).await? else {
            return Ok(Vec::new());
        };
        let parsed: DeviceListPayload = Self::parse(&body)?;
        Ok(parsed
            .devices
            .unwrap_or_default()
            .into_iter()
            .filter_map(|device| {
                let id = device.id.filter(|value| !value.trim().is_empty())?;
                Some(Device {
                    id,
                    name: device.name.unwrap_or_default(),
                    is_active: device.is_active.unwrap_or(false),
                    volume_percent: device.volume_percent.unwrap_or(0).min(100),
                })
            })
            .collect())
    }

    async fn recently_played(&self, access_token: &str, limit: u8) -> Result<Vec<Track>, InfraError> {
        let mut url = self.endpoint(&["me", "player", "recently-played"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.clamp(1, 50).to_string());
        let Some(body) = self.read_body(Method::GET, url, access_token).await? else {
            return Ok(Vec::new());
        };
        let parsed: RecentlyPlayedPayload = Self::parse(&body)?;
        Ok(parsed
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| item.track.and_then(track_from_payload))
            .collect())
    }

    async fn is_track_saved(&self, access_token: &str, track_id: &str) -> Result<bool, InfraError> {
        ensure_non_empty(track_id, "track id")?;
        let mut url = self.endpoint(&["me", "tracks", "contains"])?;
        url.query_pairs_mut().append_pair("ids", track_id);
        let body = self
            .read_body(Method::GET, url, access_token)
            .await?
            .ok_or_else(|| InfraError::Validation("empty saved-check response".to_string()))?;
        let parsed: Vec<bool> = Self::parse(&body)?;
        Ok(parsed.first().copied().unwrap_or(false))
    }

    async fn save_track(&self, access_token: &str, track_id: &str) -> Result<(), InfraError> {
        ensure_non_empty(track_id, "track id")?;
        let mut url = self.endpoint(&["me", "tracks"])?;
        url.query_pairs_mut().append_pair("ids", track_id);
        self.send_command(Method::PUT, url, access_token, None).await
    }

    async fn remove_saved_track(&self, access_token: &str, track_id: &str) -> Result<(), InfraError> {
        ensure_non_empty(track_id, "track id")?;
        let mut url = self.endpoint(&["me", "tracks"])?;
        url.query_pairs_mut().append_pair("ids", track_id);
        self.send_command(Method::DELETE, url, access_token, None).await
    }

    async fn play(&self, access_token: &str, device_id: Option<&str>) -> Result<(), InfraError> {
        let mut url = self.endpoint(&["me", "player", "play"])?;
        if let Some(device_id) = device_id {
            url.query_pairs_mut().append_pair("device_id", device_id);
        }
        self.send_command(Method::PUT, url, access_token, None).await
    }

    async fn pause(&self, access_token: &str) -> Result<(), InfraError> {
        let url = self.endpoint(&["me", "player", "pause"])?;
        self.send_command(Method::PUT, url, access_token, None).await
    }

    async fn next_track(&self, access_token: &str) -> Result<(), InfraError> {
        let url = self.endpoint(&["me", "player", "next"])?;
        self.send_command(Method::POST, url, access_token, None).await
    }

    async fn previous_track(&self, access_token: &str) -> Result<(), InfraError> {
        let url = self.endpoint(&["me", "player", "previous"])?;
        self.send_command(Method::POST, url, access_token, None).await
    }

    async fn seek(&self, access_token: &str, position_ms: u64) -> Result<(), InfraError> {
        let mut url = self.endpoint(&["me", "player", "seek"])?;
        url.query_pairs_mut()
            .append_pair("position_ms", &position_ms.to_string());
        self.send_command(Method::PUT, url, access_token, None).await
    }

    async fn set_volume(&self, access_token: &str, volume_percent: u8) -> Result<(), InfraError> {
        let mut url = self.endpoint(&["me", "player", "volume"])?;
        url.query_pairs_mut()
            .append_pair("volume_percent", &volume_percent.min(100).to_string());
        self.send_command(Method::PUT, url, access_token, None).await
    }

    async fn set_shuffle(&self, access_token: &str, shuffle: bool) -> Result<(), InfraError> {
        let mut url = self.endpoint(&["me", "player", "shuffle"])?;
        url.query_pairs_mut()
            .append_pair("state", if shuffle { "true" } else { "false" });
        self.send_command(Method::PUT, url, access_token, None).await
    }

    async fn set_repeat(&self, access_token: &str, mode: RepeatMode) -> Result<(), InfraError> {
        let mut url = self.endpoint(&["me", "player", "repeat"])?;
        url.query_pairs_mut().append_pair("state", mode.as_wire());
        self.send_command(Method::PUT, url, access_token, None).await
    }

    async fn transfer_playback(&self, access_token: &str, device_id: &str) -> Result<(), InfraError> {
        ensure_non_empty(device_id, "device id")?;
        let url = self.endpoint(&["me", "player"])?;
        let body = serde_json::to_value(TransferRequest {
            device_ids: [device_id],
            play: true,
        })?;
        self.send_command(Method::PUT, url, access_token, Some(body)).await
    }
}

fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
    if value.trim().is_empty() {
        return Err(InfraError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}
