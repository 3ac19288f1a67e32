use crate::infrastructure::error::InfraError;
use std::fs;
use std::path::Path;

const MEDIA_JSON: &str = "media.json";

pub const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.spotify.com/authorize";
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://accounts.spotify.com/api/token";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/media/callback";
pub const DEFAULT_SCOPES: &[&str] = &[
    "user-read-private",
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-recently-played",
    "user-library-read",
    "user-library-modify",
];

#[derive(Debug, Clone)]
pub struct MediaSessionSettings {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub api_base: String,
    pub backup_base_url: Option<String>,
    pub backup_service_key: Option<String>,
    pub tick_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub command_refetch_delay_ms: u64,
}

fn default_media_config() -> serde_json::Value {
    serde_json::json!({
        "schema": 1,
        "clientId": "",
        "redirectUri": DEFAULT_REDIRECT_URI,
        "scopes": DEFAULT_SCOPES,
        "authorizationEndpoint": DEFAULT_AUTHORIZATION_ENDPOINT,
        "tokenEndpoint": DEFAULT_TOKEN_ENDPOINT,
        "apiBase": crate::infrastructure::media_api::DEFAULT_API_BASE,
        "backupBaseUrl": null,
        "backupServiceKey": null,
        "tickIntervalMs": 1_000,
        "pollIntervalMs": 5_000,
        "commandRefetchDelayMs": 500
    })
}

pub fn ensure_default_media_config(config_dir: &Path) -> Result<(), InfraError> {
    fs::create_dir_all(config_dir)?;
    let path = config_dir.join(MEDIA_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&default_media_config())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| {
            InfraError::Validation(format!("missing schema in {}", path.display()))
        })?;
    if schema != 1 {
        return Err(InfraError::Validation(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn read_string(config: &serde_json::Value, key: &str, fallback: &str) -> String {
    config
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn read_optional_string(config: &serde_json::Value, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn read_interval(config: &serde_json::Value, key: &str, fallback: u64) -> u64 {
    config
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
        .unwrap_or(fallback)
}

pub fn load_media_settings(config_dir: &Path) -> Result<MediaSessionSettings, InfraError> {
    let config = read_config(&config_dir.join(MEDIA_JSON))?;

    let client_id = read_string(&config, "clientId", "");
    if client_id.is_empty() {
        return Err(InfraError::Validation(
            "media.json clientId must be set before connecting".to_string(),
        ));
    }

    let scopes = config
        .get("scopes")
        .and_then(serde_json::Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        })
        .filter(|scopes| !scopes.is_empty())
        .unwrap_or_else(|| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect());

    Ok(MediaSessionSettings {
        client_id,
        redirect_uri: read_string(&config, "redirectUri", DEFAULT_REDIRECT_URI),
        scopes,
        authorization_endpoint: read_string(
            &config,
            "authorizationEndpoint",
            DEFAULT_AUTHORIZATION_ENDPOINT,
        ),
        token_endpoint: read_string(&config, "tokenEndpoint", DEFAULT_TOKEN_ENDPOINT),
        api_base: read_string(
            &config,
            "apiBase",
            crate::infrastructure::media_api::DEFAULT_API_BASE,
        ),
        backup_base_url: read_optional_string(&config, "backupBaseUrl"),
        backup_service_key: read_optional_string(&config, "backupServiceKey"),
        tick_interval_ms: read_interval(&config, "tickIntervalMs", 1_000),
        poll_interval_ms: read_interval(&config, "pollIntervalMs", 5_000),
        command_refetch_delay_ms: read_interval(&config, "commandRefetchDelayMs", 500),
    })
}
