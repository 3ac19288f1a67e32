use crate::domain::models::MoodLabel;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const HTTP_TIMEOUT_SECONDS: u64 = 30;
const THUMBNAIL_EDGE: u32 = 64;

/// Fetches raw cover-art bytes. Separated from the analysis so the session
/// controller can be tested with canned images.
#[async_trait]
pub trait ArtworkFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestArtworkFetcher {
    client: Client,
}

impl ReqwestArtworkFetcher {
    pub fn new() -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| InfraError::Transient(format!("failed building http client: {error}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtworkFetcher for ReqwestArtworkFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, InfraError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| InfraError::Transient(format!("network error fetching artwork: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InfraError::Transient(format!(
                "artwork fetch failed: http {}",
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| InfraError::Transient(format!("failed reading artwork bytes: {error}")))?;
        Ok(bytes.to_vec())
    }
}

pub fn dominant_color(bytes: &[u8]) -> Result<(u8, u8, u8), InfraError> {
    let image = image::load_from_memory(bytes)
        .map_err(|error| InfraError::Validation(format!("failed decoding artwork: {error}")))?;
    let thumbnail = image.thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE).to_rgb8();

    let mut buckets: std::collections::HashMap<(u8, u8, u8), (u64, u64, u64, u64)> =
        std::collections::HashMap::new();
    for pixel in thumbnail.pixels() {
        let [r, g, b] = pixel.0;
        let key = (r >> 5, g >> 5, b >> 5);
        let entry = buckets.entry(key).or_insert((0, 0, 0, 0));
        entry.0 += 1;
        entry.1 += u64::from(r);
        entry.2 += u64::from(g);
        entry.3 += u64::from(b);
    }

    let (count, sum_r, sum_g, sum_b) = buckets
        .into_values()
        .max_by_key(|(count, ..)| *count)
        .ok_or_else(|| InfraError::Validation("artwork has no pixels".to_string()))?;

    Ok((
        (sum_r / count) as u8,
        (sum_g / count) as u8,
        (sum_b / count) as u8,
    ))
}

pub fn color_hex(rgb: (u8, u8, u8)) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb.0, rgb.1, rgb.2)
}

pub fn mood_from_color(rgb: (u8, u8, u8)) -> MoodLabel {
    let (_, saturation, lightness) = rgb_to_hsl(rgb);

    if lightness < 0.25 {
        MoodLabel::Moody
    } else if saturation > 0.6 && lightness > 0.45 {
        MoodLabel::Energetic
    } else if lightness > 0.75 {
        MoodLabel::Bright
    } else if saturation < 0.25 {
        MoodLabel::Neutral
    } else {
        MoodLabel::Mellow
    }
}

fn rgb_to_hsl(rgb: (u8, u8, u8)) -> (f32, f32, f32) {
    let r = f32::from(rgb.0) / 255.0;
    let g = f32::from(rgb.1) / 255.0;
    let b = f32::from(rgb.2) / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let lightness = (max + min) / 2.0;

    if (max - min).abs() < f32::EPSILON {
        return (0.0, 0.0, lightness);
    }

    let delta = max - min;
    let saturation = if lightness > 0.5 {
        delta / (2.0 - max - min)
    } else {
        delta / (max + min)
    };

    let hue = if (max - r).abs() < f32::EPSILON {
        ((g - b) / delta).rem_euclid(6.0)
    } else if (max - g).abs() < f32::EPSILON {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    } * 60.0;

    (hue, saturation, lightness)
}
