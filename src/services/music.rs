//! Song lookup and preview download.

use async_trait::async_trait;
use axum::body::Bytes;
use serde::Deserialize;

use super::{ProviderError, ProviderResult};

// ---

const ITUNES_SEARCH: &str = "https://itunes.apple.com/search";

#[derive(Debug, Clone, PartialEq)]
pub struct SongPreview {
    pub name: String,
    pub artist: String,
    pub audio: Bytes,
    /// Container format of `audio`, as an ffmpeg demuxer name.
    pub format: &'static str,
}

#[async_trait]
pub trait Music: Send + Sync {
    /// Best match for `query` with a playable preview clip.
    async fn preview(&self, query: &str) -> ProviderResult<SongPreview>;
}

pub struct ITunesPreviews {
    http: reqwest::Client,
}

impl ITunesPreviews {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Track {
    track_name: String,
    artist_name: String,
    preview_url: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Track>,
}

#[async_trait]
impl Music for ITunesPreviews {
    async fn preview(&self, query: &str) -> ProviderResult<SongPreview> {
        // ---
        let response: SearchResponse = self
            .http
            .get(ITUNES_SEARCH)
            .query(&[("term", query), ("media", "music"), ("entity", "song"), ("limit", "5")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let (track, url) = response
            .results
            .into_iter()
            .find_map(|t| t.preview_url.clone().map(|url| (t, url)))
            .ok_or_else(|| ProviderError::Unavailable(format!("no playable songs found for '{query}'")))?;

        tracing::debug!("Fetching preview of '{}' by {}", track.track_name, track.artist_name);
        let audio = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        Ok(SongPreview {
            name: track.track_name,
            artist: track.artist_name,
            audio,
            format: "m4a",
        })
    }
}
