//! Deezer public API adapter.

use serde::Deserialize;

use crate::catalog::{RemoteAlbum, RemoteArtist, RemoteCatalogProvider, RemoteTrack};
use crate::error::ProviderError;

pub const DEFAULT_API_BASE_URL: &str = "https://api.deezer.com";

#[derive(Debug, Deserialize)]
struct DeezerArtist {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbum {
    #[serde(default)]
    title: String,
    cover_medium: Option<String>,
    cover_big: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: u32,
    #[serde(default)]
    preview: String,
    artist: DeezerArtist,
    album: DeezerAlbum,
}

#[derive(Debug, Deserialize)]
struct DeezerApiError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    data: Vec<DeezerTrack>,
    error: Option<DeezerApiError>,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    tracks: Option<TrackPage>,
    error: Option<DeezerApiError>,
}

impl From<DeezerTrack> for RemoteTrack {
    fn from(track: DeezerTrack) -> Self {
        Self {
            id: track.id,
            title: track.title,
            duration_s: track.duration,
            preview_url: track.preview,
            artist: RemoteArtist {
                name: track.artist.name,
            },
            album: RemoteAlbum {
                title: track.album.title,
                cover_url: track.album.cover_big.or(track.album.cover_medium),
            },
        }
    }
}

fn api_error(error: DeezerApiError) -> ProviderError {
    ProviderError::Transport(format!("{}: {}", error.kind, error.message))
}

fn parse_search_response(body: &str) -> Result<Vec<RemoteTrack>, ProviderError> {
    let page: TrackPage =
        serde_json::from_str(body).map_err(|err| ProviderError::Decode(err.to_string()))?;
    if let Some(error) = page.error {
        return Err(api_error(error));
    }
    Ok(page.data.into_iter().map(RemoteTrack::from).collect())
}

fn parse_chart_response(body: &str) -> Result<Vec<RemoteTrack>, ProviderError> {
    let chart: ChartResponse =
        serde_json::from_str(body).map_err(|err| ProviderError::Decode(err.to_string()))?;
    if let Some(error) = chart.error {
        return Err(api_error(error));
    }
    let page = chart
        .tracks
        .ok_or_else(|| ProviderError::Decode("chart response has no tracks".to_string()))?;
    Ok(page.data.into_iter().map(RemoteTrack::from).collect())
}

/// Search and chart provider backed by `ureq`.
pub struct DeezerCatalog {
    http_client: ureq::Agent,
    base_url: String,
}

impl DeezerCatalog {
    pub fn new(http_client: ureq::Agent, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        }
    }

    fn get_body(&self, url: &str) -> Result<String, ProviderError> {
        let response = self
            .http_client
            .get(url)
            .call()
            .map_err(|err| ProviderError::Transport(format!("GET {url} failed: {err}")))?;
        Ok(response.into_string()?)
    }
}

impl RemoteCatalogProvider for DeezerCatalog {
    fn search(&self, query: &str) -> Result<Vec<RemoteTrack>, ProviderError> {
        let url = format!("{}/search?q={}", self.base_url, urlencoding::encode(query));
        parse_search_response(&self.get_body(&url)?)
    }

    fn trending(&self) -> Result<Vec<RemoteTrack>, ProviderError> {
        let url = format!("{}/chart/0", self.base_url);
        parse_chart_response(&self.get_body(&url)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::http_agent;
    use crate::test_support::serve_http_once;
    use std::time::Duration;

    const TRACK_JSON: &str = r#"{
        "id": 3135556,
        "title": "Harder, Better, Faster, Stronger",
        "duration": 224,
        "preview": "https://cdn.example/preview.mp3",
        "artist": {"id": 27, "name": "Daft Punk"},
        "album": {
            "id": 302127,
            "title": "Discovery",
            "cover_medium": "https://cdn.example/250.jpg",
            "cover_big": "https://cdn.example/500.jpg"
        }
    }"#;

    #[test]
    fn test_parse_search_response_maps_tracks() {
        let body = format!(r#"{{"data": [{TRACK_JSON}], "total": 1}}"#);

        let tracks = parse_search_response(&body).expect("search response should parse");

        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, 3_135_556);
        assert_eq!(tracks[0].duration_s, 224);
        assert_eq!(tracks[0].artist.name, "Daft Punk");
        assert_eq!(
            tracks[0].album.cover_url.as_deref(),
            Some("https://cdn.example/500.jpg")
        );
    }

    #[test]
    fn test_cover_falls_back_to_medium_size() {
        let body = r#"{"data": [{
            "id": 1, "title": "t", "duration": 1, "preview": "p",
            "artist": {"name": "a"},
            "album": {"title": "al", "cover_medium": "https://cdn.example/250.jpg"}
        }]}"#;

        let tracks = parse_search_response(body).expect("search response should parse");

        assert_eq!(
            tracks[0].album.cover_url.as_deref(),
            Some("https://cdn.example/250.jpg")
        );
    }

    #[test]
    fn test_parse_chart_response_reads_nested_tracks() {
        let body = format!(r#"{{"tracks": {{"data": [{TRACK_JSON}, {TRACK_JSON}]}}}}"#);

        let tracks = parse_chart_response(&body).expect("chart response should parse");

        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn test_api_error_and_garbage_are_errors() {
        let error_body =
            r#"{"error": {"type": "QuotaException", "message": "Quota limit exceeded", "code": 4}}"#;
        assert!(matches!(
            parse_search_response(error_body),
            Err(ProviderError::Transport(_))
        ));
        assert!(matches!(
            parse_chart_response("<html>"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn test_search_over_http() {
        let body = format!(r#"{{"data": [{TRACK_JSON}]}}"#);
        let base_url = serve_http_once("200 OK", &body);
        let catalog = DeezerCatalog::new(
            http_agent(Duration::from_secs(2), Duration::from_secs(2)),
            &format!("{base_url}/"),
        );

        let tracks = catalog.search("daft punk").expect("search should succeed");

        assert_eq!(tracks[0].title, "Harder, Better, Faster, Stronger");
    }
}
