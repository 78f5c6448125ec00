use crate::{ApiError, NowPlayingSource, TokenRefresher, TrackEnricher};
use anyhow::{Context, Result};
use async_trait::async_trait;
use playtrace_core::{
    AlbumInfo, ArtistInfo, AudioFeatures, PlayingTrack, RawSnapshot, SpotifyConfig, TrackId,
};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tracing::debug;
use url::Url;

const PLAYER_ENDPOINT: &str = "me/player";
const TOKEN_ENDPOINT: &str = "api/token";
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Deserialize)]
struct PlayerPayload {
    #[serde(default)]
    is_playing: bool,
    item: Option<ItemPayload>,
}

#[derive(Debug, Deserialize)]
struct ItemPayload {
    id: Option<String>,
    #[serde(default)]
    name: String,
    duration_ms: Option<u64>,
    #[serde(default)]
    artists: Vec<NamedRef>,
    album: Option<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    id: Option<String>,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ArtistPayload {
    id: String,
    name: String,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    popularity: u32,
    followers: Option<FollowersPayload>,
}

#[derive(Debug, Deserialize)]
struct FollowersPayload {
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    access_token: String,
}

/// Spotify Web API client covering playback state, metadata lookups and
/// token refresh. Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct SpotifyClient {
    http: Client,
    api_base: Url,
    accounts_base: Url,
    client_id: String,
    client_secret: String,
}

impl SpotifyClient {
    pub fn new(cfg: &SpotifyConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        let api_base = Url::parse(&cfg.api_base)
            .with_context(|| format!("invalid spotify api_base {}", cfg.api_base))?;
        let accounts_base = Url::parse(&cfg.accounts_base)
            .with_context(|| format!("invalid spotify accounts_base {}", cfg.accounts_base))?;

        Ok(Self {
            http,
            api_base,
            accounts_base,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
        })
    }

    fn resource_url(&self, collection: &str, id: &str) -> Result<Url, ApiError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ApiError::MalformedPayload {
                endpoint: collection.to_string(),
                reason: format!("invalid catalog id {id:?}"),
            });
        }
        self.join(&self.api_base, &format!("{collection}/{id}"), collection)
    }

    fn join(&self, base: &Url, path: &str, endpoint: &str) -> Result<Url, ApiError> {
        base.join(path).map_err(|err| ApiError::MalformedPayload {
            endpoint: endpoint.to_string(),
            reason: format!("cannot build url: {err}"),
        })
    }

    async fn fetch(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<(u16, Option<String>, Vec<u8>), ApiError> {
        let transport = |source| ApiError::Transport {
            endpoint: endpoint.to_string(),
            source,
        };
        let resp = request.send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(transport)?.to_vec();
        debug!(endpoint, status, bytes = body.len(), "spotify response");
        Ok((status, retry_after, body))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        url: Url,
        access_token: &str,
    ) -> Result<T, ApiError> {
        let (status, retry_after, body) = self
            .fetch(endpoint, self.http.get(url).bearer_auth(access_token))
            .await?;
        check_status(endpoint, status, retry_after.as_deref(), &body)?;
        decode(endpoint, &body)
    }
}

#[async_trait]
impl NowPlayingSource for SpotifyClient {
    async fn now_playing(
        &mut self,
        access_token: &str,
        polled_at: SystemTime,
    ) -> Result<RawSnapshot, ApiError> {
        let url = self.join(&self.api_base, PLAYER_ENDPOINT, PLAYER_ENDPOINT)?;
        let (status, retry_after, body) = self
            .fetch(PLAYER_ENDPOINT, self.http.get(url).bearer_auth(access_token))
            .await?;
        classify_now_playing(status, retry_after.as_deref(), &body, polled_at)
    }
}

#[async_trait]
impl TrackEnricher for SpotifyClient {
    async fn audio_features(
        &mut self,
        access_token: &str,
        track_id: &str,
    ) -> Result<AudioFeatures, ApiError> {
        let url = self.resource_url("audio-features", track_id)?;
        self.get_json("audio-features", url, access_token).await
    }

    async fn artist(
        &mut self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistInfo, ApiError> {
        let url = self.resource_url("artists", artist_id)?;
        let payload: ArtistPayload = self.get_json("artists", url, access_token).await?;
        Ok(ArtistInfo {
            id: payload.id,
            name: payload.name,
            genres: payload.genres,
            popularity: payload.popularity,
            followers: payload.followers.map(|f| f.total).unwrap_or(0),
        })
    }

    async fn album(&mut self, access_token: &str, album_id: &str) -> Result<AlbumInfo, ApiError> {
        let url = self.resource_url("albums", album_id)?;
        self.get_json("albums", url, access_token).await
    }
}

#[async_trait]
impl TokenRefresher for SpotifyClient {
    async fn refresh(&mut self, refresh_token: &str) -> Result<String, ApiError> {
        let url = self.join(&self.accounts_base, TOKEN_ENDPOINT, TOKEN_ENDPOINT)?;
        let request = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ]);
        let (status, retry_after, body) = self.fetch(TOKEN_ENDPOINT, request).await?;
        check_status(TOKEN_ENDPOINT, status, retry_after.as_deref(), &body)?;
        let token: TokenPayload = decode(TOKEN_ENDPOINT, &body)?;
        if token.access_token.is_empty() {
            return Err(ApiError::MalformedPayload {
                endpoint: TOKEN_ENDPOINT.to_string(),
                reason: "empty access_token".to_string(),
            });
        }
        Ok(token.access_token)
    }
}

/// Parses a `Retry-After` value given in whole seconds. Zero, negative and
/// non-numeric values yield `None` so the caller's fallback applies.
fn parse_retry_after(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}

fn check_status(
    endpoint: &str,
    status: u16,
    retry_after: Option<&str>,
    body: &[u8],
) -> Result<(), ApiError> {
    match status {
        200..=299 => Ok(()),
        429 => Err(ApiError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after: retry_after.and_then(parse_retry_after),
        }),
        401 => Err(ApiError::Unauthorized {
            endpoint: endpoint.to_string(),
            status,
        }),
        _ => {
            let mut text = String::from_utf8_lossy(body).into_owned();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status,
                body: text,
            })
        }
    }
}

fn decode<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| ApiError::MalformedPayload {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    })
}

fn classify_now_playing(
    status: u16,
    retry_after: Option<&str>,
    body: &[u8],
    polled_at: SystemTime,
) -> Result<RawSnapshot, ApiError> {
    if status == 204 {
        return Ok(RawSnapshot::Empty);
    }
    check_status(PLAYER_ENDPOINT, status, retry_after, body)?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RawSnapshot::Empty);
    }

    let payload: PlayerPayload = decode(PLAYER_ENDPOINT, body)?;
    let item = match payload.item {
        Some(item) => item,
        None => return Ok(RawSnapshot::Empty),
    };
    // Local files and some episodes have no catalog id.
    let id = match item.id {
        Some(id) if !id.is_empty() => id,
        _ => return Ok(RawSnapshot::Empty),
    };

    let malformed = |reason: &str| ApiError::MalformedPayload {
        endpoint: PLAYER_ENDPOINT.to_string(),
        reason: format!("track {id}: {reason}"),
    };
    let artist = item
        .artists
        .into_iter()
        .next()
        .ok_or_else(|| malformed("no artists"))?;
    let artist_id = artist.id.ok_or_else(|| malformed("artist without id"))?;
    let album = item.album.ok_or_else(|| malformed("no album"))?;
    let album_id = album.id.ok_or_else(|| malformed("album without id"))?;

    Ok(RawSnapshot::Playing(PlayingTrack {
        id: TrackId(id),
        name: item.name,
        artist_id,
        artist_name: artist.name,
        album_id,
        album_name: album.name,
        duration_ms: item.duration_ms,
        is_playing: payload.is_playing,
        polled_at,
    }))
}
