use async_trait::async_trait;
use playtrace_core::{AlbumInfo, ArtistInfo, AudioFeatures, RawSnapshot};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use thiserror::Error;

mod credentials;
mod spotify;

pub use credentials::FileCredentialStore;
pub use spotify::SpotifyClient;

/// Failure of a single call against the remote music service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{endpoint} is rate limited")]
    RateLimited {
        endpoint: String,
        retry_after: Option<Duration>,
    },
    #[error("{endpoint} rejected the access token (status {status})")]
    Unauthorized { endpoint: String, status: u16 },
    #[error("{endpoint} returned unexpected status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("request to {endpoint} failed")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed payload from {endpoint}: {reason}")]
    MalformedPayload { endpoint: String, reason: String },
    #[error("no access token available")]
    MissingAccessToken,
}

impl ApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }

    /// The server-suggested wait, if this is a rate limit that carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("failed to read credentials at {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse credentials at {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("credentials at {path} have no refresh_token")]
    MissingRefreshToken { path: PathBuf },
}

#[async_trait]
pub trait NowPlayingSource: Send {
    async fn now_playing(
        &mut self,
        access_token: &str,
        polled_at: SystemTime,
    ) -> Result<RawSnapshot, ApiError>;
}

#[async_trait]
pub trait TrackEnricher: Send {
    async fn audio_features(
        &mut self,
        access_token: &str,
        track_id: &str,
    ) -> Result<AudioFeatures, ApiError>;
    async fn artist(
        &mut self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistInfo, ApiError>;
    async fn album(&mut self, access_token: &str, album_id: &str) -> Result<AlbumInfo, ApiError>;
}

#[async_trait]
pub trait TokenRefresher: Send {
    /// Exchanges a refresh token for a fresh access token.
    async fn refresh(&mut self, refresh_token: &str) -> Result<String, ApiError>;
}

#[async_trait]
pub trait CredentialStore: Send {
    async fn load_refresh_token(&mut self) -> Result<String, CredentialStoreError>;
}

#[cfg(test)]
mod tests {
    use super::ApiError;
    use std::time::Duration;

    #[test]
    fn only_rate_limits_carry_a_retry_hint() {
        let limited = ApiError::RateLimited {
            endpoint: "me/player".to_string(),
            retry_after: Some(Duration::from_secs(5)),
        };
        let denied = ApiError::Unauthorized {
            endpoint: "me/player".to_string(),
            status: 401,
        };

        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(5)));
        assert!(!denied.is_rate_limited());
        assert_eq!(denied.retry_after(), None);
    }
}
