use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl TrackId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The track reported by one successful now-playing poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayingTrack {
    pub id: TrackId,
    pub name: String,
    pub artist_id: String,
    pub artist_name: String,
    pub album_id: String,
    pub album_name: String,
    pub duration_ms: Option<u64>,
    pub is_playing: bool,
    pub polled_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawSnapshot {
    Empty,
    Playing(PlayingTrack),
}

impl RawSnapshot {
    pub fn track(&self) -> Option<&PlayingTrack> {
        match self {
            RawSnapshot::Empty => None,
            RawSnapshot::Playing(track) => Some(track),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFeatures {
    pub danceability: f64,
    pub energy: f64,
    pub key: i32,
    pub loudness: f64,
    pub mode: i32,
    pub speechiness: f64,
    pub acousticness: f64,
    pub instrumentalness: f64,
    pub liveness: f64,
    pub valence: f64,
    pub tempo: f64,
    pub time_signature: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtistInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub popularity: u32,
    #[serde(default)]
    pub followers: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlbumInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub album_type: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub popularity: u32,
    #[serde(default)]
    pub total_tracks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub features: AudioFeatures,
    pub artist: ArtistInfo,
    pub album: AlbumInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTrack {
    pub track: PlayingTrack,
    pub enrichment: Enrichment,
}

/// One closed listening session, ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedSessionRecord {
    pub track: PlayingTrack,
    pub enrichment: Option<Enrichment>,
    pub elapsed_seconds: u64,
    pub ended_at: SystemTime,
}
