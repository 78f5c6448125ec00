pub mod config;
pub mod model;

pub use config::{AppConfig, ConfigIntervals, SessionConfig, SinkConfig, SinkKind, SpotifyConfig};
pub use model::{
    AlbumInfo, ArtistInfo, AudioFeatures, EnrichedTrack, Enrichment, FinishedSessionRecord,
    PlayingTrack, RawSnapshot, TrackId,
};
