use playtrace_core::{
    AppConfig, EnrichedTrack, Enrichment, FinishedSessionRecord, PlayingTrack, RawSnapshot,
    TrackId,
};
use std::time::{Duration, SystemTime};

mod orchestrator;

pub use orchestrator::{
    Capabilities, Clock, Credentials, FatalError, Orchestrator, OrchestratorConfig,
    PipelineState, SessionSink, SystemClock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing open, nothing playing.
    Idle,
    Opened,
    Continued,
    /// The open session closed because another track started.
    TrackChanged,
    Stopped,
    /// A stop whose elapsed time hit the flicker threshold; no record.
    StopSuppressed,
}

#[derive(Debug, Clone)]
pub struct TrackerOutput {
    pub transition: Transition,
    pub record: Option<FinishedSessionRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub stop_glitch_secs: Option<u64>,
}

impl TrackerConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        let secs = cfg.session.stop_glitch_secs;
        Self {
            stop_glitch_secs: (secs > 0).then_some(secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenSession {
    pub track: PlayingTrack,
    pub started_at: SystemTime,
    pub enrichment: Option<Enrichment>,
}

/// Turns a stream of now-playing snapshots into finished listening
/// sessions. Deterministic and free of I/O; the caller supplies the clock.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    cfg: TrackerConfig,
    session: Option<OpenSession>,
}

impl SessionTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self { cfg, session: None }
    }

    pub fn session(&self) -> Option<&OpenSession> {
        self.session.as_ref()
    }

    pub fn active_track_id(&self) -> Option<&TrackId> {
        self.session.as_ref().map(|s| &s.track.id)
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Drops any open session without emitting a record.
    pub fn reset(&mut self) -> Option<OpenSession> {
        self.session.take()
    }

    pub fn advance(
        &mut self,
        snapshot: RawSnapshot,
        enriched: Option<EnrichedTrack>,
        now: SystemTime,
    ) -> Option<FinishedSessionRecord> {
        self.step(snapshot, enriched, now).record
    }

    pub fn step(
        &mut self,
        snapshot: RawSnapshot,
        enriched: Option<EnrichedTrack>,
        now: SystemTime,
    ) -> TrackerOutput {
        let incoming = match snapshot {
            RawSnapshot::Empty => None,
            RawSnapshot::Playing(track) => Some(track),
        };

        match (self.session.take(), incoming) {
            (None, None) => TrackerOutput {
                transition: Transition::Idle,
                record: None,
            },
            (None, Some(track)) => {
                self.open(track, enriched, now);
                TrackerOutput {
                    transition: Transition::Opened,
                    record: None,
                }
            }
            (Some(open), Some(track)) if open.track.id == track.id => {
                self.session = Some(open);
                TrackerOutput {
                    transition: Transition::Continued,
                    record: None,
                }
            }
            (Some(open), Some(track)) => {
                let record = close(open, now);
                self.open(track, enriched, now);
                TrackerOutput {
                    transition: Transition::TrackChanged,
                    record: Some(record),
                }
            }
            (Some(open), None) => {
                let record = close(open, now);
                if self.cfg.stop_glitch_secs == Some(record.elapsed_seconds) {
                    TrackerOutput {
                        transition: Transition::StopSuppressed,
                        record: None,
                    }
                } else {
                    TrackerOutput {
                        transition: Transition::Stopped,
                        record: Some(record),
                    }
                }
            }
        }
    }

    fn open(&mut self, track: PlayingTrack, enriched: Option<EnrichedTrack>, now: SystemTime) {
        let enrichment = enriched
            .filter(|e| e.track.id == track.id)
            .map(|e| e.enrichment);
        self.session = Some(OpenSession {
            track,
            started_at: now,
            enrichment,
        });
    }
}

fn close(open: OpenSession, now: SystemTime) -> FinishedSessionRecord {
    FinishedSessionRecord {
        elapsed_seconds: elapsed_seconds(open.started_at, now),
        track: open.track,
        enrichment: open.enrichment,
        ended_at: now,
    }
}

/// Whole seconds between two wall-clock instants, rounded half up. A clock
/// that went backwards counts as zero.
fn elapsed_seconds(started_at: SystemTime, now: SystemTime) -> u64 {
    let elapsed = now.duration_since(started_at).unwrap_or(Duration::ZERO);
    let millis = elapsed.as_millis() as u64;
    (millis + 500) / 1_000
}

#[cfg(test)]
mod tests {
    use super::{elapsed_seconds, SessionTracker, TrackerConfig, Transition};
    use playtrace_core::{
        AlbumInfo, AppConfig, ArtistInfo, AudioFeatures, EnrichedTrack, Enrichment,
        PlayingTrack, RawSnapshot, TrackId,
    };
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn tracker() -> SessionTracker {
        SessionTracker::new(TrackerConfig {
            stop_glitch_secs: Some(2),
        })
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn track(id: &str, secs: u64) -> PlayingTrack {
        PlayingTrack {
            id: TrackId::from(id),
            name: format!("Song {id}"),
            artist_id: format!("artist{id}"),
            artist_name: "Artist".to_string(),
            album_id: format!("album{id}"),
            album_name: "Album".to_string(),
            duration_ms: Some(180_000),
            is_playing: true,
            polled_at: at(secs),
        }
    }

    fn playing(id: &str, secs: u64) -> RawSnapshot {
        RawSnapshot::Playing(track(id, secs))
    }

    fn enriched(id: &str, secs: u64) -> Option<EnrichedTrack> {
        Some(EnrichedTrack {
            track: track(id, secs),
            enrichment: Enrichment {
                features: AudioFeatures {
                    tempo: 120.0,
                    ..AudioFeatures::default()
                },
                artist: ArtistInfo {
                    id: format!("artist{id}"),
                    name: "Artist".to_string(),
                    ..ArtistInfo::default()
                },
                album: AlbumInfo {
                    id: format!("album{id}"),
                    name: "Album".to_string(),
                    ..AlbumInfo::default()
                },
            },
        })
    }

    #[test]
    fn empty_while_closed_is_a_no_op() {
        let mut t = tracker();
        let out = t.step(RawSnapshot::Empty, None, at(0));
        assert_eq!(out.transition, Transition::Idle);
        assert!(out.record.is_none());
        assert!(!t.is_open());
    }

    #[test]
    fn repeated_track_never_emits() {
        let mut t = tracker();
        for secs in [0, 2, 4, 6] {
            assert!(t.advance(playing("A", secs), enriched("A", secs), at(secs)).is_none());
        }
        assert_eq!(t.active_track_id().map(TrackId::as_str), Some("A"));
        assert_eq!(t.session().map(|s| s.started_at), Some(at(0)));
    }

    #[test]
    fn stop_records_exact_elapsed_time() {
        let mut t = tracker();
        t.advance(playing("A", 10), enriched("A", 10), at(10));
        t.advance(playing("A", 40), enriched("A", 40), at(40));

        let record = t.advance(RawSnapshot::Empty, None, at(73)).unwrap();
        assert_eq!(record.track.id.as_str(), "A");
        assert_eq!(record.elapsed_seconds, 63);
        assert_eq!(record.ended_at, at(73));
        assert!(!t.is_open());
    }

    #[test]
    fn track_change_closes_and_reopens_at_same_instant() {
        let mut t = tracker();
        t.advance(playing("A", 0), enriched("A", 0), at(0));

        let out = t.step(playing("B", 7), enriched("B", 7), at(7));
        assert_eq!(out.transition, Transition::TrackChanged);
        let record = out.record.unwrap();
        assert_eq!(record.track.id.as_str(), "A");
        assert_eq!(record.elapsed_seconds, 7);

        let open = t.session().unwrap();
        assert_eq!(open.track.id.as_str(), "B");
        assert_eq!(open.started_at, at(7));
    }

    #[test]
    fn record_keeps_enrichment_captured_at_open() {
        let mut t = tracker();
        t.advance(playing("A", 0), enriched("A", 0), at(0));
        let record = t.advance(playing("B", 30), enriched("B", 30), at(30)).unwrap();

        let enrichment = record.enrichment.unwrap();
        assert_eq!(enrichment.artist.id, "artistA");
        assert_eq!(enrichment.features.tempo, 120.0);
    }

    #[test]
    fn mismatched_enrichment_is_not_attached() {
        let mut t = tracker();
        t.advance(playing("A", 0), enriched("Z", 0), at(0));
        let record = t.advance(RawSnapshot::Empty, None, at(30)).unwrap();
        assert!(record.enrichment.is_none());
    }

    #[test]
    fn stop_at_glitch_threshold_is_suppressed() {
        let mut t = tracker();
        t.advance(playing("A", 0), None, at(0));

        let out = t.step(RawSnapshot::Empty, None, at(2));
        assert_eq!(out.transition, Transition::StopSuppressed);
        assert!(out.record.is_none());
        assert!(!t.is_open());
    }

    #[test]
    fn stops_around_the_threshold_are_recorded() {
        for secs in [1, 3] {
            let mut t = tracker();
            t.advance(playing("A", 0), None, at(0));
            let record = t.advance(RawSnapshot::Empty, None, at(secs)).unwrap();
            assert_eq!(record.elapsed_seconds, secs);
        }
    }

    #[test]
    fn track_change_at_threshold_is_never_suppressed() {
        let mut t = tracker();
        t.advance(playing("A", 0), None, at(0));
        let record = t.advance(playing("B", 2), None, at(2)).unwrap();
        assert_eq!(record.elapsed_seconds, 2);
    }

    #[test]
    fn disabled_threshold_records_every_stop() {
        let mut t = SessionTracker::new(TrackerConfig::default());
        t.advance(playing("A", 0), None, at(0));
        assert!(t.advance(RawSnapshot::Empty, None, at(2)).is_some());
    }

    #[test]
    fn zero_glitch_secs_in_config_disables_suppression() {
        let cfg: AppConfig = toml::from_str("[session]\nstop_glitch_secs = 0\n").unwrap();
        let tracker_cfg = TrackerConfig::from_app_config(&cfg);
        assert_eq!(tracker_cfg.stop_glitch_secs, None);

        let mut t = SessionTracker::new(tracker_cfg);
        t.advance(playing("A", 0), None, at(0));
        let record = t.advance(RawSnapshot::Empty, None, at(2)).unwrap();
        assert_eq!(record.elapsed_seconds, 2);
    }

    #[test]
    fn default_config_keeps_two_second_suppression() {
        let cfg = TrackerConfig::from_app_config(&AppConfig::default());
        assert_eq!(cfg.stop_glitch_secs, Some(2));
    }

    #[test]
    fn record_count_matches_closing_transitions() {
        let mut t = tracker();
        let script = [
            (Some("A"), 0),
            (Some("A"), 2),
            (Some("B"), 4),
            (None, 6),
            (None, 8),
            (Some("C"), 10),
            (None, 12),
            (Some("D"), 14),
            (Some("E"), 20),
            (None, 25),
        ];

        let records: Vec<_> = script
            .iter()
            .filter_map(|(id, secs)| {
                let snapshot = id.map_or(RawSnapshot::Empty, |id| playing(id, *secs));
                t.advance(snapshot, None, at(*secs))
            })
            .collect();

        // B stops after 2s and C after 2s: both suppressed.
        let ids: Vec<_> = records.iter().map(|r| r.track.id.as_str()).collect();
        assert_eq!(ids, ["A", "D", "E"]);
        let elapsed: Vec<_> = records.iter().map(|r| r.elapsed_seconds).collect();
        assert_eq!(elapsed, [4, 6, 5]);
    }

    #[test]
    fn reset_discards_open_session_silently() {
        let mut t = tracker();
        t.advance(playing("A", 0), None, at(0));

        let discarded = t.reset().unwrap();
        assert_eq!(discarded.track.id.as_str(), "A");
        assert!(!t.is_open());
        assert!(t.advance(RawSnapshot::Empty, None, at(60)).is_none());
    }

    #[test]
    fn elapsed_rounds_to_nearest_second() {
        let start = at(0);
        assert_eq!(elapsed_seconds(start, start + Duration::from_millis(2_499)), 2);
        assert_eq!(elapsed_seconds(start, start + Duration::from_millis(2_500)), 3);
        assert_eq!(elapsed_seconds(start + Duration::from_secs(5), start), 0);
    }
}
