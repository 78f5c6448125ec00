use crate::{SessionTracker, TrackerConfig, Transition};
use async_trait::async_trait;
use playtrace_core::{AppConfig, EnrichedTrack, Enrichment, FinishedSessionRecord, PlayingTrack};
use playtrace_providers::{
    ApiError, CredentialStore, CredentialStoreError, NowPlayingSource, TokenRefresher,
    TrackEnricher,
};
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait SessionSink: Send {
    fn name(&self) -> &'static str;
    async fn write(&mut self, record: &FinishedSessionRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Recovering,
    /// Terminal. Only a process restart leaves this state.
    Stopped,
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("stored credentials are unusable")]
    CredentialStore(#[from] CredentialStoreError),
    #[error("access token refresh failed")]
    Refresh(#[source] ApiError),
}

/// Access/refresh token pair. Empty until the first successful refresh and
/// replaced on every later one.
#[derive(Clone, Default)]
pub struct Credentials {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

impl Credentials {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    fn replace(&mut self, access_token: String, refresh_token: String) {
        self.access_token = Some(access_token);
        self.refresh_token = Some(refresh_token);
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |t: &Option<String>| t.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub rate_limit_fallback: Duration,
    pub tracker: TrackerConfig,
}

/// Floor for both the poll cadence and the rate-limit fallback wait.
const MIN_INTERVAL_MS: u64 = 1_000;

impl OrchestratorConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        let intervals = &cfg.intervals;
        Self {
            poll_interval: Duration::from_millis(intervals.poll_ms.max(MIN_INTERVAL_MS)),
            rate_limit_fallback: Duration::from_millis(
                intervals.rate_limit_fallback_ms.max(MIN_INTERVAL_MS),
            ),
            tracker: TrackerConfig::from_app_config(cfg),
        }
    }
}

pub struct Capabilities {
    pub player: Box<dyn NowPlayingSource>,
    pub enricher: Box<dyn TrackEnricher>,
    pub refresher: Box<dyn TokenRefresher>,
    pub store: Box<dyn CredentialStore>,
    pub sink: Box<dyn SessionSink>,
}

/// Source of the wall-clock time stamped on each poll. Read fresh every
/// tick so suspend/resume and clock corrections show up in `ended_at`.
pub trait Clock: Send {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

enum TickOutcome {
    Polled,
    RateLimited(Duration),
}

pub struct Orchestrator {
    cfg: OrchestratorConfig,
    caps: Capabilities,
    tracker: SessionTracker,
    credentials: Credentials,
    state: PipelineState,
    clock: Box<dyn Clock>,
}

impl Orchestrator {
    pub fn new(cfg: OrchestratorConfig, caps: Capabilities) -> Self {
        let tracker = SessionTracker::new(cfg.tracker.clone());
        Self {
            cfg,
            caps,
            tracker,
            credentials: Credentials::default(),
            state: PipelineState::Idle,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Loads the stored refresh token, exchanges it for an access token and
    /// moves to `Running` with no open session. Returns `Ok(false)` without
    /// doing anything when already running or permanently stopped.
    pub async fn prepare_to_record(&mut self) -> Result<bool, FatalError> {
        match self.state {
            PipelineState::Running => {
                debug!("recording already running; ignoring start request");
                return Ok(false);
            }
            PipelineState::Stopped => {
                warn!("recording halted; repair credentials and restart the process");
                return Ok(false);
            }
            PipelineState::Idle | PipelineState::Recovering => {}
        }

        self.state = PipelineState::Recovering;
        if let Err(err) = self.refresh_credentials().await {
            error!(error = %err, "cannot obtain an access token; halting");
            self.state = PipelineState::Stopped;
            return Err(err);
        }

        if let Some(discarded) = self.tracker.reset() {
            warn!(track = %discarded.track.id, "discarding session left open by the failed poll");
        }
        self.state = PipelineState::Running;
        info!("recording started");
        Ok(true)
    }

    /// Supervising loop. Returns only on a fatal credential failure, or
    /// immediately if the pipeline was already stopped.
    pub async fn run(&mut self) -> Result<(), FatalError> {
        loop {
            match self.state {
                PipelineState::Idle | PipelineState::Recovering => {
                    self.prepare_to_record().await?;
                }
                PipelineState::Running => {
                    let pause = match self.tick().await {
                        Ok(TickOutcome::Polled) => self.cfg.poll_interval,
                        Ok(TickOutcome::RateLimited(wait)) => wait,
                        Err(err) => {
                            warn!(error = %err, "poll failed; restarting with fresh credentials");
                            self.state = PipelineState::Recovering;
                            self.cfg.poll_interval
                        }
                    };
                    tokio::time::sleep(pause).await;
                }
                PipelineState::Stopped => return Ok(()),
            }
        }
    }

    async fn refresh_credentials(&mut self) -> Result<(), FatalError> {
        let refresh_token = self.caps.store.load_refresh_token().await?;
        info!("refreshing access token");
        let access_token = self
            .caps
            .refresher
            .refresh(&refresh_token)
            .await
            .map_err(FatalError::Refresh)?;
        self.credentials.replace(access_token, refresh_token);
        Ok(())
    }

    async fn tick(&mut self) -> Result<TickOutcome, ApiError> {
        match self.poll_cycle().await {
            Ok(()) => Ok(TickOutcome::Polled),
            Err(err) if err.is_rate_limited() => {
                let wait = err.retry_after().unwrap_or(self.cfg.rate_limit_fallback);
                warn!(error = %err, wait_secs = wait.as_secs(), "rate limited; backing off");
                Ok(TickOutcome::RateLimited(wait))
            }
            Err(err) => Err(err),
        }
    }

    async fn poll_cycle(&mut self) -> Result<(), ApiError> {
        let token = self
            .credentials
            .access_token()
            .ok_or(ApiError::MissingAccessToken)?
            .to_string();
        let now = self.clock.now();

        let snapshot = self.caps.player.now_playing(&token, now).await?;
        let enriched = match snapshot.track() {
            Some(track) => Some(self.enrich(&token, track).await?),
            None => None,
        };

        let out = self.tracker.step(snapshot, enriched, now);
        match out.transition {
            Transition::Opened => {
                if let Some(open) = self.tracker.session() {
                    info!(
                        track = %open.track.id,
                        name = %open.track.name,
                        artist = %open.track.artist_name,
                        "session opened"
                    );
                }
            }
            Transition::TrackChanged => debug!("track changed"),
            Transition::Stopped => debug!("playback stopped"),
            Transition::StopSuppressed => {
                debug!("stop matched the flicker threshold; not recording")
            }
            Transition::Idle | Transition::Continued => {}
        }

        if let Some(record) = out.record {
            self.submit(record).await;
        }
        Ok(())
    }

    async fn enrich(
        &mut self,
        token: &str,
        track: &PlayingTrack,
    ) -> Result<EnrichedTrack, ApiError> {
        let features = self
            .caps
            .enricher
            .audio_features(token, track.id.as_str())
            .await?;
        let artist = self.caps.enricher.artist(token, &track.artist_id).await?;
        let album = self.caps.enricher.album(token, &track.album_id).await?;
        Ok(EnrichedTrack {
            track: track.clone(),
            enrichment: Enrichment {
                features,
                artist,
                album,
            },
        })
    }

    async fn submit(&mut self, record: FinishedSessionRecord) {
        info!(
            track = %record.track.id,
            elapsed_secs = record.elapsed_seconds,
            "session closed"
        );
        if let Err(err) = self.caps.sink.write(&record).await {
            warn!(sink = self.caps.sink.name(), error = %err, "failed to write session record");
        }
    }
}
