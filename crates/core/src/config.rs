use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_schema_version() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigIntervals {
    pub poll_ms: u64,
    pub rate_limit_fallback_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ConfigIntervals {
    fn default() -> Self {
        Self {
            poll_ms: 2_000,
            rate_limit_fallback_ms: 60_000,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A stop whose elapsed time equals this many seconds is treated as an
    /// upstream open/close flicker and not recorded. `0` disables it.
    pub stop_glitch_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_glitch_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub accounts_base: String,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: "YOUR_SPOTIFY_CLIENT_ID".to_string(),
            client_secret: "YOUR_SPOTIFY_CLIENT_SECRET".to_string(),
            api_base: "https://api.spotify.com/v1/".to_string(),
            accounts_base: "https://accounts.spotify.com/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Influx,
    Stdout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub measurement: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Influx,
            url: "http://localhost:8086/".to_string(),
            org: "playtrace".to_string(),
            bucket: "listening".to_string(),
            token: String::new(),
            measurement: "listening".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// JSON file holding at least `refresh_token`. Resolved by the binary
    /// when left unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub intervals: ConfigIntervals,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            log_level: default_log_level(),
            credentials_path: None,
            spotify: SpotifyConfig::default(),
            intervals: ConfigIntervals::default(),
            session: SessionConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, SinkKind};

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            log_level = "debug"

            [intervals]
            poll_ms = 5000

            [sink]
            kind = "stdout"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.schema_version, 1);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.intervals.poll_ms, 5_000);
        assert_eq!(cfg.intervals.rate_limit_fallback_ms, 60_000);
        assert_eq!(cfg.session.stop_glitch_secs, 2);
        assert_eq!(cfg.sink.kind, SinkKind::Stdout);
        assert_eq!(cfg.sink.bucket, "listening");
    }

    #[test]
    fn glitch_filter_can_be_switched_off_in_toml() {
        let cfg: AppConfig = toml::from_str("[session]\nstop_glitch_secs = 0\n").unwrap();
        assert_eq!(cfg.session.stop_glitch_secs, 0);

        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.session.stop_glitch_secs, 0);
    }

    #[test]
    fn default_config_survives_toml_round_trip() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.intervals.poll_ms, 2_000);
        assert!(back.credentials_path.is_none());
    }
}
