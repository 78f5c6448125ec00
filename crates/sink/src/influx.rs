use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use playtrace_core::{FinishedSessionRecord, SinkConfig};
use playtrace_engine::SessionSink;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use std::fmt::Write as _;
use std::time::{Duration, UNIX_EPOCH};
use tracing::debug;
use url::Url;

/// Writes each finished session as one InfluxDB v2 line-protocol point.
pub struct InfluxSink {
    http: Client,
    write_url: Url,
    token: String,
    measurement: String,
}

impl InfluxSink {
    pub fn new(cfg: &SinkConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        let mut write_url = Url::parse(&cfg.url)
            .and_then(|base| base.join("api/v2/write"))
            .with_context(|| format!("invalid influx url {}", cfg.url))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &cfg.org)
            .append_pair("bucket", &cfg.bucket)
            .append_pair("precision", "s");

        Ok(Self {
            http,
            write_url,
            token: cfg.token.clone(),
            measurement: cfg.measurement.clone(),
        })
    }
}

#[async_trait]
impl SessionSink for InfluxSink {
    fn name(&self) -> &'static str {
        "influx"
    }

    async fn write(&mut self, record: &FinishedSessionRecord) -> Result<()> {
        let line = encode_line(&self.measurement, record);
        debug!(%line, "writing point");

        let resp = self
            .http
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .body(line)
            .send()
            .await
            .context("influx write request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("influx rejected write with status {status}: {body}");
        }
        Ok(())
    }
}

enum Field {
    Str(String),
    Int(i64),
    Float(f64),
}

/// Encodes a record as a single line-protocol point, timestamped in epoch
/// seconds at the moment the session ended.
pub fn encode_line(measurement: &str, record: &FinishedSessionRecord) -> String {
    let track = &record.track;
    let mut tags = vec![
        ("track_id", track.id.as_str()),
        ("artist_id", track.artist_id.as_str()),
        ("album_id", track.album_id.as_str()),
    ];
    tags.retain(|(_, v)| !v.is_empty());

    let mut fields = vec![
        ("track", Field::Str(track.name.clone())),
        ("artist", Field::Str(track.artist_name.clone())),
        ("album", Field::Str(track.album_name.clone())),
        ("seconds", Field::Int(record.elapsed_seconds as i64)),
    ];
    if let Some(duration_ms) = track.duration_ms {
        fields.push(("duration_ms", Field::Int(duration_ms as i64)));
    }
    if let Some(e) = &record.enrichment {
        let f = &e.features;
        fields.extend([
            ("genres", Field::Str(e.artist.genres.join(","))),
            ("artist_popularity", Field::Int(e.artist.popularity.into())),
            ("artist_followers", Field::Int(e.artist.followers as i64)),
            ("album_popularity", Field::Int(e.album.popularity.into())),
            ("album_type", Field::Str(e.album.album_type.clone())),
            ("release_date", Field::Str(e.album.release_date.clone())),
            ("danceability", Field::Float(f.danceability)),
            ("energy", Field::Float(f.energy)),
            ("key", Field::Int(f.key.into())),
            ("loudness", Field::Float(f.loudness)),
            ("mode", Field::Int(f.mode.into())),
            ("speechiness", Field::Float(f.speechiness)),
            ("acousticness", Field::Float(f.acousticness)),
            ("instrumentalness", Field::Float(f.instrumentalness)),
            ("liveness", Field::Float(f.liveness)),
            ("valence", Field::Float(f.valence)),
            ("tempo", Field::Float(f.tempo)),
            ("time_signature", Field::Int(f.time_signature.into())),
        ]);
    }

    let mut line = escape(measurement, &[',', ' ']);
    for (key, value) in tags {
        let _ = write!(
            line,
            ",{}={}",
            escape(key, &[',', '=', ' ']),
            escape(value, &[',', '=', ' '])
        );
    }

    let mut first = true;
    for (key, value) in fields {
        let encoded = match value {
            Field::Str(s) => format!("\"{}\"", escape(&s, &['"'])),
            Field::Int(i) => format!("{i}i"),
            Field::Float(x) if x.is_finite() => format!("{x}"),
            Field::Float(_) => continue,
        };
        line.push(if first { ' ' } else { ',' });
        first = false;
        let _ = write!(line, "{}={}", escape(key, &[',', '=', ' ']), encoded);
    }

    let ts = record
        .ended_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let _ = write!(line, " {ts}");
    line
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
