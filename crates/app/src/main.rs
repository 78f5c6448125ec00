use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playtrace_core::{AppConfig, RawSnapshot};
use playtrace_engine::{Capabilities, Orchestrator, OrchestratorConfig};
use playtrace_providers::{
    CredentialStore, FileCredentialStore, NowPlayingSource, SpotifyClient, TokenRefresher,
};
use playtrace_sink::build_sink;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "playtrace",
    about = "Spotify now playing -> listening sessions -> metrics sink"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run,
    Status,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Run);
    let cfg_path = cli.config.unwrap_or_else(default_config_path);

    match cmd {
        Commands::Config {
            action: ConfigAction::Init,
        } => {
            init_config(&cfg_path)?;
            println!("Initialized config at {}", cfg_path.display());
            Ok(())
        }
        Commands::Status => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            status(&cfg).await
        }
        Commands::Run => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            run(cfg).await
        }
    }
}

async fn run(cfg: AppConfig) -> Result<()> {
    let timeout = Duration::from_millis(cfg.intervals.request_timeout_ms);
    let spotify = SpotifyClient::new(&cfg.spotify, timeout)?;
    let credentials_path = credentials_path(&cfg);
    let sink = build_sink(&cfg.sink, timeout)?;

    info!(
        credentials = %credentials_path.display(),
        sink = sink.name(),
        poll_ms = cfg.intervals.poll_ms,
        "playtrace started"
    );

    let caps = Capabilities {
        player: Box::new(spotify.clone()),
        enricher: Box::new(spotify.clone()),
        refresher: Box::new(spotify),
        store: Box::new(FileCredentialStore::new(credentials_path)),
        sink,
    };
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::from_app_config(&cfg), caps);

    tokio::select! {
        res = orchestrator.run() => {
            if let Err(err) = res {
                error!(error = %err, "recording halted; fix the stored credentials and restart");
                return Err(err).context("recording halted");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c; shutting down");
        }
    }

    Ok(())
}

async fn status(cfg: &AppConfig) -> Result<()> {
    let timeout = Duration::from_millis(cfg.intervals.request_timeout_ms);
    let mut spotify = SpotifyClient::new(&cfg.spotify, timeout)?;
    let mut store = FileCredentialStore::new(credentials_path(cfg));

    let refresh_token = store.load_refresh_token().await?;
    let access_token = spotify
        .refresh(&refresh_token)
        .await
        .context("token refresh failed")?;
    let snapshot = spotify
        .now_playing(&access_token, SystemTime::now())
        .await
        .context("now-playing request failed")?;

    println!("credentials: {}", store.path().display());
    match snapshot {
        RawSnapshot::Empty => println!("track: <none>"),
        RawSnapshot::Playing(track) => {
            println!("track: {} - {}", track.artist_name, track.name);
            println!("album: {}", track.album_name);
            println!("id: {}", track.id);
            println!("playing: {}", track.is_playing);
        }
    }
    Ok(())
}

fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("playtrace").join("config.toml")
}

fn credentials_path(cfg: &AppConfig) -> PathBuf {
    cfg.credentials_path.clone().unwrap_or_else(|| {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("playtrace").join("spotify_keys.json")
    })
}

fn init_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let cfg = AppConfig::default();
    let toml = toml::to_string_pretty(&cfg)?;
    std::fs::write(path, toml)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

fn load_or_default(path: &Path) -> Result<AppConfig> {
    let mut cfg = read_config(path)?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

fn apply_env_overrides(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
    let non_blank = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = non_blank("PLAYTRACE_LOG_LEVEL") {
        cfg.log_level = v;
    }
    if let Some(v) = non_blank("PLAYTRACE_CREDENTIALS") {
        cfg.credentials_path = Some(PathBuf::from(v));
    }
    if let Some(v) = non_blank("PLAYTRACE_SPOTIFY_CLIENT_ID") {
        cfg.spotify.client_id = v;
    }
    if let Some(v) = non_blank("PLAYTRACE_SPOTIFY_CLIENT_SECRET") {
        cfg.spotify.client_secret = v;
    }
    if let Some(v) = non_blank("PLAYTRACE_INFLUX_TOKEN") {
        cfg.sink.token = v;
    }
}
