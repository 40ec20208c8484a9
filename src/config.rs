use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Default number of fetch attempts per track.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding playlist slice files (used when no `--data-dir` is given).
    pub data_dir: PathBuf,
    /// Directory exports are written under, one subdirectory per playlist.
    pub output_dir: PathBuf,
    /// Fetch attempts per track before it is skipped. Clamped to at least 1.
    pub max_retries: u32,
    /// Delay between attempts in milliseconds. 0 = retry immediately.
    pub retry_backoff_ms: u64,
    /// Number of parallel fetch workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Only process the first N playlists found.
    pub playlist_limit: Option<usize>,
    /// Spotify Web API settings.
    pub spotify: SpotifyConfig,
}

/// Spotify Web API configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub api_base: String,
    pub token_url: String,
    /// Falls back to the `SPOTIFY_CLIENT_ID` environment variable.
    pub client_id: Option<String>,
    /// Falls back to the `SPOTIFY_CLIENT_SECRET` environment variable.
    pub client_secret: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("spotify_million_playlist_dataset/data"),
            output_dir: PathBuf::from("."),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: 0,
            workers: 1,
            playlist_limit: None,
            spotify: SpotifyConfig::default(),
        }
    }
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.spotify.com/v1".to_string(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
            client_id: None,
            client_secret: None,
            timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/trackframe/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Parse a TOML document into a config.
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Attempts per track, never less than one.
    pub fn resolve_max_retries(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

impl SpotifyConfig {
    /// Client credentials from config, falling back to the environment.
    pub fn credentials(&self) -> Option<(String, String)> {
        let id = self
            .client_id
            .clone()
            .or_else(|| std::env::var("SPOTIFY_CLIENT_ID").ok())?;
        let secret = self
            .client_secret
            .clone()
            .or_else(|| std::env::var("SPOTIFY_CLIENT_SECRET").ok())?;
        Some((id, secret))
    }
}
