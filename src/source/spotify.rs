use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use ureq::Agent;

use super::{AnalysisDocument, AnalysisSource, FetchError};
use crate::config::SpotifyConfig;
use crate::playlist::TrackId;

/// Tokens are refreshed this long before the upstream says they expire.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

/// Client-credentials token endpoint response (partial).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Spotify Web API client for track analyses and audio features.
pub struct SpotifyClient {
    agent: Agent,
    api_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyClient {
    /// Build a client from config. Fails fast when no credentials are available.
    pub fn new(config: &SpotifyConfig) -> Result<Self, FetchError> {
        let (client_id, client_secret) = config.credentials().ok_or_else(|| {
            FetchError::Unauthorized(
                "no client credentials; set SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET".to_string(),
            )
        })?;

        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .build()
            .into();

        Ok(Self {
            agent,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    /// Return a valid bearer token, requesting a new one when the cached one expired.
    fn bearer(&self) -> Result<String, FetchError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| FetchError::Transport("token cache poisoned".to_string()))?;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        log::debug!("Requesting access token from {}", self.token_url);
        let response: TokenResponse = self
            .agent
            .post(&self.token_url)
            .send_form([
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .map_err(|e| match FetchError::from(e) {
                FetchError::Http(status) => {
                    FetchError::Unauthorized(format!("token request rejected (HTTP {status})"))
                }
                other => other,
            })?
            .body_mut()
            .read_json()
            .map_err(FetchError::from)?;

        let lifetime = response.expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        let access_token = response.access_token;
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(access_token)
    }

    fn invalidate_token(&self) {
        if let Ok(mut cached) = self.token.lock() {
            *cached = None;
        }
    }

    fn get_document(&self, endpoint: &str, track_id: &TrackId) -> Result<AnalysisDocument, FetchError> {
        let url = format!("{}/{endpoint}/{track_id}", self.api_base);

        // A token-endpoint rejection is final; only the API call gets a refresh.
        let token = self.bearer()?;
        match self.get_json(&url, &token) {
            // The cached token can be revoked before its advertised expiry:
            // refresh once, then let a second rejection through.
            Err(FetchError::Unauthorized(_)) => {
                log::debug!("Token rejected for {url}, refreshing");
                self.invalidate_token();
                let token = self.bearer()?;
                self.get_json(&url, &token)
            }
            other => other,
        }
    }

    fn get_json(&self, url: &str, token: &str) -> Result<AnalysisDocument, FetchError> {
        log::trace!("GET {url}");

        let body: serde_json::Value = self
            .agent
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
            .call()?
            .body_mut()
            .read_json()?;

        AnalysisDocument::from_value(body)
    }
}

impl AnalysisSource for SpotifyClient {
    fn audio_analysis(&self, track_id: &TrackId) -> Result<AnalysisDocument, FetchError> {
        self.get_document("audio-analysis", track_id)
    }

    fn audio_features(&self, track_id: &TrackId) -> Result<AnalysisDocument, FetchError> {
        self.get_document("audio-features", track_id)
    }
}

impl From<ureq::Error> for FetchError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(status) => FetchError::from_status(status),
            ureq::Error::Timeout(_) => FetchError::Timeout,
            ureq::Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => FetchError::Timeout,
            ureq::Error::Json(e) => FetchError::Malformed(e.to_string()),
            other => FetchError::Transport(other.to_string()),
        }
    }
}
