use std::thread;
use std::time::Duration;

use crate::config::{AppConfig, DEFAULT_MAX_RETRIES};
use crate::playlist::TrackId;
use crate::source::{AnalysisDocument, AnalysisSource, FailureKind, FetchError};

/// Bounded retry settings for one upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_retries: u32,
    /// Fixed pause between attempts. Zero retries immediately.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.resolve_max_retries())
            .with_backoff(Duration::from_millis(config.retry_backoff_ms))
    }
}

/// Why a track produced no document.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipReason {
    pub attempts: u32,
    pub error: FetchError,
}

/// Result of a retried fetch. Callers branch on the tag instead of matching
/// error kinds themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Success(T),
    /// Failed for good; the track is left out and processing continues.
    Skipped(SkipReason),
    /// Resource-level failure; every later request would fail as well.
    Fatal(FetchError),
}

/// Run `request` until it succeeds, fails permanently, or `policy` runs out
/// of attempts.
pub fn fetch_with_retry<T, F>(policy: &RetryPolicy, track_id: &TrackId, mut request: F) -> FetchOutcome<T>
where
    F: FnMut(&TrackId) -> Result<T, FetchError>,
{
    let max = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        log::debug!("{track_id}: attempt {attempt}/{max}");

        let error = match request(track_id) {
            Ok(value) => return FetchOutcome::Success(value),
            Err(e) => e,
        };

        match error.kind() {
            FailureKind::Fatal => return FetchOutcome::Fatal(error),
            FailureKind::Permanent => {
                log::warn!("Skipping {track_id}: {error}");
                return FetchOutcome::Skipped(SkipReason { attempts: attempt, error });
            }
            FailureKind::Transient if attempt >= max => {
                log::warn!("Skipping {track_id} after {attempt} attempts: {error}");
                return FetchOutcome::Skipped(SkipReason { attempts: attempt, error });
            }
            FailureKind::Transient => {
                log::debug!("{track_id}: {error}, retrying");
                if !policy.backoff.is_zero() {
                    thread::sleep(policy.backoff);
                }
            }
        }
    }
}

/// An [`AnalysisSource`] paired with the retry policy applied to each request.
pub struct RetryingFetcher<'a, S: ?Sized> {
    source: &'a S,
    policy: RetryPolicy,
}

impl<'a, S: AnalysisSource + ?Sized> RetryingFetcher<'a, S> {
    pub fn new(source: &'a S, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch the time-series analysis for one track.
    pub fn fetch(&self, track_id: &TrackId) -> FetchOutcome<AnalysisDocument> {
        fetch_with_retry(&self.policy, track_id, |id| self.source.audio_analysis(id))
    }

    /// Fetch the flat audio features for one track.
    pub fn fetch_features(&self, track_id: &TrackId) -> FetchOutcome<AnalysisDocument> {
        fetch_with_retry(&self.policy, track_id, |id| self.source.audio_features(id))
    }
}
