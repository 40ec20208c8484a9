pub mod spotify;

#[cfg(test)]
pub(crate) mod scripted;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::playlist::TrackId;

/// Failure of a single upstream request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("upstream server error (HTTP {0})")]
    Server(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request rejected (HTTP {0})")]
    Http(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// How the retry policy treats a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another attempt.
    Transient,
    /// Will fail the same way again; skip the track.
    Permanent,
    /// Every following request will fail too; stop the run.
    Fatal,
}

impl FetchError {
    /// Map an HTTP error status to the matching variant.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => FetchError::Unauthorized(format!("HTTP {status}")),
            429 => FetchError::RateLimited,
            500..=599 => FetchError::Server(status),
            _ => FetchError::Http(status),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Timeout
            | FetchError::RateLimited
            | FetchError::Server(_)
            | FetchError::Transport(_) => FailureKind::Transient,
            FetchError::Http(_) | FetchError::Malformed(_) => FailureKind::Permanent,
            FetchError::Unauthorized(_) => FailureKind::Fatal,
        }
    }
}

/// Raw per-track document returned by the upstream source, keyed by analysis
/// category. Category order is the order the upstream sent them in.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct AnalysisDocument(Map<String, Value>);

impl AnalysisDocument {
    pub fn new(categories: Map<String, Value>) -> Self {
        Self(categories)
    }

    /// Wrap a decoded JSON body. Anything but an object is malformed.
    pub fn from_value(value: Value) -> Result<Self, FetchError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(FetchError::Malformed(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Remove and return the bookkeeping field, keeping category order intact.
    pub fn take_metadata(&mut self) -> Option<Value> {
        self.0.shift_remove(crate::METADATA_FIELD)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_categories(self) -> impl Iterator<Item = (String, Value)> {
        self.0.into_iter()
    }

    /// The whole document as one record, for flat responses such as audio features.
    pub fn into_record(self) -> Map<String, Value> {
        self.0
    }
}

/// Upstream provider of per-track analysis documents.
///
/// Implementations must be `Sync` so the collector can fan requests out over
/// a worker pool.
pub trait AnalysisSource: Sync {
    /// Time-series audio analysis (bars, beats, sections, segments, tatums...).
    fn audio_analysis(&self, track_id: &TrackId) -> Result<AnalysisDocument, FetchError>;

    /// Flat per-track audio features (danceability, energy, tempo...).
    fn audio_features(&self, track_id: &TrackId) -> Result<AnalysisDocument, FetchError>;
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
