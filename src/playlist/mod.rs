use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::TRACK_URI_PREFIX;

#[derive(Error, Debug)]
pub enum PlaylistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid slice {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("Cannot read directory {path}: {message}")]
    Walk { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, PlaylistError>;

/// Upstream identifier of a track, unique within a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from a `spotify:track:<id>` URI. A bare id passes through.
    pub fn from_uri(uri: &str) -> Self {
        let uri = uri.trim();
        Self(uri.strip_prefix(TRACK_URI_PREFIX).unwrap_or(uri).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One playlist entry from a dataset slice (partial — we only need these fields).
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistTrack {
    pub track_uri: String,
    /// Display name, used for diagnostics only.
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artist_name: Option<String>,
    #[serde(default)]
    pub pos: Option<u32>,
}

impl PlaylistTrack {
    pub fn track_id(&self) -> TrackId {
        TrackId::from_uri(&self.track_uri)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playlist {
    pub name: String,
    pub pid: u64,
    #[serde(default)]
    pub tracks: Vec<PlaylistTrack>,
}

impl Playlist {
    /// Destination key handed to the exporter: `<name>-<pid>`, safe as a
    /// single path component.
    pub fn export_key(&self) -> String {
        let raw = format!("{}-{}", self.name.trim(), self.pid);
        raw.chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect()
    }
}

/// Million Playlist Dataset slice file layout (partial).
#[derive(Debug, Deserialize)]
struct Slice {
    playlists: Vec<Playlist>,
}

/// Parse all playlists in one slice file.
pub fn load_slice(path: &Path) -> Result<Vec<Playlist>> {
    let contents = std::fs::read_to_string(path)?;
    let slice: Slice = serde_json::from_str(&contents).map_err(|source| PlaylistError::Json {
        path: path.display().to_string(),
        source,
    })?;
    log::debug!("{}: {} playlists", path.display(), slice.playlists.len());
    Ok(slice.playlists)
}

/// List slice files (`*.json`) directly inside `dir`, sorted by file name.
pub fn slice_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PlaylistError::Walk {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_json = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Load playlists from every slice in `dir`, in slice order, stopping once
/// `limit` playlists are collected.
pub fn load_playlists(dir: &Path, limit: Option<usize>) -> Result<Vec<Playlist>> {
    let mut playlists = Vec::new();
    for file in slice_files(dir)? {
        if limit.is_some_and(|n| playlists.len() >= n) {
            break;
        }
        log::info!("Processing slice: {}", file.display());
        playlists.extend(load_slice(&file)?);
    }
    if let Some(n) = limit {
        playlists.truncate(n);
    }
    Ok(playlists)
}
