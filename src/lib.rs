pub mod collect;
pub mod config;
pub mod export;
pub mod fetch;
pub mod normalize;
pub mod pipeline;
pub mod playlist;
pub mod source;
pub mod table;

/// Prefix stripped from a track URI to obtain its track id.
pub const TRACK_URI_PREFIX: &str = "spotify:track:";

/// Non-data bookkeeping field removed from every analysis document.
pub const METADATA_FIELD: &str = "meta";

/// Application name for XDG paths
pub const APP_NAME: &str = "trackframe";
