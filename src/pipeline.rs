use std::collections::HashSet;

use anyhow::{Context, Result};

use crate::collect::{CategoryCollector, FEATURES_CATEGORY};
use crate::export::{self, CsvExporter, Exporter, FEATURES_FILE, NAMES_FILE};
use crate::playlist::{Playlist, TrackId};
use crate::source::AnalysisSource;
use crate::table::{assemble, CategoryTable, CombinedTable};

/// Summary of one processed playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistReport {
    pub export_key: String,
    pub tracks: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub categories: usize,
    pub rows: usize,
}

/// Fetch, reshape and export the analyses of one playlist.
///
/// The exporter is called exactly once, after assembly, with the playlist's
/// export key, even when no track could be fetched.
pub fn process_analyses<S, E>(
    playlist: &Playlist,
    collector: &CategoryCollector<'_, S>,
    exporter: &E,
) -> Result<PlaylistReport>
where
    S: AnalysisSource + ?Sized,
    E: Exporter + ?Sized,
{
    let collection = collector
        .collect(playlist)
        .with_context(|| format!("Failed to collect analyses for \"{}\"", playlist.name))?;

    let table = assemble(&collection.track_ids, &collection.category_rows);
    log_summary(&table);

    let export_key = playlist.export_key();
    exporter
        .export(&table, &export_key)
        .with_context(|| format!("Failed to export \"{export_key}\""))?;

    Ok(PlaylistReport {
        export_key,
        tracks: playlist.tracks.len(),
        fetched: collection.track_ids.len(),
        skipped: collection.skipped.len(),
        categories: table.categories().len(),
        rows: table.row_count(),
    })
}

/// Fetch audio features for every track and write them as one row per track.
pub fn process_features<S>(
    playlist: &Playlist,
    collector: &CategoryCollector<'_, S>,
    exporter: &CsvExporter,
) -> Result<PlaylistReport>
where
    S: AnalysisSource + ?Sized,
{
    let collection = collector
        .collect_features(playlist)
        .with_context(|| format!("Failed to collect features for \"{}\"", playlist.name))?;

    let table = assemble(&collection.track_ids, &collection.category_rows);
    let features = table.category(FEATURES_CATEGORY).cloned().unwrap_or_else(|| CategoryTable {
        name: FEATURES_CATEGORY.to_string(),
        columns: Vec::new(),
        blocks: Vec::new(),
    });

    let export_key = playlist.export_key();
    let dir = exporter.ensure_destination(&export_key)?;
    let path = dir.join(FEATURES_FILE);
    export::write_track_table(&features, &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("Wrote {} feature rows to {}", features.row_count(), path.display());

    Ok(PlaylistReport {
        export_key,
        tracks: playlist.tracks.len(),
        fetched: collection.track_ids.len(),
        skipped: collection.skipped.len(),
        categories: 1,
        rows: features.row_count(),
    })
}

/// Write the `song_id → song_name` table of a playlist. Needs no upstream requests.
pub fn process_names(playlist: &Playlist, exporter: &CsvExporter) -> Result<usize> {
    let names = track_names(playlist);
    let dir = exporter.ensure_destination(&playlist.export_key())?;
    let path = dir.join(NAMES_FILE);
    export::write_track_names(&names, &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(names.len())
}

/// Distinct tracks of a playlist with their display names, first occurrence wins.
pub fn track_names(playlist: &Playlist) -> Vec<(TrackId, String)> {
    let mut seen = HashSet::new();
    playlist
        .tracks
        .iter()
        .filter_map(|t| {
            let id = t.track_id();
            seen.insert(id.clone()).then(|| (id, t.track_name.clone()))
        })
        .collect()
}

fn log_summary(table: &CombinedTable) {
    for category in table.categories() {
        log::info!(
            "  {:<12} {:>6} rows  {:>3} tracks  {:>3} columns",
            category.name,
            category.row_count(),
            category.blocks.len(),
            category.columns.len()
        );
    }
    if log::log_enabled!(log::Level::Debug) {
        for (track_id, firsts) in table.first_rows_by_track() {
            let fields: Vec<String> = firsts.iter().map(|(column, value)| format!("{column}={value}")).collect();
            log::debug!("  {track_id}: {}", fields.join(" "));
        }
    }
}
