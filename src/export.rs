use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use csv::Writer;
use serde_json::Value;
use thiserror::Error;

use crate::playlist::TrackId;
use crate::table::{CategoryTable, CombinedTable};

/// File holding every category of a playlist in one table.
pub const COMBINED_FILE: &str = "analysis_category_tables.csv";

/// File holding the audio-features table of a playlist.
pub const FEATURES_FILE: &str = "features.csv";

/// File mapping track ids to display names.
pub const NAMES_FILE: &str = "song_names.csv";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// Persists a playlist's combined table under a destination key.
pub trait Exporter {
    fn export(&self, table: &CombinedTable, destination: &str) -> Result<()>;
}

/// Writes CSV files into `<output_dir>/<destination>/`.
pub struct CsvExporter {
    output_dir: PathBuf,
    per_category: bool,
}

impl CsvExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            per_category: true,
        }
    }

    /// Also write one `<category>.csv` per category (on by default).
    pub fn with_per_category(mut self, enabled: bool) -> Self {
        self.per_category = enabled;
        self
    }

    pub fn destination_dir(&self, destination: &str) -> PathBuf {
        self.output_dir.join(destination)
    }

    /// Create the destination directory if needed.
    pub fn ensure_destination(&self, destination: &str) -> Result<PathBuf> {
        let dir = self.destination_dir(destination);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl Exporter for CsvExporter {
    fn export(&self, table: &CombinedTable, destination: &str) -> Result<()> {
        let dir = self.ensure_destination(destination)?;

        let combined = dir.join(COMBINED_FILE);
        write_combined(table, &combined)?;
        log::info!("Wrote {} rows to {}", table.row_count(), combined.display());

        if self.per_category {
            let mut used = HashSet::new();
            used.insert(file_stem(COMBINED_FILE.trim_end_matches(".csv")));
            for category in table.categories() {
                let stem = unique_stem(&category.name, &mut used);
                let path = dir.join(format!("{stem}.csv"));
                write_category(category, &path)?;
                log::debug!("Wrote {} ({} rows)", path.display(), category.row_count());
            }
        }
        Ok(())
    }
}

/// Write the whole table: `category, track_id, row`, then the union of all
/// category columns. Cells a category does not have are left empty.
pub fn write_combined(table: &CombinedTable, path: &Path) -> Result<()> {
    let columns = table.combined_columns();
    let mut writer = Writer::from_path(path)?;

    let mut header = vec!["category".to_string(), "track_id".to_string(), "row".to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for row in table.rows() {
        let mut record = vec![row.category.to_string(), row.track_id.to_string(), row.index.to_string()];
        record.extend(columns.iter().map(|c| render(row.get(c))));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write one category: `track_id, row`, then the category's columns.
pub fn write_category(table: &CategoryTable, path: &Path) -> Result<()> {
    let mut writer = Writer::from_path(path)?;

    let mut header = vec!["track_id".to_string(), "row".to_string()];
    header.extend(table.columns.iter().cloned());
    writer.write_record(&header)?;

    for (track_id, index, cells) in table.rows() {
        let mut record = vec![track_id.to_string(), index.to_string()];
        record.extend(cells.iter().map(|c| render(c.as_ref())));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write a one-row-per-track table keyed by `song_id`.
pub fn write_track_table(table: &CategoryTable, path: &Path) -> Result<()> {
    let mut writer = Writer::from_path(path)?;

    let mut header = vec!["song_id".to_string()];
    header.extend(table.columns.iter().cloned());
    writer.write_record(&header)?;

    for (track_id, _, cells) in table.rows() {
        let mut record = vec![track_id.to_string()];
        record.extend(cells.iter().map(|c| render(c.as_ref())));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write `song_id, song_name` pairs.
pub fn write_track_names(names: &[(TrackId, String)], path: &Path) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["song_id", "song_name"])?;
    for (track_id, name) in names {
        writer.write_record([track_id.as_str(), name.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Strings are written raw, other values as JSON. Absent and null are empty.
fn render(cell: Option<&Value>) -> String {
    match cell {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// A file stem for `name` not yet in `used`, suffixed `_2`, `_3`, ... on a clash.
fn unique_stem(name: &str, used: &mut HashSet<String>) -> String {
    let base = file_stem(name);
    let mut stem = base.clone();
    let mut n = 2;
    while !used.insert(stem.clone()) {
        log::warn!("Category '{name}' clashes with file {stem}.csv");
        stem = format!("{base}_{n}");
        n += 1;
    }
    stem
}
