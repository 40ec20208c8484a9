//! Two-level (category, track) tables assembled from collected rows.

use std::collections::HashMap;

use serde_json::Value;

use crate::collect::CategoryRows;
use crate::normalize::NormalizedRow;
use crate::playlist::TrackId;

/// One table cell. `None` marks a field the source row did not have.
pub type Cell = Option<Value>;

/// Consecutive rows of one track inside a category table.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackBlock {
    pub track_id: TrackId,
    /// Each row has exactly one cell per column of the owning table.
    pub rows: Vec<Vec<Cell>>,
}

/// All rows of one analysis category, grouped by track.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTable {
    pub name: String,
    /// Union of the fields of every row, in first-seen order.
    pub columns: Vec<String>,
    pub blocks: Vec<TrackBlock>,
}

impl CategoryTable {
    pub fn row_count(&self) -> usize {
        self.blocks.iter().map(|b| b.rows.len()).sum()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn block(&self, track_id: &TrackId) -> Option<&TrackBlock> {
        self.blocks.iter().find(|b| &b.track_id == track_id)
    }

    /// Rows in table order with their track and intra-track index.
    pub fn rows(&self) -> impl Iterator<Item = (&TrackId, usize, &[Cell])> {
        self.blocks.iter().flat_map(|block| {
            block
                .rows
                .iter()
                .enumerate()
                .map(move |(i, row)| (&block.track_id, i, row.as_slice()))
        })
    }

    /// Value of `column` in the `row`-th row of `track_id`, if present.
    pub fn value(&self, track_id: &TrackId, row: usize, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.block(track_id)?.rows.get(row)?.get(col)?.as_ref()
    }
}

/// A row of the combined table with its full key.
#[derive(Debug, Clone, Copy)]
pub struct CombinedRow<'a> {
    pub category: &'a str,
    pub track_id: &'a TrackId,
    /// Position of the row within its track's block.
    pub index: usize,
    pub columns: &'a [String],
    pub cells: &'a [Cell],
}

impl<'a> CombinedRow<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let cells = self.cells;
        let i = self.columns.iter().position(|c| c == column)?;
        cells.get(i)?.as_ref()
    }
}

/// Every category table of a playlist, keyed by (category, track).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinedTable {
    categories: Vec<CategoryTable>,
}

impl CombinedTable {
    pub fn categories(&self) -> &[CategoryTable] {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&CategoryTable> {
        self.categories.iter().find(|t| t.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.categories.iter().map(CategoryTable::row_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Rows ordered by category, then track, then intra-track position.
    pub fn rows(&self) -> impl Iterator<Item = CombinedRow<'_>> {
        self.categories.iter().flat_map(|table| {
            table.rows().map(move |(track_id, index, cells)| CombinedRow {
                category: &table.name,
                track_id,
                index,
                columns: &table.columns,
                cells,
            })
        })
    }

    /// Rows tagged (`category`, `track_id`).
    pub fn rows_for(&self, category: &str, track_id: &TrackId) -> &[Vec<Cell>] {
        self.category(category)
            .and_then(|t| t.block(track_id))
            .map(|b| b.rows.as_slice())
            .unwrap_or(&[])
    }

    /// Union of the columns of every category, in first-seen order.
    pub fn combined_columns(&self) -> Vec<String> {
        let mut columns = ColumnSet::default();
        for table in &self.categories {
            for column in &table.columns {
                columns.insert(column);
            }
        }
        columns.names
    }

    /// Per track, the first non-null value of every column across all of the
    /// track's rows, scanning categories in table order.
    pub fn first_rows_by_track(&self) -> Vec<(TrackId, Vec<(String, Value)>)> {
        let columns = self.combined_columns();
        let col_index: HashMap<&str, usize> =
            columns.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();

        let mut tracks: Vec<(TrackId, Vec<Cell>)> = Vec::new();
        let mut track_index: HashMap<&TrackId, usize> = HashMap::new();

        for row in self.rows() {
            let slot = *track_index.entry(row.track_id).or_insert_with(|| {
                tracks.push((row.track_id.clone(), vec![None; columns.len()]));
                tracks.len() - 1
            });
            let firsts = &mut tracks[slot].1;
            for (column, cell) in row.columns.iter().zip(row.cells) {
                let Some(value) = cell else { continue };
                if value.is_null() {
                    continue;
                }
                let i = col_index[column.as_str()];
                if firsts[i].is_none() {
                    firsts[i] = Some(value.clone());
                }
            }
        }

        tracks
            .into_iter()
            .map(|(track_id, firsts)| {
                let values = columns
                    .iter()
                    .zip(firsts)
                    .filter_map(|(c, v)| v.map(|v| (c.clone(), v)))
                    .collect();
                (track_id, values)
            })
            .collect()
    }
}

#[derive(Default)]
struct ColumnSet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ColumnSet {
    fn insert(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        self.index.insert(name.to_string(), self.names.len());
        self.names.push(name.to_string());
        self.names.len() - 1
    }
}

/// Materializes [`CategoryRows`] into a [`CombinedTable`], ordering every
/// category's blocks by the position of their track in the processing order.
pub struct TableBuilder {
    position: HashMap<TrackId, usize>,
}

impl TableBuilder {
    pub fn new(track_ids: &[TrackId]) -> Self {
        let mut position = HashMap::with_capacity(track_ids.len());
        for (i, id) in track_ids.iter().enumerate() {
            position.entry(id.clone()).or_insert(i);
        }
        Self { position }
    }

    pub fn build(&self, category_rows: &CategoryRows) -> CombinedTable {
        let categories = category_rows
            .iter()
            .map(|(name, blocks)| {
                let mut ordered: Vec<(usize, &TrackId, &[NormalizedRow])> = blocks
                    .iter()
                    .filter_map(|b| match self.position.get(&b.track_id) {
                        Some(&pos) => Some((pos, &b.track_id, b.rows.as_slice())),
                        None => {
                            log::debug!("{name}: rows for unknown track {} ignored", b.track_id);
                            None
                        }
                    })
                    .collect();
                // Stable: repeated blocks of one track stay in push order.
                ordered.sort_by_key(|(pos, _, _)| *pos);
                self.category_table(name, &ordered)
            })
            .collect();

        CombinedTable { categories }
    }

    fn category_table(&self, name: &str, ordered: &[(usize, &TrackId, &[NormalizedRow])]) -> CategoryTable {
        let mut columns = ColumnSet::default();
        for (_, _, rows) in ordered {
            for row in rows.iter() {
                for field in row.field_names() {
                    columns.insert(field);
                }
            }
        }

        let width = columns.names.len();
        let mut blocks: Vec<TrackBlock> = Vec::new();
        for (_, track_id, rows) in ordered {
            if rows.is_empty() {
                continue;
            }
            let cells = rows.iter().map(|row| {
                let mut cells = vec![None; width];
                for (field, value) in row.fields() {
                    cells[columns.index[field.as_str()]] = Some(value.clone());
                }
                cells
            });
            match blocks.last_mut() {
                Some(last) if &last.track_id == *track_id => last.rows.extend(cells),
                _ => blocks.push(TrackBlock {
                    track_id: (*track_id).clone(),
                    rows: cells.collect(),
                }),
            }
        }

        CategoryTable {
            name: name.to_string(),
            columns: columns.names,
            blocks,
        }
    }
}

/// Build the combined table for one playlist.
pub fn assemble(track_ids: &[TrackId], category_rows: &CategoryRows) -> CombinedTable {
    TableBuilder::new(track_ids).build(category_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_payload;
    use serde_json::json;

    fn id(s: &str) -> TrackId {
        TrackId::new(s)
    }

    fn rows(v: Value) -> Vec<NormalizedRow> {
        normalize_payload(&v).unwrap()
    }

    fn keys(table: &CombinedTable) -> Vec<(String, String, usize)> {
        table
            .rows()
            .map(|r| (r.category.to_string(), r.track_id.to_string(), r.index))
            .collect()
    }

    #[test]
    fn test_two_tracks_bars_and_beats() {
        let mut cr = CategoryRows::new();
        cr.push("bars", id("track1"), rows(json!([{"start": 0.0}])));
        cr.push("beats", id("track1"), rows(json!([{"start": 0.0}, {"start": 0.4}])));
        cr.push("bars", id("track2"), rows(json!([{"start": 0.2}])));

        let table = assemble(&[id("track1"), id("track2")], &cr);

        assert_eq!(
            keys(&table),
            vec![
                ("bars".into(), "track1".into(), 0),
                ("bars".into(), "track2".into(), 0),
                ("beats".into(), "track1".into(), 0),
                ("beats".into(), "track1".into(), 1),
            ]
        );
        assert_eq!(table.rows_for("beats", &id("track2")).len(), 0);
    }

    #[test]
    fn test_blocks_follow_track_order_not_push_order() {
        let mut cr = CategoryRows::new();
        cr.push("beats", id("b"), rows(json!([{"x": 2}])));
        cr.push("beats", id("a"), rows(json!([{"x": 1}])));

        let table = assemble(&[id("a"), id("b")], &cr);
        let order: Vec<_> = table.categories()[0].blocks.iter().map(|b| b.track_id.to_string()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_columns_are_union_with_absent_marker() {
        let mut cr = CategoryRows::new();
        cr.push("segments", id("t1"), rows(json!([{"start": 0.0, "loudness_max": -20.1}])));
        cr.push("segments", id("t2"), rows(json!([{"start": 0.3, "confidence": 0.5}])));

        let table = assemble(&[id("t1"), id("t2")], &cr);
        let seg = table.category("segments").unwrap();

        assert_eq!(seg.columns, vec!["start", "loudness_max", "confidence"]);
        for (_, _, cells) in seg.rows() {
            assert_eq!(cells.len(), 3);
        }
        assert_eq!(seg.blocks[0].rows[0][2], None);
        assert_eq!(seg.blocks[1].rows[0][1], None);
        assert_eq!(seg.value(&id("t2"), 0, "confidence"), Some(&json!(0.5)));
    }

    #[test]
    fn test_present_null_differs_from_absent() {
        let mut cr = CategoryRows::new();
        cr.push("track", id("t1"), rows(json!({"key": null})));
        cr.push("track", id("t2"), rows(json!({"mode": 1})));

        let table = assemble(&[id("t1"), id("t2")], &cr);
        let track = table.category("track").unwrap();
        assert_eq!(track.blocks[0].rows[0], vec![Some(Value::Null), None]);
    }

    #[test]
    fn test_empty_input_gives_empty_table() {
        let table = assemble(&[], &CategoryRows::new());
        assert!(table.is_empty());
        assert_eq!(table.rows().count(), 0);
        assert!(table.combined_columns().is_empty());
        assert!(table.first_rows_by_track().is_empty());
    }

    #[test]
    fn test_unknown_track_blocks_ignored() {
        let mut cr = CategoryRows::new();
        cr.push("bars", id("t1"), rows(json!([{"a": 1}])));
        cr.push("bars", id("ghost"), rows(json!([{"a": 2, "b": 3}])));

        let table = assemble(&[id("t1")], &cr);
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.category("bars").unwrap().columns, vec!["a"]);
    }

    #[test]
    fn test_no_data_loss_and_idempotent() {
        let mut cr = CategoryRows::new();
        cr.push("tatums", id("t1"), rows(json!([{"s": 1}, {"s": 2}, {"s": 3}])));
        cr.push("tatums", id("t2"), rows(json!([{"s": 4}])));
        cr.push("sections", id("t2"), rows(json!([{"tempo": 90, "key": 2}])));
        let order = [id("t1"), id("t2")];

        let first = assemble(&order, &cr);
        let second = assemble(&order, &cr);
        assert_eq!(first, second);
        assert_eq!(format!("{first:?}"), format!("{second:?}"));

        assert_eq!(first.rows_for("tatums", &id("t1")).len(), 3);
        let values: Vec<_> = first
            .rows()
            .filter(|r| r.category == "tatums" && r.track_id.as_str() == "t1")
            .map(|r| r.get("s").cloned())
            .collect();
        assert_eq!(values, vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);
    }

    #[test]
    fn test_combined_columns_and_first_rows() {
        let mut cr = CategoryRows::new();
        cr.push("bars", id("t1"), rows(json!([{"start": null, "duration": 2.0}, {"start": 2.0}])));
        cr.push("track", id("t1"), rows(json!({"tempo": 120.0})));
        cr.push("track", id("t2"), rows(json!({"tempo": 98.0, "start": 0.0})));

        let table = assemble(&[id("t1"), id("t2")], &cr);
        assert_eq!(table.combined_columns(), vec!["start", "duration", "tempo"]);

        let firsts = table.first_rows_by_track();
        assert_eq!(firsts.len(), 2);
        assert_eq!(firsts[0].0.as_str(), "t1");
        assert_eq!(
            firsts[0].1,
            vec![
                ("start".to_string(), json!(2.0)),
                ("duration".to_string(), json!(2.0)),
                ("tempo".to_string(), json!(120.0)),
            ]
        );
        assert_eq!(firsts[1].1.len(), 2);
    }
}
