use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rayon::ThreadPool;
use thiserror::Error;

use crate::fetch::{FetchOutcome, RetryPolicy, RetryingFetcher, SkipReason};
use crate::normalize::{flatten_record, normalize_payload, NormalizedRow};
use crate::playlist::{Playlist, PlaylistTrack, TrackId};
use crate::source::{AnalysisDocument, AnalysisSource, FetchError};

/// Category name used for the flat audio-features report.
pub const FEATURES_CATEGORY: &str = "audio_features";

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Fetch aborted at track {track_id}: {source}")]
    Fatal { track_id: TrackId, source: FetchError },
    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// The rows one track contributed to one category, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRows {
    pub track_id: TrackId,
    pub rows: Vec<NormalizedRow>,
}

/// Rows grouped by category, then by track.
///
/// Categories keep first-seen order; blocks within a category keep the order
/// they were pushed in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryRows {
    categories: Vec<(String, Vec<TrackRows>)>,
    index: HashMap<String, usize>,
}

impl CategoryRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, category: impl Into<String>, track_id: TrackId, rows: Vec<NormalizedRow>) {
        let category = category.into();
        let slot = match self.index.get(&category) {
            Some(&i) => i,
            None => {
                self.index.insert(category.clone(), self.categories.len());
                self.categories.push((category, Vec::new()));
                self.categories.len() - 1
            }
        };
        self.categories[slot].1.push(TrackRows { track_id, rows });
    }

    pub fn get(&self, category: &str) -> Option<&[TrackRows]> {
        self.index.get(category).map(|&i| self.categories[i].1.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TrackRows])> {
        self.categories.iter().map(|(name, blocks)| (name.as_str(), blocks.as_slice()))
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Everything gathered for one playlist.
#[derive(Debug, Default)]
pub struct Collection {
    /// Tracks that produced a document, in playlist order.
    pub track_ids: Vec<TrackId>,
    pub category_rows: CategoryRows,
    /// Tracks left out, in playlist order.
    pub skipped: Vec<(TrackId, SkipReason)>,
}

/// Fetches every track of a playlist and groups the normalized rows by category.
pub struct CategoryCollector<'a, S: ?Sized> {
    fetcher: RetryingFetcher<'a, S>,
    workers: usize,
    /// Built once and reused for every playlist; `None` fetches sequentially.
    pool: Option<ThreadPool>,
    show_progress: bool,
}

impl<'a, S: AnalysisSource + ?Sized> CategoryCollector<'a, S> {
    pub fn new(source: &'a S, policy: RetryPolicy) -> Self {
        Self {
            fetcher: RetryingFetcher::new(source, policy),
            workers: 1,
            pool: None,
            show_progress: false,
        }
    }

    /// Fetch on `workers` threads. 1 fetches sequentially.
    pub fn with_workers(mut self, workers: usize) -> Result<Self, CollectError> {
        self.workers = workers.max(1);
        self.pool = if self.workers > 1 {
            Some(rayon::ThreadPoolBuilder::new().num_threads(self.workers).build()?)
        } else {
            None
        };
        Ok(self)
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Fetch analyses for all tracks and regroup them by category.
    pub fn collect(&self, playlist: &Playlist) -> Result<Collection, CollectError> {
        let (documents, skipped) = self.gather(playlist, |id| self.fetcher.fetch(id))?;
        let (track_ids, category_rows) = regroup(documents);
        Ok(Collection { track_ids, category_rows, skipped })
    }

    /// Fetch audio features for all tracks as a single one-row-per-track category.
    pub fn collect_features(&self, playlist: &Playlist) -> Result<Collection, CollectError> {
        let (documents, skipped) = self.gather(playlist, |id| self.fetcher.fetch_features(id))?;

        let mut track_ids = Vec::with_capacity(documents.len());
        let mut category_rows = CategoryRows::new();
        for (track_id, doc) in documents {
            let row = flatten_record(&doc.into_record());
            category_rows.push(FEATURES_CATEGORY, track_id.clone(), vec![row]);
            track_ids.push(track_id);
        }
        Ok(Collection { track_ids, category_rows, skipped })
    }

    /// Run `fetch` for every distinct track and return successes and skips in
    /// playlist order.
    #[allow(clippy::type_complexity)]
    fn gather<F>(
        &self,
        playlist: &Playlist,
        fetch: F,
    ) -> Result<(Vec<(TrackId, AnalysisDocument)>, Vec<(TrackId, SkipReason)>), CollectError>
    where
        F: Fn(&TrackId) -> FetchOutcome<AnalysisDocument> + Sync,
    {
        let tracks = distinct_tracks(playlist);
        log::info!(
            "Fetching {} tracks for \"{}\" with {} workers",
            tracks.len(),
            playlist.name,
            self.workers
        );

        let pb = if self.show_progress {
            let pb = ProgressBar::new(tracks.len() as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} tracks ({eta}) {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        // Set by the first fatal outcome; tracks not yet started are left alone.
        let aborted = AtomicBool::new(false);
        let run = |(position, (track_id, track)): (usize, &(TrackId, &PlaylistTrack))| {
            if aborted.load(Ordering::Acquire) {
                return (position, None);
            }
            log::info!("Analyzing: {}", track.track_name);
            pb.set_message(track.track_name.clone());
            let outcome = fetch(track_id);
            if matches!(outcome, FetchOutcome::Fatal(_)) {
                aborted.store(true, Ordering::Release);
            }
            pb.inc(1);
            (position, Some(outcome))
        };

        let mut outcomes: Vec<(usize, Option<FetchOutcome<AnalysisDocument>>)> = match &self.pool {
            Some(pool) => pool.install(|| tracks.par_iter().enumerate().map(&run).collect()),
            None => tracks
                .iter()
                .enumerate()
                .map(&run)
                .take_while(|(_, outcome)| outcome.is_some())
                .collect(),
        };

        // Completion order under a pool is arbitrary; restore playlist order.
        outcomes.sort_by_key(|(position, _)| *position);

        let mut documents = Vec::new();
        let mut skipped = Vec::new();
        for (position, outcome) in outcomes {
            let Some(outcome) = outcome else { continue };
            let track_id = tracks[position].0.clone();
            match outcome {
                FetchOutcome::Success(doc) => documents.push((track_id, doc)),
                FetchOutcome::Skipped(reason) => skipped.push((track_id, reason)),
                FetchOutcome::Fatal(source) => {
                    pb.abandon_with_message("aborted");
                    return Err(CollectError::Fatal { track_id, source });
                }
            }
        }

        pb.finish_with_message(format!("{} fetched, {} skipped", documents.len(), skipped.len()));
        Ok((documents, skipped))
    }
}

/// Derive track ids in playlist order, keeping the first occurrence of each.
fn distinct_tracks(playlist: &Playlist) -> Vec<(TrackId, &PlaylistTrack)> {
    let mut seen = HashSet::new();
    let mut tracks = Vec::with_capacity(playlist.tracks.len());
    for track in &playlist.tracks {
        let track_id = track.track_id();
        if seen.insert(track_id.clone()) {
            tracks.push((track_id, track));
        } else {
            log::info!("Duplicate track {track_id} ({}) ignored", track.track_name);
        }
    }
    tracks
}

/// Strip metadata from each document and group its rows by category.
///
/// Returns the track ids in input order and the grouped rows. A malformed
/// category is logged and left out; the rest of the document is kept.
pub fn regroup(documents: Vec<(TrackId, AnalysisDocument)>) -> (Vec<TrackId>, CategoryRows) {
    let mut track_ids = Vec::with_capacity(documents.len());
    let mut category_rows = CategoryRows::new();

    for (track_id, mut doc) in documents {
        if doc.take_metadata().is_none() {
            log::debug!("{track_id}: no '{}' field in document", crate::METADATA_FIELD);
        }
        for (category, payload) in doc.into_categories() {
            match normalize_payload(&payload) {
                Ok(rows) => {
                    log::trace!("{track_id}: {category} ({} rows)", rows.len());
                    category_rows.push(category, track_id.clone(), rows);
                }
                Err(e) => log::warn!("{track_id}: skipping malformed category '{category}': {e}"),
            }
        }
        track_ids.push(track_id);
    }

    (track_ids, category_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::scripted::ScriptedSource;
    use serde_json::json;

    fn playlist(ids: &[&str]) -> Playlist {
        Playlist {
            name: "Test".into(),
            pid: 1,
            tracks: ids
                .iter()
                .map(|id| PlaylistTrack {
                    track_uri: format!("spotify:track:{id}"),
                    track_name: format!("Song {id}"),
                    artist_name: None,
                    pos: None,
                })
                .collect(),
        }
    }

    fn ids(collection: &Collection) -> Vec<&str> {
        collection.track_ids.iter().map(TrackId::as_str).collect()
    }

    fn block_ids(rows: &CategoryRows, category: &str) -> Vec<String> {
        rows.get(category)
            .unwrap()
            .iter()
            .map(|b| b.track_id.to_string())
            .collect()
    }

    fn source() -> ScriptedSource {
        ScriptedSource::new()
            .document("t1", json!({
                "meta": {"analyzer_version": "4.0.0"},
                "bars": [{"start": 0.0}],
                "beats": [{"start": 0.0}, {"start": 0.5}],
            }))
            .document("t2", json!({"meta": {}, "bars": [{"start": 0.1}]}))
            .document("t3", json!({"meta": {}, "beats": [{"start": 0.2}], "sections": [{"tempo": 99}]}))
    }

    #[test]
    fn test_groups_by_category_in_playlist_order() {
        let source = source();
        let collector = CategoryCollector::new(&source, RetryPolicy::default());
        let c = collector.collect(&playlist(&["t1", "t2", "t3"])).unwrap();

        assert_eq!(ids(&c), vec!["t1", "t2", "t3"]);
        let names: Vec<_> = c.category_rows.category_names().collect();
        assert_eq!(names, vec!["bars", "beats", "sections"]);
        assert_eq!(block_ids(&c.category_rows, "bars"), vec!["t1", "t2"]);
        assert_eq!(block_ids(&c.category_rows, "beats"), vec!["t1", "t3"]);
        assert!(c.category_rows.get("meta").is_none());
        assert!(c.skipped.is_empty());
    }

    #[test]
    fn test_skipped_track_dropped_entirely() {
        let source = source().failing("t2", FetchError::Timeout);
        let collector = CategoryCollector::new(&source, RetryPolicy::new(5));
        let c = collector.collect(&playlist(&["t1", "t2", "t3"])).unwrap();

        assert_eq!(ids(&c), vec!["t1", "t3"]);
        assert_eq!(block_ids(&c.category_rows, "bars"), vec!["t1"]);
        assert_eq!(c.skipped.len(), 1);
        assert_eq!(c.skipped[0].0.as_str(), "t2");
        assert_eq!(c.skipped[0].1.attempts, 5);
        assert_eq!(source.calls("t2"), 5);
    }

    #[test]
    fn test_fatal_stops_collection() {
        let source = source().failing("t2", FetchError::Unauthorized("HTTP 401".into()));
        let collector = CategoryCollector::new(&source, RetryPolicy::default());
        let err = collector.collect(&playlist(&["t1", "t2", "t3"])).unwrap_err();

        assert!(matches!(err, CollectError::Fatal { ref track_id, .. } if track_id.as_str() == "t2"));
        assert_eq!(source.calls("t3"), 0);
    }

    #[test]
    fn test_fatal_stops_parallel_collection() {
        let names: Vec<String> = (0..40).map(|i| format!("t{i}")).collect();
        let source = names.iter().fold(ScriptedSource::new(), |s, name| {
            s.failing(name, FetchError::Unauthorized("HTTP 401".into()))
        });
        let list = playlist(&names.iter().map(String::as_str).collect::<Vec<_>>());

        let err = CategoryCollector::new(&source, RetryPolicy::default())
            .with_workers(4)
            .unwrap()
            .collect(&list)
            .unwrap_err();

        // Each worker stops after its own first fatal reply.
        assert!(matches!(err, CollectError::Fatal { .. }));
        let calls: usize = names.iter().map(|n| source.calls(n)).sum();
        assert!((1..=4).contains(&calls), "{calls} requests after abort");
    }

    #[test]
    fn test_pool_reused_across_playlists() {
        let source = source();
        let collector = CategoryCollector::new(&source, RetryPolicy::default())
            .with_workers(2)
            .unwrap();

        let first = collector.collect(&playlist(&["t1", "t2"])).unwrap();
        let second = collector.collect(&playlist(&["t3", "t1"])).unwrap();
        assert_eq!(ids(&first), vec!["t1", "t2"]);
        assert_eq!(ids(&second), vec!["t3", "t1"]);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let source = source().failing("t2", FetchError::Http(404));
        let list = playlist(&["t3", "t1", "t2"]);

        let sequential = CategoryCollector::new(&source, RetryPolicy::default())
            .collect(&list)
            .unwrap();
        let parallel = CategoryCollector::new(&source, RetryPolicy::default())
            .with_workers(4)
            .unwrap()
            .collect(&list)
            .unwrap();

        assert_eq!(ids(&parallel), vec!["t3", "t1"]);
        assert_eq!(sequential.track_ids, parallel.track_ids);
        assert_eq!(sequential.category_rows, parallel.category_rows);
    }

    #[test]
    fn test_duplicate_tracks_fetched_once() {
        let source = source();
        let collector = CategoryCollector::new(&source, RetryPolicy::default());
        let c = collector.collect(&playlist(&["t1", "t2", "t1"])).unwrap();

        assert_eq!(ids(&c), vec!["t1", "t2"]);
        assert_eq!(source.calls("t1"), 1);
    }

    #[test]
    fn test_malformed_category_skipped_rest_kept() {
        let docs = vec![(
            TrackId::new("t1"),
            AnalysisDocument::from_value(json!({
                "meta": {},
                "track": {"tempo": 120.0},
                "bogus": 42,
                "bars": [{"start": 0.0}],
            }))
            .unwrap(),
        )];
        let (track_ids, rows) = regroup(docs);

        assert_eq!(track_ids.len(), 1);
        let names: Vec<_> = rows.category_names().collect();
        assert_eq!(names, vec!["track", "bars"]);
    }

    #[test]
    fn test_missing_metadata_and_empty_document() {
        let docs = vec![
            (TrackId::new("t1"), AnalysisDocument::from_value(json!({"bars": [{"a": 1}]})).unwrap()),
            (TrackId::new("t2"), AnalysisDocument::from_value(json!({"meta": {}})).unwrap()),
        ];
        let (track_ids, rows) = regroup(docs);

        assert_eq!(track_ids.len(), 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get("bars").unwrap().len(), 1);
    }

    #[test]
    fn test_collect_features_one_row_per_track() {
        let source = ScriptedSource::new()
            .features("t1", json!({"danceability": 0.7, "tempo": 120.1}))
            .features("t2", json!({"danceability": 0.3, "energy": 0.9}));
        let collector = CategoryCollector::new(&source, RetryPolicy::default());
        let c = collector.collect_features(&playlist(&["t1", "t2", "t9"])).unwrap();

        assert_eq!(ids(&c), vec!["t1", "t2"]);
        let blocks = c.category_rows.get(FEATURES_CATEGORY).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].rows[0].get("energy"), Some(&json!(0.9)));
        assert_eq!(c.skipped.len(), 1);
    }
}
