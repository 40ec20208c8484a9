//! In-memory [`AnalysisSource`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;

use super::{AnalysisDocument, AnalysisSource, FetchError};
use crate::playlist::TrackId;

type Reply = Result<AnalysisDocument, FetchError>;

#[derive(Default)]
struct Script {
    /// Replies consumed in order; the last one repeats forever.
    replies: VecDeque<Reply>,
    calls: usize,
}

/// Replays canned replies per track and counts requests.
#[derive(Default)]
pub struct ScriptedSource {
    analyses: Mutex<HashMap<String, Script>>,
    features: Mutex<HashMap<String, Script>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `track` with the given JSON document.
    pub fn document(self, track: &str, doc: Value) -> Self {
        self.script(track, vec![AnalysisDocument::from_value(doc)])
    }

    /// Always fail `track` with `err`.
    pub fn failing(self, track: &str, err: FetchError) -> Self {
        self.script(track, vec![Err(err)])
    }

    /// Answer `track` with `replies` in order, repeating the last one.
    pub fn script(self, track: &str, replies: Vec<Reply>) -> Self {
        insert(&self.analyses, track, replies);
        self
    }

    pub fn features(self, track: &str, doc: Value) -> Self {
        insert(&self.features, track, vec![AnalysisDocument::from_value(doc)]);
        self
    }

    /// Number of analysis requests made for `track`.
    pub fn calls(&self, track: &str) -> usize {
        self.analyses
            .lock()
            .unwrap()
            .get(track)
            .map(|s| s.calls)
            .unwrap_or(0)
    }
}

fn insert(table: &Mutex<HashMap<String, Script>>, track: &str, replies: Vec<Reply>) {
    table.lock().unwrap().insert(
        track.to_string(),
        Script { replies: replies.into(), calls: 0 },
    );
}

fn reply(table: &Mutex<HashMap<String, Script>>, track_id: &TrackId) -> Reply {
    let mut table = table.lock().unwrap();
    let Some(script) = table.get_mut(track_id.as_str()) else {
        return Err(FetchError::Http(404));
    };
    script.calls += 1;
    if script.replies.len() > 1 {
        script.replies.pop_front().unwrap()
    } else {
        script.replies.front().cloned().unwrap_or(Err(FetchError::Http(404)))
    }
}

impl AnalysisSource for ScriptedSource {
    fn audio_analysis(&self, track_id: &TrackId) -> Reply {
        reply(&self.analyses, track_id)
    }

    fn audio_features(&self, track_id: &TrackId) -> Reply {
        reply(&self.features, track_id)
    }
}
