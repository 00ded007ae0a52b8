use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// A clip as written by the recorder, in the capture codec, prior to transcoding.
/// Owned by the analyzer/transcoder task for its lifetime.
#[derive(Debug, Clone)]
pub struct RawClip {
    pub path: PathBuf,
    pub capture_codec: String,
    pub started_at: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub frame_count: u64,
    pub frame_rate: f64,
}
