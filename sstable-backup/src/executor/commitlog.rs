//! Commit-log segment naming and point-in-time selection.
//!
//! Segments are stored as `commitlog/CommitLog-<version>-<id>.log.<millis>`,
//! where `<millis>` is the segment's modification time when it was backed up.

use regex::Regex;
use std::sync::LazyLock;

/// Key prefix of commit-log segments.
pub const COMMITLOG_PREFIX: &str = "commitlog";

static LOCAL_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^CommitLog-\d+-\d+\.log$").expect("segment pattern is valid")
});

static REMOTE_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>CommitLog-\d+-\d+\.log)\.(?P<timestamp>\d+)$")
        .expect("remote segment pattern is valid")
});

/// Whether `file_name` is a live commit-log segment.
pub fn is_segment_file(file_name: &str) -> bool {
    LOCAL_SEGMENT.is_match(file_name)
}

/// Remote key for a local segment last modified at `timestamp_millis`.
pub fn segment_key(file_name: &str, timestamp_millis: u64) -> String {
    format!("{COMMITLOG_PREFIX}/{file_name}.{timestamp_millis}")
}

/// A backed-up commit-log segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSegment {
    pub key: String,

    /// Segment file name without the timestamp suffix
    pub file_name: String,

    pub timestamp: u64,
}

impl RemoteSegment {
    pub fn from_key(key: &str) -> Option<Self> {
        let base = key.rsplit('/').next()?;
        let caps = REMOTE_SEGMENT.captures(base)?;
        Some(Self {
            key: key.to_string(),
            file_name: caps["name"].to_string(),
            timestamp: caps["timestamp"].parse().ok()?,
        })
    }
}

/// Segments needed to replay `[start, end]` (inclusive, milliseconds).
///
/// Every segment stamped inside the window is selected, plus the earliest
/// segment stamped after `end`: it may hold mutations that began inside
/// the window. The result is ordered oldest first.
pub fn select_segments(
    mut segments: Vec<RemoteSegment>,
    start: u64,
    end: u64,
) -> Vec<RemoteSegment> {
    segments.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));

    let mut selected = Vec::new();
    for segment in segments {
        if segment.timestamp < start {
            continue;
        }
        let overhang = segment.timestamp > end;
        selected.push(segment);
        if overhang {
            break;
        }
    }
    selected
}
