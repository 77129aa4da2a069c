//! Segment identity parsed out of upstream URLs.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

// Upstream segment basenames end in `_<prefix>_<sequence>.<ext>`, where the
// prefix identifies the transcoder incarnation and the sequence increments
// within it, e.g. `.../chunk_aac_hifi_4_1673363954_368624.ts?id=live`.
static SEGMENT_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_(\d+)_(\d+)\.(?:ts|aac|mp3)(?:\?.*)?$").expect("segment url pattern")
});

/// A discovered-but-not-yet-downloaded segment.
///
/// Immutable once created; identity is `(prefix, sequence)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    /// Upstream transcoder incarnation. Changes when the encoder rotates.
    pub prefix: u64,
    /// Monotonically increasing position within the prefix.
    pub sequence: u64,
    /// Source-clock timestamp in epoch seconds.
    pub timestamp: f64,
    pub url: String,
}

impl SegmentRef {
    /// Parse a segment reference out of its URL, or `None` if the URL does
    /// not carry the `_<prefix>_<sequence>` identity.
    pub fn parse(url: impl Into<String>, timestamp: f64) -> Option<Self> {
        let url = url.into();
        let caps = SEGMENT_URL_RE.captures(&url)?;
        let prefix = caps.get(1)?.as_str().parse().ok()?;
        let sequence = caps.get(2)?.as_str().parse().ok()?;
        Some(Self {
            prefix,
            sequence,
            timestamp,
            url,
        })
    }

    pub fn key(&self) -> (u64, u64) {
        (self.prefix, self.sequence)
    }

    /// URL basename with any query string stripped; used as the local
    /// filename so a retried download overwrites its earlier attempt.
    pub fn file_name(&self) -> String {
        let path = self.url.split('?').next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path).to_string()
    }
}

/// A segment whose bytes are on local disk, owned by the delay buffer until
/// played and deleted.
#[derive(Debug, Clone)]
pub struct DownloadedSegment {
    pub path: PathBuf,
    /// Source-clock timestamp carried over from the [`SegmentRef`].
    pub timestamp: f64,
    pub sequence: u64,
}
