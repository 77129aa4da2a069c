//! Persisted segment history: a JSON array of `[timestamp, url]` pairs,
//! rewritten after every successful poll so a restarted process can rebuild
//! its index and resume mid-stream without re-downloading seen segments.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::segment::SegmentRef;

#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    entries: VecDeque<SegmentRef>,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: VecDeque::new(),
        }
    }

    /// Load persisted entries from `path`, tolerating a missing file and
    /// skipping entries whose URL no longer parses.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut log = Self::new(&path);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(e.into()),
        };
        let pairs: Vec<(f64, String)> =
            serde_json::from_slice(&raw).map_err(|e| RelayError::History {
                reason: format!("unreadable history {}: {e}", path.display()),
            })?;
        for (timestamp, url) in pairs {
            match SegmentRef::parse(url.as_str(), timestamp) {
                Some(seg) => log.entries.push_back(seg),
                None => warn!(url, "dropping malformed history entry"),
            }
        }
        debug!(entries = log.entries.len(), path = %path.display(), "history loaded");
        Ok(log)
    }

    pub fn push(&mut self, seg: SegmentRef) {
        self.entries.push_back(seg);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SegmentRef> {
        self.entries.iter()
    }

    /// Trim the log to at most `keep` newest entries, returning the keys of
    /// what was removed so the index can forget them.
    pub fn prune(&mut self, keep: usize) -> Vec<(u64, u64)> {
        let mut removed = Vec::new();
        while self.entries.len() > keep {
            if let Some(old) = self.entries.pop_front() {
                removed.push(old.key());
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "pruned history");
        }
        removed
    }

    /// Rewrite the whole log on disk. Writes to a sibling temp file first so
    /// a crash mid-write never leaves a truncated history behind.
    pub async fn persist(&self) -> Result<()> {
        let pairs: Vec<(f64, &str)> = self
            .entries
            .iter()
            .map(|seg| (seg.timestamp, seg.url.as_str()))
            .collect();
        let body = serde_json::to_vec(&pairs).map_err(|e| RelayError::History {
            reason: format!("serialize: {e}"),
        })?;
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(prefix: u64, sequence: u64) -> SegmentRef {
        SegmentRef {
            prefix,
            sequence,
            timestamp: 1000.0 + sequence as f64,
            url: format!("https://example.net/chunk_{prefix}_{sequence}.ts"),
        }
    }

    #[tokio::test]
    async fn persists_and_reloads_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");

        let mut log = HistoryLog::new(&path);
        log.push(seg(4, 100));
        log.push(seg(4, 101));
        log.persist().await.expect("persist");

        let loaded = HistoryLog::load(&path).await.expect("load");
        assert_eq!(loaded.len(), 2);
        let keys: Vec<_> = loaded.entries().map(|s| s.key()).collect();
        assert_eq!(keys, vec![(4, 100), (4, 101)]);
        assert_eq!(loaded.entries().next().map(|s| s.timestamp), Some(1100.0));
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = HistoryLog::load(dir.path().join("none.json")).await.expect("load");
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        tokio::fs::write(
            &path,
            r#"[[1.0,"https://example.net/chunk_4_100.ts"],[2.0,"https://example.net/nonsense"]]"#,
        )
        .await
        .expect("write");

        let loaded = HistoryLog::load(&path).await.expect("load");
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn prune_drops_oldest_and_reports_keys() {
        let mut log = HistoryLog::new("unused.json");
        for n in 0..10 {
            log.push(seg(4, n));
        }
        let removed = log.prune(7);
        assert_eq!(removed, vec![(4, 0), (4, 1), (4, 2)]);
        assert_eq!(log.len(), 7);
        assert!(log.prune(7).is_empty());
    }
}
