//! Playlist poller: periodically fetches the upstream live playlist, turns
//! its entries into [`SegmentRef`]s and feeds them through the
//! [`SegmentIndex`] into the download queue.

use std::time::Duration;

use bytes::Bytes;
use m3u8_rs::MediaPlaylist;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PollerConfig;
use crate::error::{RelayError, Result};
use crate::history::HistoryLog;
use crate::index::SegmentIndex;
use crate::segment::SegmentRef;

enum PollResult {
    /// Parsed fine; carries how many new segments were accepted.
    Parsed(usize),
    /// Upstream served an empty body; poll again quickly.
    Empty,
    /// Byte-identical to the previous fetch; nothing to parse.
    Unchanged,
}

pub struct PlaylistPoller {
    client: reqwest::Client,
    config: PollerConfig,
    playlist_url: Url,
    index: SegmentIndex,
    history: HistoryLog,
    queue_tx: mpsc::Sender<SegmentRef>,
    /// Broadcasts the learned `#EXT-X-TARGETDURATION` to the pacing loops.
    duration_tx: watch::Sender<Duration>,
    /// Baseline history retention on top of the queue's in-flight count.
    history_keep: usize,
    last_body: Option<Bytes>,
}

impl PlaylistPoller {
    pub fn new(
        config: PollerConfig,
        playlist_url: Url,
        history: HistoryLog,
        queue_tx: mpsc::Sender<SegmentRef>,
        duration_tx: watch::Sender<Duration>,
        history_keep: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            playlist_url,
            index: SegmentIndex::new(),
            history,
            queue_tx,
            duration_tx,
            history_keep,
            last_body: None,
        }
    }

    /// Rebuild the index from previously persisted history and re-queue
    /// entries whose download never landed on disk. Returns how many were
    /// re-queued. Must run before the first poll.
    pub async fn seed(&mut self, entries: Vec<SegmentRef>, download_dir: &std::path::Path) -> Result<usize> {
        let mut requeued = 0;
        for seg in entries {
            if !self.index.ingest(&seg).is_accepted() {
                continue;
            }
            if !download_dir.join(seg.file_name()).exists() {
                self.queue_tx
                    .send(seg.clone())
                    .await
                    .map_err(|_| RelayError::Playlist {
                        reason: "download queue closed during seed".into(),
                    })?;
                requeued += 1;
            }
            self.history.push(seg);
        }
        if requeued > 0 {
            info!(requeued, "resumed mid-stream from persisted history");
        }
        Ok(requeued)
    }

    /// Poll until cancelled or too many consecutive fetches fail.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut failures = 0u32;
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            let delay = match self.poll_once().await {
                Ok(PollResult::Parsed(accepted)) => {
                    failures = 0;
                    debug!(accepted, "playlist poll complete");
                    self.config.poll_interval
                }
                Ok(PollResult::Unchanged) => {
                    failures = 0;
                    self.config.poll_interval
                }
                Ok(PollResult::Empty) => {
                    failures = 0;
                    self.config.empty_poll_interval
                }
                Err(RelayError::Cancelled) => return Ok(()),
                Err(e) => {
                    failures += 1;
                    if failures > self.config.max_consecutive_failures {
                        warn!(failures, "playlist retries exhausted, giving up");
                        return Err(RelayError::Playlist {
                            reason: format!("{failures} consecutive poll failures: {e}"),
                        });
                    }
                    warn!(failures, error = %e, "playlist poll failed, retrying");
                    (self.config.poll_interval * failures).min(Duration::from_secs(60))
                }
            };
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn poll_once(&mut self) -> Result<PollResult> {
        let response = self
            .client
            .get(self.playlist_url.clone())
            .timeout(self.config.fetch_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::Playlist {
                reason: format!("HTTP {} fetching {}", response.status(), self.playlist_url),
            });
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            warn!("empty playlist body");
            return Ok(PollResult::Empty);
        }
        if self.last_body.as_ref() == Some(&body) {
            return Ok(PollResult::Unchanged);
        }

        let playlist = match m3u8_rs::parse_playlist_res(&body) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => pl,
            Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
                return Err(RelayError::Playlist {
                    reason: format!("{} is a master playlist, expected media", self.playlist_url),
                });
            }
            Err(e) => {
                return Err(RelayError::Playlist {
                    reason: format!("unparseable playlist: {e}"),
                });
            }
        };

        if playlist.target_duration > 0 {
            self.duration_tx
                .send_replace(Duration::from_secs_f64(playlist.target_duration as f64));
        }

        let refs = collect_refs(&playlist, &self.playlist_url);
        if refs.is_empty() {
            warn!("playlist contained no usable segments");
            self.last_body = Some(body);
            return Ok(PollResult::Empty);
        }

        let mut accepted = 0usize;
        for seg in refs {
            if self.index.ingest(&seg).is_accepted() {
                self.history.push(seg.clone());
                self.queue_tx
                    .send(seg)
                    .await
                    .map_err(|_| RelayError::Cancelled)?;
                accepted += 1;
            }
        }
        self.last_body = Some(body);

        // History needs to cover everything still in flight plus the
        // configured buffer depth; anything older can never be replayed.
        let pending = self.queue_tx.max_capacity() - self.queue_tx.capacity();
        for key in self.history.prune(self.history_keep + pending) {
            self.index.forget(key);
        }
        self.history.persist().await?;

        Ok(PollResult::Parsed(accepted))
    }
}

/// Walk a media playlist and produce one [`SegmentRef`] per entry, resolving
/// relative URIs against `base` and assigning each segment its source-clock
/// timestamp: `#EXT-X-PROGRAM-DATE-TIME` where present (chrono handles the
/// UTC/zone arithmetic at parse time, re-evaluated every poll), otherwise
/// extrapolated from the previous segment's timestamp and duration.
pub(crate) fn collect_refs(playlist: &MediaPlaylist, base: &Url) -> Vec<SegmentRef> {
    let mut refs = Vec::with_capacity(playlist.segments.len());
    let mut last_ts: f64 = 0.0;
    for segment in &playlist.segments {
        let timestamp = match segment.program_date_time {
            Some(pdt) => pdt.timestamp_millis() as f64 / 1000.0,
            None if last_ts > 0.0 => last_ts + segment.duration as f64,
            // No usable clock yet; 0 marks "unknown" and is ignored by the
            // drift logic downstream.
            None => 0.0,
        };
        last_ts = timestamp;

        let resolved = match base.join(segment.uri.trim()) {
            Ok(u) => u.to_string(),
            Err(e) => {
                warn!(uri = %segment.uri, error = %e, "unresolvable segment URI");
                continue;
            }
        };
        match SegmentRef::parse(resolved, timestamp) {
            Some(seg) => refs.push(seg),
            None => warn!(uri = %segment.uri, "malformed segment URL"),
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_playlist(text: &str) -> MediaPlaylist {
        match m3u8_rs::parse_playlist_res(text.as_bytes()).expect("playlist should parse") {
            m3u8_rs::Playlist::MediaPlaylist(pl) => pl,
            m3u8_rs::Playlist::MasterPlaylist(_) => panic!("expected media playlist"),
        }
    }

    const FEED: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:368624\n\
#EXT-X-PROGRAM-DATE-TIME:2023-01-10T15:19:14Z\n\
#EXTINF:4.0,\n\
/live/chunk_aac_4_1673363954_368624.ts?id=live\n\
#EXT-X-PROGRAM-DATE-TIME:2023-01-10T15:19:18Z\n\
#EXTINF:4.0,\n\
/live/chunk_aac_4_1673363954_368625.ts?id=live\n";

    #[test]
    fn collects_refs_with_program_date_time() {
        let base = Url::parse("https://stream.example.net/live.m3u8").expect("url");
        let refs = collect_refs(&media_playlist(FEED), &base);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].key(), (1673363954, 368624));
        assert_eq!(refs[1].key(), (1673363954, 368625));
        // 2023-01-10T15:19:14Z
        assert_eq!(refs[0].timestamp, 1673363954.0);
        assert_eq!(refs[1].timestamp - refs[0].timestamp, 4.0);
        assert!(refs[0].url.starts_with("https://stream.example.net/live/"));
    }

    #[test]
    fn extrapolates_timestamp_when_tag_missing() {
        let text = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-PROGRAM-DATE-TIME:2023-01-10T15:19:14Z\n\
#EXTINF:4.0,\n\
chunk_4_100.ts\n\
#EXTINF:4.0,\n\
chunk_4_101.ts\n";
        let base = Url::parse("https://example.net/live/").expect("url");
        let refs = collect_refs(&media_playlist(text), &base);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].timestamp - refs[0].timestamp, 4.0);
    }

    #[test]
    fn skips_malformed_segment_urls() {
        let text = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.0,\n\
not-a-segment.bin\n\
#EXTINF:4.0,\n\
chunk_4_101.ts\n";
        let base = Url::parse("https://example.net/live/").expect("url");
        let refs = collect_refs(&media_playlist(text), &base);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].key(), (4, 101));
    }

    #[tokio::test]
    async fn seed_requeues_only_missing_downloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("chunk_4_100.ts"), b"present").expect("write");

        let (queue_tx, mut queue_rx) = mpsc::channel(16);
        let (duration_tx, _) = watch::channel(Duration::from_secs(4));
        let mut poller = PlaylistPoller::new(
            PollerConfig::default(),
            Url::parse("https://example.net/live.m3u8").expect("url"),
            HistoryLog::new(dir.path().join("history.json")),
            queue_tx,
            duration_tx,
            16,
        );

        let entries = vec![
            SegmentRef::parse("https://example.net/chunk_4_100.ts", 1.0).expect("ref"),
            SegmentRef::parse("https://example.net/chunk_4_101.ts", 5.0).expect("ref"),
        ];
        let requeued = poller.seed(entries, dir.path()).await.expect("seed");
        assert_eq!(requeued, 1);
        assert_eq!(queue_rx.recv().await.map(|s| s.key()), Some((4, 101)));
    }
}
