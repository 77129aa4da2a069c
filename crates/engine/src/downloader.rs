//! Segment downloader: drains the discovery queue at live cadence, fetches
//! bytes with bounded retry and substitutes filler when a segment cannot be
//! obtained, so the timeline downstream never has a hole.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DownloaderConfig, FillerPolicy};
use crate::error::{RelayError, Result};
use crate::retry::retry_with_backoff;
use crate::segment::{DownloadedSegment, SegmentRef};

/// The network seam, mockable in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SegmentFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

pub struct HttpSegmentFetcher {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

impl HttpSegmentFetcher {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl SegmentFetch for HttpSegmentFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = self.client.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::SegmentStatus {
                status,
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?)
    }
}

pub struct SegmentDownloader<F: SegmentFetch> {
    fetcher: F,
    config: DownloaderConfig,
    download_dir: PathBuf,
    queue_rx: mpsc::Receiver<SegmentRef>,
    ready_tx: mpsc::Sender<DownloadedSegment>,
    duration_rx: watch::Receiver<std::time::Duration>,
    /// Payload of the most recent good download, the default filler source.
    last_good: Option<Bytes>,
    silence: Option<Bytes>,
}

impl<F: SegmentFetch> SegmentDownloader<F> {
    pub fn new(
        fetcher: F,
        config: DownloaderConfig,
        download_dir: PathBuf,
        queue_rx: mpsc::Receiver<SegmentRef>,
        ready_tx: mpsc::Sender<DownloadedSegment>,
        duration_rx: watch::Receiver<std::time::Duration>,
    ) -> Self {
        Self {
            fetcher,
            config,
            download_dir,
            queue_rx,
            ready_tx,
            duration_rx,
            last_good: None,
            silence: None,
        }
    }

    /// Drain the queue until cancelled or the producer side closes.
    ///
    /// Blocks on an empty queue with a timeout of one segment duration, so
    /// the worker naturally paces itself to the live stream's cadence.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        loop {
            let wait = *self.duration_rx.borrow();
            let seg = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                recv = tokio::time::timeout(wait, self.queue_rx.recv()) => match recv {
                    Ok(Some(seg)) => seg,
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        debug!("download queue empty");
                        continue;
                    }
                },
            };
            match self.process(seg, &token).await {
                Ok(()) => {}
                Err(RelayError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn process(&mut self, seg: SegmentRef, token: &CancellationToken) -> Result<()> {
        let fetcher = &self.fetcher;
        let url = seg.url.as_str();
        let fetched =
            retry_with_backoff(&self.config.retry, token, |_| async move {
                fetcher.fetch(url).await
            })
            .await;

        let bytes = match fetched {
            Ok(bytes) if bytes.len() as u64 >= self.config.min_segment_bytes => {
                self.last_good = Some(bytes.clone());
                bytes
            }
            Ok(bytes) => {
                warn!(
                    sequence = seg.sequence,
                    len = bytes.len(),
                    "segment below size threshold, substituting filler"
                );
                match self.filler_bytes().await? {
                    Some(filler) => filler,
                    None => return Ok(()),
                }
            }
            Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
            Err(e) => {
                warn!(sequence = seg.sequence, url = seg.url, error = %e, "segment lost, substituting filler");
                match self.filler_bytes().await? {
                    Some(filler) => filler,
                    None => return Ok(()),
                }
            }
        };

        let path = self.download_dir.join(seg.file_name());
        tokio::fs::write(&path, &bytes).await?;
        debug!(sequence = seg.sequence, len = bytes.len(), path = %path.display(), "segment ready");

        let ready = DownloadedSegment {
            path,
            timestamp: seg.timestamp,
            sequence: seg.sequence,
        };
        tokio::select! {
            _ = token.cancelled() => Err(RelayError::Cancelled),
            sent = self.ready_tx.send(ready) => sent.map_err(|_| RelayError::Cancelled),
        }
    }

    /// Pick filler per the configured policy. `None` means nothing usable is
    /// available yet (no good download has landed) and the segment is
    /// dropped outright.
    async fn filler_bytes(&mut self) -> Result<Option<Bytes>> {
        match &self.config.filler {
            FillerPolicy::RepeatLastGood => {
                if self.last_good.is_none() {
                    warn!("no previous payload to fill with, dropping segment");
                }
                Ok(self.last_good.clone())
            }
            FillerPolicy::Silence { path } => {
                if self.silence.is_none() {
                    let raw = tokio::fs::read(path).await.map_err(|e| {
                        RelayError::Configuration {
                            reason: format!("silence segment {}: {e}", path.display()),
                        }
                    })?;
                    self.silence = Some(Bytes::from(raw));
                }
                Ok(self.silence.clone())
            }
        }
    }
}
