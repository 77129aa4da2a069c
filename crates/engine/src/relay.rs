//! Wiring and lifecycle: builds the pipeline, runs the buffering phase,
//! supervises the worker tasks and performs best-effort shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::{ObserverStrategy, RelayConfig};
use crate::downloader::{HttpSegmentFetcher, SegmentDownloader};
use crate::error::{RelayError, Result};
use crate::history::HistoryLog;
use crate::metadata::{MetadataProvider, MetadataSynchronizer};
use crate::observer::{LogTailObserver, PidCell, ProcFdObserver, SlotPlaybackObserver};
use crate::output::OutputDriver;
use crate::playlist::PlaylistPoller;
use crate::segment::SegmentRef;
use crate::sink::SinkClient;
use crate::slots::{DelayBuffer, Slot, run_buffer_loop};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Cancelled from outside (signal); done.
    Completed,
    /// A worker died or the restart interval elapsed; the outer supervisor
    /// should start a fresh process.
    RestartRequested,
}

pub struct Relay {
    config: RelayConfig,
    metadata_provider: Option<Arc<dyn MetadataProvider>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            metadata_provider: None,
        }
    }

    pub fn with_metadata_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.metadata_provider = Some(provider);
        self
    }

    /// Run the relay until the token is cancelled or a fatal condition asks
    /// for a restart.
    pub async fn run(self, token: CancellationToken) -> Result<RunOutcome> {
        let config = self.config;
        tokio::fs::create_dir_all(&config.work_dir).await?;
        let download_dir = config.download_dir();
        tokio::fs::create_dir_all(&download_dir).await?;

        let buffer = Arc::new(Mutex::new(DelayBuffer::new(&config.work_dir, config.buffer.size)));
        let (playlist_path, slot_a, slot_b) = {
            let b = buffer.lock();
            (
                b.playlist_path().to_path_buf(),
                b.slot_path(Slot::A).to_path_buf(),
                b.slot_path(Slot::B).to_path_buf(),
            )
        };
        // Slot files from a previous incarnation would let an observer
        // "see" playback before this run primed anything.
        for stale in [&playlist_path, &slot_a, &slot_b] {
            let _ = tokio::fs::remove_file(stale).await;
        }

        let playlist_url =
            Url::parse(&config.upstream.playlist_url).map_err(|e| RelayError::Configuration {
                reason: format!("playlist url `{}`: {e}", config.upstream.playlist_url),
            })?;

        let (queue_tx, queue_rx) = mpsc::channel(256);
        // Small hand-off; real admission control is the buffer's own bound.
        let (ready_tx, ready_rx) = mpsc::channel(4);
        let (duration_tx, duration_rx) = watch::channel(config.buffer.segment_duration);

        let persisted = HistoryLog::load(config.history_path()).await?;
        let entries: Vec<SegmentRef> = persisted.entries().cloned().collect();
        let mut poller = PlaylistPoller::new(
            config.poller.clone(),
            playlist_url,
            HistoryLog::new(config.history_path()),
            queue_tx,
            duration_tx,
            config.buffer.size,
        );
        poller.seed(entries, &download_dir).await?;

        let downloader = SegmentDownloader::new(
            HttpSegmentFetcher::new(config.downloader.fetch_timeout),
            config.downloader.clone(),
            download_dir,
            queue_rx,
            ready_tx,
            duration_rx.clone(),
        );

        let pid = PidCell::new();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let observer: Box<dyn SlotPlaybackObserver> = match config.output.observer {
            ObserverStrategy::ProcFd => {
                Box::new(ProcFdObserver::new(pid.clone(), slot_a, slot_b))
            }
            ObserverStrategy::LogTail => Box::new(LogTailObserver::new(line_rx, slot_a, slot_b)),
        };

        let sink = SinkClient::new(config.sink.clone());
        let driver = OutputDriver::new(
            config.output.clone(),
            sink.consumer_url(),
            playlist_path,
            buffer.clone(),
            pid,
            line_tx,
        );
        let synchronizer = MetadataSynchronizer::new(
            self.metadata_provider,
            SinkClient::new(config.sink.clone()),
            buffer.clone(),
            config.output.tick_interval,
        );

        let workers = token.child_token();
        let mut tasks: Vec<(&'static str, Option<JoinHandle<Result<()>>>)> = vec![
            ("playlist-poller", Some(tokio::spawn(poller.run(workers.clone())))),
            ("segment-downloader", Some(tokio::spawn(downloader.run(workers.clone())))),
            (
                "delay-buffer",
                Some(tokio::spawn(run_buffer_loop(
                    buffer.clone(),
                    ready_rx,
                    observer,
                    duration_rx,
                    config.buffer.neglect_ceiling,
                    workers.clone(),
                ))),
            ),
        ];

        let started = Instant::now();
        let mut pending_output = Some((driver, synchronizer));
        let mut last_progress = Instant::now();
        let mut outcome = RunOutcome::Completed;

        'supervise: loop {
            tokio::select! {
                _ = token.cancelled() => break 'supervise,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            // Buffering phase: hold the output back until a full target
            // delay of audio has accumulated behind the slots.
            if let Some((driver, synchronizer)) =
                pending_output.take_if(|_| started.elapsed() >= config.output.target_delay)
            {
                info!("buffer reached target delay, starting output");
                tasks.push(("output-driver", Some(tokio::spawn(driver.run(workers.clone())))));
                tasks.push(("metadata-sync", Some(tokio::spawn(synchronizer.run(workers.clone())))));
            } else if pending_output.is_some() && last_progress.elapsed() >= Duration::from_secs(60)
            {
                let remaining = config.output.target_delay.saturating_sub(started.elapsed());
                info!(minutes = remaining.as_secs().div_ceil(60), "buffering toward target delay");
                last_progress = Instant::now();
            }

            if let Some(limit) = config.output.restart_interval
                && started.elapsed() >= limit
            {
                info!("restart interval reached, recycling the relay process");
                outcome = RunOutcome::RestartRequested;
                break 'supervise;
            }

            for (name, slot) in tasks.iter_mut() {
                let Some(handle) = slot.take_if(|h| h.is_finished()) else {
                    continue;
                };
                match handle.await {
                    Ok(Ok(())) => warn!(task = *name, "worker stopped unexpectedly"),
                    Ok(Err(e)) => warn!(task = *name, error = %e, "worker failed"),
                    Err(e) => warn!(task = *name, "worker panicked: {e}"),
                }
                // Any dead worker leaves the pipeline unsound; a process
                // restart resets all state cleanly.
                outcome = RunOutcome::RestartRequested;
                break 'supervise;
            }
        }

        // Best-effort shutdown: workers observe cancellation at their next
        // suspension point; stragglers are abandoned after a bounded wait
        // since the external player may itself be hung.
        workers.cancel();
        for (name, slot) in tasks {
            let Some(handle) = slot else { continue };
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(task = name, error = %e, "worker exited with error"),
                Err(_) => warn!(task = name, "worker refused to stop, abandoning"),
                Ok(Err(e)) => warn!(task = name, "worker panicked during shutdown: {e}"),
            }
        }
        Ok(outcome)
    }
}
