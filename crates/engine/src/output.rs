//! Output driver: owns the persistent consumer process that produces the
//! live broadcast, restarts it when it dies, and corrects drift between the
//! wall clock and what is actually airing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OutputConfig;
use crate::error::{RelayError, Result};
use crate::observer::PidCell;
use crate::slots::DelayBuffer;

/// What a drift measurement calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriftAction {
    /// Within tolerance; leave the pipeline alone.
    Hold,
    /// Behind target beyond tolerance: skip backlog to catch up.
    FastForward,
    /// Delta too large to be a real stall; a timestamp bug is more likely
    /// than an hours-long freeze, so never skip on it.
    Suspect,
}

pub(crate) fn classify_drift(delta: f64, tolerance: f64, sanity_ceiling: f64) -> DriftAction {
    if delta <= tolerance {
        DriftAction::Hold
    } else if delta < sanity_ceiling {
        DriftAction::FastForward
    } else {
        DriftAction::Suspect
    }
}

pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One drift-check step: measure, classify, and fast-forward if called for.
/// Returns how many segments were skipped.
pub(crate) fn correct_drift(buffer: &Mutex<DelayBuffer>, now: f64, config: &OutputConfig) -> usize {
    let airing = buffer.lock().current_timestamp();
    if airing <= 0.0 {
        return 0;
    }
    let target = config.target_delay.as_secs_f64();
    let delta = (now - airing) - target;
    match classify_drift(
        delta,
        config.drift_tolerance.as_secs_f64(),
        config.drift_sanity_ceiling.as_secs_f64(),
    ) {
        DriftAction::Hold => 0,
        DriftAction::FastForward => {
            warn!(delta_secs = delta as i64, "behind target delay, fast-forwarding");
            buffer.lock().fast_forward(now, target)
        }
        DriftAction::Suspect => {
            error!(
                delta_secs = delta as i64,
                "drift exceeds sanity ceiling, suspecting timestamp bug; not skipping"
            );
            0
        }
    }
}

pub struct OutputDriver {
    config: OutputConfig,
    /// `icecast://...` argument appended to the consumer command line.
    sink_url: String,
    playlist_path: PathBuf,
    buffer: Arc<Mutex<DelayBuffer>>,
    pid: PidCell,
    line_tx: mpsc::UnboundedSender<String>,
    restarts: u32,
    last_restart: Instant,
}

impl OutputDriver {
    pub fn new(
        config: OutputConfig,
        sink_url: String,
        playlist_path: PathBuf,
        buffer: Arc<Mutex<DelayBuffer>>,
        pid: PidCell,
        line_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            config,
            sink_url,
            playlist_path,
            buffer,
            pid,
            line_tx,
            restarts: 0,
            last_restart: Instant::now(),
        }
    }

    /// Supervise the consumer until cancelled. Fatal only when restarts
    /// churn faster than the neglect ceiling allows.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        // The loop playlist only exists once the buffer has primed both
        // slots; starting the consumer earlier would race file creation.
        while !self.buffer.lock().is_initialized() {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }

        let mut child = self.spawn_consumer()?;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.pid.set(None);
                    if let Err(e) = child.kill().await {
                        debug!(error = %e, "consumer already gone at shutdown");
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }

            if let Some(status) = child.try_wait().map_err(|e| RelayError::Consumer {
                reason: format!("poll consumer: {e}"),
            })? {
                warn!(%status, restarts = self.restarts, "consumer exited, restarting");
                self.pid.set(None);
                if self.last_restart.elapsed() < self.config.tick_interval * 2 {
                    // Dying faster than we tick means something structural
                    // (bad args, sink refusing the source); give the sink a
                    // moment before the next attempt.
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                child = self.spawn_consumer()?;
            }

            correct_drift(&self.buffer, epoch_now(), &self.config);
        }
    }

    fn spawn_consumer(&mut self) -> Result<Child> {
        let program = &self.config.consumer.program;
        let mut cmd = procwatch::tokio_command(program);
        cmd.args(&self.config.consumer.extra_args)
            .arg(&self.playlist_path)
            .arg(&self.sink_url);
        let mut child = cmd.spawn().map_err(|e| RelayError::Consumer {
            reason: format!("spawn {}: {e}", program.display()),
        })?;
        self.pid.set(child.id());
        self.restarts += 1;
        self.last_restart = Instant::now();
        info!(pid = child.id(), program = %program.display(), "consumer started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, self.line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, self.line_tx.clone()));
        }
        Ok(child)
    }
}

/// Pump a consumer output stream into the observer channel, echoing at
/// debug level for diagnosis.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "shiftcast_engine::consumer", "{line}");
        // The observer side may not exist (proc-fd strategy); keep echoing.
        let _ = tx.send(line);
    }
}
