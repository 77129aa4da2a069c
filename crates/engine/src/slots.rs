//! The delay buffer: a two-slot rotating structure feeding an external
//! consumer process through a fixed looping playlist.
//!
//! The consumer is pointed once at a two-line playlist referencing slot A
//! and slot B by fixed path and told to loop it forever; only the *contents*
//! of the two files ever change. That keeps the live output connection up
//! across the whole run instead of restarting it for every incoming
//! segment. The invariant that makes it safe: a slot is only ever
//! overwritten while the consumer is reading the other one.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::observer::SlotPlaybackObserver;
use crate::segment::DownloadedSegment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

#[derive(Debug)]
struct SlotState {
    path: PathBuf,
    sequence: u64,
    timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Still waiting for the two segments needed to initialize.
    AwaitingSegments,
    /// Slots primed and loop playlist written; consumer may start.
    Initialized,
    /// The observer could not tell which slot is playing; sampling is racy,
    /// so this tick does nothing rather than risk a wrong write.
    NoObservation,
    /// Wrote the next queued segment into the idle slot.
    Swapped { slot: Slot, sequence: u64 },
    /// The idle slot already holds the successor; nothing to do.
    CaughtUp,
    /// Playing slot identified but no queued segment to swap in.
    QueueEmpty,
}

pub struct DelayBuffer {
    slot_a: SlotState,
    slot_b: SlotState,
    playlist_path: PathBuf,
    queue: VecDeque<DownloadedSegment>,
    capacity: usize,
    initialized: bool,
    last_advance: Instant,
    current_timestamp: f64,
}

impl DelayBuffer {
    pub fn new(work_dir: &Path, capacity: usize) -> Self {
        Self {
            slot_a: SlotState {
                path: work_dir.join("slot_a.ts"),
                sequence: 0,
                timestamp: 0.0,
            },
            slot_b: SlotState {
                path: work_dir.join("slot_b.ts"),
                sequence: 0,
                timestamp: 0.0,
            },
            playlist_path: work_dir.join("loop.m3u"),
            queue: VecDeque::new(),
            capacity,
            initialized: false,
            last_advance: Instant::now(),
            current_timestamp: 0.0,
        }
    }

    /// Path of the generated two-line loop playlist.
    pub fn playlist_path(&self) -> &Path {
        &self.playlist_path
    }

    pub fn slot_path(&self, slot: Slot) -> &Path {
        match slot {
            Slot::A => &self.slot_a.path,
            Slot::B => &self.slot_b.path,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the ready queue can admit another segment. This bound is the
    /// relay's only explicit backpressure point.
    pub fn has_room(&self) -> bool {
        self.queue.len() < self.capacity
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Source timestamp of what is currently airing (0 until known).
    pub fn current_timestamp(&self) -> f64 {
        self.current_timestamp
    }

    /// Time since the last slot write.
    pub fn neglect(&self) -> Duration {
        self.last_advance.elapsed()
    }

    /// Accept a downloaded segment into the ready queue.
    pub fn offer(&mut self, seg: DownloadedSegment) -> bool {
        if !self.has_room() {
            warn!(sequence = seg.sequence, "delay buffer full, refusing segment");
            return false;
        }
        self.queue.push_back(seg);
        true
    }

    /// Drive the slot state machine one step.
    ///
    /// `playing` is the observer's sample of which slot the consumer has
    /// open right now. `None` always means "do nothing this tick" — never
    /// "skip ahead".
    pub fn advance(&mut self, playing: Option<Slot>) -> Result<AdvanceOutcome> {
        if !self.initialized {
            return self.try_initialize();
        }
        let Some(playing) = playing else {
            return Ok(AdvanceOutcome::NoObservation);
        };

        let (play_state, idle_state) = match playing {
            Slot::A => (&self.slot_a, &self.slot_b),
            Slot::B => (&self.slot_b, &self.slot_a),
        };
        self.current_timestamp = play_state.timestamp;

        // Only refill the idle slot once the consumer has moved past it,
        // i.e. the playing slot is the newer of the two. Writing earlier
        // would clobber audio the consumer still has to read.
        if play_state.sequence <= idle_state.sequence {
            return Ok(AdvanceOutcome::CaughtUp);
        }
        let Some(next) = self.queue.pop_front() else {
            return Ok(AdvanceOutcome::QueueEmpty);
        };
        let idle = playing.other();
        let sequence = next.sequence;
        self.write_slot(idle, next)?;
        self.last_advance = Instant::now();
        debug!(slot = ?idle, sequence, "slot refilled");
        Ok(AdvanceOutcome::Swapped { slot: idle, sequence })
    }

    fn try_initialize(&mut self) -> Result<AdvanceOutcome> {
        if self.queue.len() < 2 {
            return Ok(AdvanceOutcome::AwaitingSegments);
        }
        // Queue order is download order, so A receives the older segment.
        let first = self.queue.pop_front().ok_or_else(|| RelayError::Consumer {
            reason: "queue underflow during initialization".into(),
        })?;
        let second = self.queue.pop_front().ok_or_else(|| RelayError::Consumer {
            reason: "queue underflow during initialization".into(),
        })?;
        self.current_timestamp = first.timestamp;
        self.write_slot(Slot::A, first)?;
        self.write_slot(Slot::B, second)?;
        std::fs::write(
            &self.playlist_path,
            format!("{}\n{}\n", self.slot_a.path.display(), self.slot_b.path.display()),
        )?;
        self.initialized = true;
        self.last_advance = Instant::now();
        info!(playlist = %self.playlist_path.display(), "delay buffer initialized");
        Ok(AdvanceOutcome::Initialized)
    }

    fn write_slot(&mut self, slot: Slot, seg: DownloadedSegment) -> Result<()> {
        let state = match slot {
            Slot::A => &mut self.slot_a,
            Slot::B => &mut self.slot_b,
        };
        let bytes = std::fs::read(&seg.path)?;
        std::fs::write(&state.path, &bytes)?;
        state.sequence = seg.sequence;
        state.timestamp = seg.timestamp;
        // The download file is spent once promoted to a slot.
        if let Err(e) = std::fs::remove_file(&seg.path) {
            debug!(path = %seg.path.display(), error = %e, "could not remove spent download");
        }
        Ok(())
    }

    /// Drop queued segments older than `now - target_delay`, deleting their
    /// backing files. Lossy by design: re-syncing to the target delay after
    /// a stall is worth more than playing every byte.
    pub fn fast_forward(&mut self, now: f64, target_delay: f64) -> usize {
        let mut dropped = 0;
        while let Some(front) = self.queue.front() {
            if front.timestamp <= 0.0 || now - front.timestamp <= target_delay {
                break;
            }
            if let Some(stale) = self.queue.pop_front() {
                if let Err(e) = std::fs::remove_file(&stale.path) {
                    debug!(path = %stale.path.display(), error = %e, "could not remove skipped segment");
                }
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "fast-forwarded through backlog to re-sync delay");
        }
        dropped
    }
}

/// Run the buffer task: admit downloaded segments while there is room, and
/// drive `advance()` both when a segment arrives and on a timer tick.
///
/// Stuck detection engages once playback has been observed at least once:
/// silence longer than one segment duration logs a warning, silence longer
/// than `neglect_ceiling` raises the fatal neglected condition the
/// supervisor answers with a full restart.
pub async fn run_buffer_loop(
    buffer: Arc<Mutex<DelayBuffer>>,
    mut ready_rx: mpsc::Receiver<DownloadedSegment>,
    mut observer: Box<dyn SlotPlaybackObserver>,
    duration_rx: watch::Receiver<Duration>,
    neglect_ceiling: Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut saw_playback = false;
    loop {
        let has_room = buffer.lock().has_room();
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            seg = ready_rx.recv(), if has_room => match seg {
                Some(seg) => {
                    buffer.lock().offer(seg);
                }
                None => return Ok(()),
            },
        }

        let playing = observer.playing_slot();
        if playing.is_some() && !saw_playback {
            saw_playback = true;
            // Neglect accounting starts at first observed playback; before
            // that the consumer may simply not be running yet.
            buffer.lock().last_advance = Instant::now();
        }
        let outcome = buffer.lock().advance(playing)?;
        if let AdvanceOutcome::Initialized = outcome {
            info!("slots primed, ready for consumer attachment");
        }

        if saw_playback {
            let neglect = buffer.lock().neglect();
            let segment_duration = *duration_rx.borrow();
            if neglect > neglect_ceiling {
                warn!(seconds = neglect.as_secs(), "loop playlist neglected");
                return Err(RelayError::Neglected {
                    seconds: neglect.as_secs(),
                });
            }
            if neglect > segment_duration {
                warn!(
                    seconds = neglect.as_secs(),
                    "delay buffer has not advanced within a segment duration"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn stage(dir: &Path, sequence: u64, timestamp: f64) -> DownloadedSegment {
        let path = dir.join(format!("chunk_4_{sequence}.ts"));
        std::fs::write(&path, format!("payload-{sequence}")).expect("write");
        DownloadedSegment {
            path,
            timestamp,
            sequence,
        }
    }

    #[test]
    fn initializes_only_with_two_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = DelayBuffer::new(dir.path(), 8);

        buffer.offer(stage(dir.path(), 100, 4.0));
        assert_eq!(buffer.advance(None).expect("advance"), AdvanceOutcome::AwaitingSegments);

        buffer.offer(stage(dir.path(), 101, 8.0));
        assert_eq!(buffer.advance(None).expect("advance"), AdvanceOutcome::Initialized);
        assert!(buffer.is_initialized());
        assert_eq!(buffer.current_timestamp(), 4.0);

        let playlist = std::fs::read_to_string(buffer.playlist_path()).expect("playlist");
        let lines: Vec<_> = playlist.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("slot_a.ts"));
        assert!(lines[1].ends_with("slot_b.ts"));
        assert_eq!(
            std::fs::read(buffer.slot_path(Slot::A)).expect("slot a"),
            b"payload-100"
        );
    }

    #[test]
    fn refills_only_the_idle_slot_behind_the_playhead() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = DelayBuffer::new(dir.path(), 8);
        buffer.offer(stage(dir.path(), 100, 4.0));
        buffer.offer(stage(dir.path(), 101, 8.0));
        buffer.advance(None).expect("init");
        buffer.offer(stage(dir.path(), 102, 12.0));

        // Consumer still on A (sequence 100): B holds 101, the successor —
        // nothing to do yet.
        assert_eq!(buffer.advance(Some(Slot::A)).expect("advance"), AdvanceOutcome::CaughtUp);

        // Consumer moved to B (sequence 101 > A's 100): A is safe to refill.
        assert_eq!(
            buffer.advance(Some(Slot::B)).expect("advance"),
            AdvanceOutcome::Swapped { slot: Slot::A, sequence: 102 }
        );
        assert_eq!(
            std::fs::read(buffer.slot_path(Slot::A)).expect("slot a"),
            b"payload-102"
        );
        assert_eq!(buffer.current_timestamp(), 8.0);
    }

    #[test]
    fn unknown_playhead_never_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = DelayBuffer::new(dir.path(), 8);
        buffer.offer(stage(dir.path(), 100, 4.0));
        buffer.offer(stage(dir.path(), 101, 8.0));
        buffer.advance(None).expect("init");
        buffer.offer(stage(dir.path(), 102, 12.0));

        assert_eq!(buffer.advance(None).expect("advance"), AdvanceOutcome::NoObservation);
        assert_eq!(buffer.queue_len(), 1);
    }

    /// Property: across random interleavings of arrivals and playback
    /// observations, a write never targets the slot reported as playing.
    #[test]
    fn writes_never_target_the_playing_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = DelayBuffer::new(dir.path(), 64);
        let mut rng = StdRng::seed_from_u64(0x5107);
        let mut sequence = 100u64;

        buffer.offer(stage(dir.path(), sequence, 0.0));
        buffer.offer(stage(dir.path(), sequence + 1, 4.0));
        sequence += 2;
        buffer.advance(None).expect("init");

        for _ in 0..10_000 {
            if rng.random_bool(0.5) && buffer.has_room() {
                buffer.offer(stage(dir.path(), sequence, sequence as f64 * 4.0));
                sequence += 1;
            }
            let playing = match rng.random_range(0..3) {
                0 => Some(Slot::A),
                1 => Some(Slot::B),
                _ => None,
            };
            match buffer.advance(playing).expect("advance") {
                AdvanceOutcome::Swapped { slot, .. } => {
                    assert_ne!(Some(slot), playing, "wrote into the playing slot");
                    assert!(playing.is_some(), "wrote without an observation");
                }
                AdvanceOutcome::NoObservation => assert!(playing.is_none()),
                _ => {}
            }
        }
    }

    #[test]
    fn fast_forward_drops_stale_backlog_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = DelayBuffer::new(dir.path(), 32);
        let t0 = 1_000_000.0;
        let mut paths = Vec::new();
        for n in 0..6u64 {
            let seg = stage(dir.path(), 100 + n, t0 + n as f64 * 4.0);
            paths.push(seg.path.clone());
            buffer.offer(seg);
        }

        // Stalled for 64s beyond the 60s target: everything older than
        // now - 60 goes.
        let now = t0 + 64.0;
        let dropped = buffer.fast_forward(now, 60.0);
        assert_eq!(dropped, 1, "only the first segment is outside the window");
        assert!(!paths[0].exists());
        assert!(paths[1].exists());

        // A much longer stall drains proportionally more.
        let dropped = buffer.fast_forward(t0 + 200.0, 60.0);
        assert_eq!(dropped, 5);
        assert_eq!(buffer.queue_len(), 0);
    }

    #[test]
    fn fast_forward_ignores_unknown_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = DelayBuffer::new(dir.path(), 8);
        let seg = stage(dir.path(), 100, 0.0);
        buffer.offer(seg);
        assert_eq!(buffer.fast_forward(1_000_000.0, 60.0), 0);
        assert_eq!(buffer.queue_len(), 1);
    }

    /// End-to-end pacing: with 4s segments and a 60s target delay, after
    /// drift correction and a few consumer flips the airing timestamp sits
    /// within one segment duration of `now - target_delay`.
    #[test]
    fn relay_converges_to_target_delay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = DelayBuffer::new(dir.path(), 32);
        let t0 = 1_700_000_000.0;
        for n in 0..6u64 {
            buffer.offer(stage(dir.path(), 100 + n, t0 + n as f64 * 4.0));
        }
        buffer.advance(None).expect("init");

        let mut now = t0 + 64.0;
        buffer.fast_forward(now, 60.0);

        // Consumer flips slots at segment cadence, pulling the queue
        // through; the wall clock moves one segment per flip.
        for playing in [Slot::B, Slot::A, Slot::B] {
            buffer.advance(Some(playing)).expect("advance");
            let airing = buffer.current_timestamp();
            let delta = (now - airing) - 60.0;
            assert!(
                delta.abs() <= 4.0 + f64::EPSILON,
                "airing {airing} should be within one segment of target delay (delta {delta})"
            );
            now += 4.0;
        }
    }
}
