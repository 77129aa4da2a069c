//! Determining which slot the external consumer is reading.
//!
//! The consumer is a black box, so this is a sampling problem with two
//! strategies: inspect the process's open file descriptors (Linux), or tail
//! the "currently playing" lines most playout tools write to their output.
//! Both are approximations; an ambiguous sample yields `None` and the buffer
//! skips that tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

use crate::slots::Slot;

pub trait SlotPlaybackObserver: Send {
    /// Best-effort sample of the slot currently being consumed.
    fn playing_slot(&mut self) -> Option<Slot>;
}

/// Shared cell carrying the consumer's pid from the output driver (which
/// spawns and restarts the process) to the fd-inspecting observer.
#[derive(Debug, Clone, Default)]
pub struct PidCell(Arc<AtomicU32>);

impl PidCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: Option<u32>) {
        self.0.store(pid.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<u32> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Observer that samples `/proc/<pid>/fd` for the slot paths.
pub struct ProcFdObserver {
    pid: PidCell,
    slot_a: PathBuf,
    slot_b: PathBuf,
}

impl ProcFdObserver {
    pub fn new(pid: PidCell, slot_a: PathBuf, slot_b: PathBuf) -> Self {
        Self { pid, slot_a, slot_b }
    }
}

fn holds(open: &[PathBuf], slot: &Path) -> bool {
    // /proc fd targets are fully resolved; the configured slot path may not
    // be, so compare against its canonical form when obtainable.
    let canonical = slot.canonicalize().ok();
    open.iter()
        .any(|p| p == slot || canonical.as_deref() == Some(p.as_path()))
}

impl SlotPlaybackObserver for ProcFdObserver {
    fn playing_slot(&mut self) -> Option<Slot> {
        let pid = self.pid.get()?;
        let open = procwatch::open_paths(pid).ok()?;
        let a = holds(&open, &self.slot_a);
        let b = holds(&open, &self.slot_b);
        trace!(pid, a, b, "fd sample");
        match (a, b) {
            (true, false) => Some(Slot::A),
            (false, true) => Some(Slot::B),
            // Neither, or both mid-switch: unknowable this tick.
            _ => None,
        }
    }
}

/// Observer fed by the consumer's own output, the IPC-shaped contract:
/// playout tools announce `Currently playing "<path>"` (ices) or
/// `Playing <path>` (liquidsoap) as they open each playlist entry.
pub struct LogTailObserver {
    lines: mpsc::UnboundedReceiver<String>,
    slot_a: PathBuf,
    slot_b: PathBuf,
    last: Option<Slot>,
}

impl LogTailObserver {
    pub fn new(lines: mpsc::UnboundedReceiver<String>, slot_a: PathBuf, slot_b: PathBuf) -> Self {
        Self {
            lines,
            slot_a,
            slot_b,
            last: None,
        }
    }

    fn classify(&self, line: &str) -> Option<Slot> {
        if !line.to_ascii_lowercase().contains("playing") {
            return None;
        }
        let a = self.slot_a.to_string_lossy();
        let b = self.slot_b.to_string_lossy();
        if line.contains(a.as_ref()) {
            Some(Slot::A)
        } else if line.contains(b.as_ref()) {
            Some(Slot::B)
        } else {
            None
        }
    }
}

impl SlotPlaybackObserver for LogTailObserver {
    fn playing_slot(&mut self) -> Option<Slot> {
        while let Ok(line) = self.lines.try_recv() {
            if let Some(slot) = self.classify(&line) {
                trace!(?slot, "playback line");
                self.last = Some(slot);
            }
        }
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tail_tracks_latest_playing_line() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observer = LogTailObserver::new(
            rx,
            PathBuf::from("/tmp/relay/slot_a.ts"),
            PathBuf::from("/tmp/relay/slot_b.ts"),
        );
        assert_eq!(observer.playing_slot(), None);

        tx.send(r#"INFO playlist-builtin Currently playing "/tmp/relay/slot_a.ts""#.into())
            .expect("send");
        tx.send("noise line".into()).expect("send");
        assert_eq!(observer.playing_slot(), Some(Slot::A));

        tx.send("2024/01/01 Playing /tmp/relay/slot_b.ts".into()).expect("send");
        assert_eq!(observer.playing_slot(), Some(Slot::B));

        // No new lines: last observation sticks.
        assert_eq!(observer.playing_slot(), Some(Slot::B));
    }

    #[test]
    fn log_tail_ignores_foreign_paths() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observer = LogTailObserver::new(
            rx,
            PathBuf::from("/tmp/relay/slot_a.ts"),
            PathBuf::from("/tmp/relay/slot_b.ts"),
        );
        tx.send("Currently playing \"/tmp/other/file.ts\"".into()).expect("send");
        assert_eq!(observer.playing_slot(), None);
    }

    #[test]
    fn pid_cell_round_trips() {
        let cell = PidCell::new();
        assert_eq!(cell.get(), None);
        cell.set(Some(1234));
        assert_eq!(cell.get(), Some(1234));
        cell.set(None);
        assert_eq!(cell.get(), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn proc_fd_observer_identifies_held_slot() {
        use std::fs::File;

        let dir = tempfile::tempdir().expect("tempdir");
        let slot_a = dir.path().join("slot_a.ts");
        let slot_b = dir.path().join("slot_b.ts");
        std::fs::write(&slot_a, b"x").expect("write");
        // Keep slot_a open in this process and point the observer at
        // ourselves.
        let held = File::open(&slot_a).expect("open");

        let pid = PidCell::new();
        pid.set(Some(std::process::id()));
        let mut observer = ProcFdObserver::new(pid.clone(), slot_a.clone(), slot_b.clone());
        assert_eq!(observer.playing_slot(), Some(Slot::A));

        drop(held);
        assert_eq!(observer.playing_slot(), None);

        pid.set(None);
        assert_eq!(observer.playing_slot(), None);
    }
}
