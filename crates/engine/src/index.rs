//! Per-prefix sequence tracking: the ordering, dedup and gap policy for the
//! boundless incoming segment stream.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::segment::SegmentRef;

/// What happened to an ingested segment reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Next in sequence for its prefix (`skipped == 0`), or ahead with a
    /// gap (`skipped > 0`, accepted with a warning).
    Accepted { skipped: u64 },
    /// First segment of a previously unseen prefix.
    NewPrefix,
    /// Exact `(prefix, sequence)` already ingested this run.
    AlreadySeen,
    /// Equal to the last accepted sequence for its prefix.
    Duplicate,
    /// Behind the last accepted sequence for its prefix.
    Stale,
}

impl IngestOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            IngestOutcome::Accepted { .. } | IngestOutcome::NewPrefix
        )
    }
}

/// Tracks which `(prefix, sequence)` pairs have been seen and enforces
/// monotonic-per-prefix acceptance.
///
/// The index never reorders: gaps are flagged and accepted, anything at or
/// behind the high-water mark is rejected. Its lifetime matches the poller;
/// on restart it is rebuilt from the persisted history log.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    last_seen: HashMap<u64, u64>,
    seen: HashSet<(u64, u64)>,
}

impl SegmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the acceptance policy to one segment reference.
    pub fn ingest(&mut self, seg: &SegmentRef) -> IngestOutcome {
        let key = seg.key();
        if self.seen.contains(&key) {
            debug!(prefix = seg.prefix, sequence = seg.sequence, "playlist overlap");
            return IngestOutcome::AlreadySeen;
        }

        let outcome = match self.last_seen.get(&seg.prefix).copied() {
            None => {
                info!(prefix = seg.prefix, sequence = seg.sequence, "rotating to new prefix");
                IngestOutcome::NewPrefix
            }
            Some(last) if seg.sequence > last => {
                let skipped = seg.sequence - last - 1;
                if skipped > 0 {
                    warn!(
                        prefix = seg.prefix,
                        from = last,
                        to = seg.sequence,
                        skipped,
                        "gap in segment sequence"
                    );
                }
                IngestOutcome::Accepted { skipped }
            }
            Some(last) if seg.sequence == last => {
                debug!(prefix = seg.prefix, sequence = seg.sequence, "duplicate segment");
                IngestOutcome::Duplicate
            }
            Some(last) => {
                debug!(
                    prefix = seg.prefix,
                    sequence = seg.sequence,
                    last,
                    "stale out-of-order segment"
                );
                IngestOutcome::Stale
            }
        };

        if outcome.is_accepted() {
            self.last_seen.insert(seg.prefix, seg.sequence);
            self.seen.insert(key);
        }
        outcome
    }

    /// Drop a key from the dedup set once its history entry is pruned. The
    /// per-prefix high-water mark is kept, so pruning never reopens the door
    /// to stale re-ingestion.
    pub fn forget(&mut self, key: (u64, u64)) {
        self.seen.remove(&key);
    }

    pub fn tracked_prefixes(&self) -> usize {
        self.last_seen.len()
    }
}
