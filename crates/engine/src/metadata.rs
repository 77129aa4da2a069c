//! Mapping the airing timestamp back to track metadata and keeping the
//! sink's "now playing" display in sync with what listeners actually hear.
//!
//! The relay plays an hour (or more) behind real time, so metadata gathered
//! live has to be held until the matching audio airs. Entries are keyed by
//! their start time; the synchronizer looks up the output driver's current
//! timestamp and pushes an update whenever the covering track changes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sink::SinkClient;
use crate::slots::DelayBuffer;

/// Typed track metadata with explicit absence. "Parsing failed" upstream
/// becomes `None` here; placeholder text exists only at the sink boundary
/// (see [`TrackMetadata::slug`]), never in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Track window in source-clock epoch seconds.
    pub start: f64,
    pub end: f64,
}

impl TrackMetadata {
    /// The "now playing" string: present fields joined with " - ", or a
    /// fixed placeholder when nothing is known.
    pub fn slug(&self) -> String {
        let parts: Vec<&str> = [&self.title, &self.artist, &self.album]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        if parts.is_empty() {
            "Unknown".to_string()
        } else {
            parts.join(" - ")
        }
    }
}

/// Source of upcoming metadata entries. Enrichment itself (API lookups,
/// cover art) lives outside the relay; this is only the feed interface.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn poll(&self) -> Result<Vec<TrackMetadata>>;
}

/// Track windows keyed by start time (milliseconds, so the key orders and
/// hashes cleanly).
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: BTreeMap<i64, TrackMetadata>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meta: TrackMetadata) {
        self.entries.insert((meta.start * 1000.0) as i64, meta);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry whose `[start, end)` window covers `timestamp`,
    /// evicting windows that have already fully passed.
    pub fn lookup(&mut self, timestamp: f64) -> Option<TrackMetadata> {
        self.entries.retain(|_, meta| meta.end > timestamp);
        let key_ms = (timestamp * 1000.0) as i64;
        self.entries
            .range(..=key_ms)
            .next_back()
            .map(|(_, meta)| meta)
            .filter(|meta| meta.start <= timestamp && timestamp < meta.end)
            .cloned()
    }
}

pub struct MetadataSynchronizer {
    provider: Option<Arc<dyn MetadataProvider>>,
    cache: MetadataCache,
    sink: SinkClient,
    buffer: Arc<Mutex<DelayBuffer>>,
    interval: Duration,
    last_pushed: Option<String>,
}

impl MetadataSynchronizer {
    pub fn new(
        provider: Option<Arc<dyn MetadataProvider>>,
        sink: SinkClient,
        buffer: Arc<Mutex<DelayBuffer>>,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            cache: MetadataCache::new(),
            sink,
            buffer,
            interval,
            last_pushed: None,
        }
    }

    /// Poll the provider and push updates until cancelled. Every failure
    /// here is logged and skipped; metadata must never take the stream down.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Some(provider) = &self.provider {
                match provider.poll().await {
                    Ok(entries) => {
                        for meta in entries {
                            self.cache.insert(meta);
                        }
                    }
                    Err(e) => warn!(error = %e, "metadata provider poll failed"),
                }
            }
            self.push_current().await;
        }
    }

    async fn push_current(&mut self) {
        let timestamp = self.buffer.lock().current_timestamp();
        if timestamp <= 0.0 {
            return;
        }
        let Some(meta) = self.cache.lookup(timestamp) else {
            return;
        };
        let slug = meta.slug();
        if self.last_pushed.as_deref() == Some(slug.as_str()) {
            return;
        }
        match self.sink.update_now_playing(&slug).await {
            Ok(true) => {
                debug!(slug, "now playing updated");
                self.last_pushed = Some(slug);
            }
            Ok(false) => warn!(slug, "sink did not acknowledge metadata update"),
            Err(e) => warn!(error = %e, "metadata update failed"),
        }
    }
}
