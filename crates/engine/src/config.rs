//! Relay configuration, one section per pipeline stage.
//!
//! Defaults reflect the upstream cadence this relay was built against:
//! 4-second segments, a playlist refresh every 10 seconds, and an hour of
//! target delay. The CLI deserializes its TOML file into these sections.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Top-level configuration for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Working directory for slot files, the loop playlist, downloads and
    /// persisted state.
    pub work_dir: PathBuf,
    pub upstream: UpstreamConfig,
    pub poller: PollerConfig,
    pub downloader: DownloaderConfig,
    pub buffer: BufferConfig,
    pub output: OutputConfig,
    pub sink: SinkConfig,
}

impl RelayConfig {
    pub fn new(playlist_url: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            upstream: UpstreamConfig {
                playlist_url: playlist_url.into(),
            },
            poller: PollerConfig::default(),
            downloader: DownloaderConfig::default(),
            buffer: BufferConfig::default(),
            output: OutputConfig::default(),
            sink: SinkConfig::default(),
        }
    }

    /// Directory segment downloads land in before promotion to a slot.
    pub fn download_dir(&self) -> PathBuf {
        self.work_dir.join("ts")
    }

    /// Path of the persisted segment history.
    pub fn history_path(&self) -> PathBuf {
        self.work_dir.join("history.json")
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// URL of the live media playlist to poll.
    pub playlist_url: String,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval between playlist fetches in steady state.
    pub poll_interval: Duration,
    /// Shortened interval used after an empty playlist, to recover quickly.
    pub empty_poll_interval: Duration,
    /// Timeout for a single playlist fetch.
    pub fetch_timeout: Duration,
    /// Consecutive fetch failures tolerated before the poller gives up and
    /// asks the supervisor for a full restart.
    pub max_consecutive_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            empty_poll_interval: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(10),
            max_consecutive_failures: 9,
        }
    }
}

/// What to substitute when a segment cannot be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillerPolicy {
    /// Re-emit the most recent good payload. Repeats ~one segment of audio
    /// but keeps the timeline hole-free.
    RepeatLastGood,
    /// Emit a pre-encoded silent segment from the given path.
    Silence { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Timeout for a single segment fetch.
    pub fetch_timeout: Duration,
    /// Retry schedule for transient fetch failures.
    pub retry: RetryPolicy,
    /// Bodies smaller than this are treated as garbage and replaced by
    /// filler.
    pub min_segment_bytes: u64,
    pub filler: FillerPolicy,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(3),
                max_delay: Duration::from_secs(30),
                jitter: true,
            },
            min_segment_bytes: 4096,
            filler: FillerPolicy::RepeatLastGood,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum segments held ready behind the slot pair. This is the relay's
    /// only explicit admission-control point: once full, ingestion pauses.
    /// Size this to cover the target delay: `target_delay / segment_duration`
    /// (the default pairs 900 four-second segments with an hour of delay).
    pub size: usize,
    /// Nominal segment duration, used for pacing until the playlist's
    /// `#EXT-X-TARGETDURATION` is learned.
    pub segment_duration: Duration,
    /// How long the buffer may go without an advance before the condition
    /// escalates from a warning to a fatal "neglected" restart.
    pub neglect_ceiling: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 900,
            segment_duration: Duration::from_secs(4),
            neglect_ceiling: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// The external broadcast-producing executable (ffmpeg, ices, ...).
    pub program: PathBuf,
    /// Arguments inserted before the loop-playlist path and sink URL.
    pub extra_args: Vec<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            extra_args: vec![
                "-loglevel".into(),
                "info".into(),
                "-re".into(),
                "-stream_loop".into(),
                "-1".into(),
                "-i".into(),
            ],
        }
    }
}

/// How the relay determines which slot the consumer is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObserverStrategy {
    /// Sample `/proc/<pid>/fd` (Linux only).
    #[default]
    ProcFd,
    /// Parse "currently playing" lines from the consumer's own output.
    LogTail,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// How far behind real time the relayed stream should run.
    pub target_delay: Duration,
    /// Drift beyond the target delay tolerated before fast-forwarding.
    pub drift_tolerance: Duration,
    /// Drift so large it indicates a timestamp bug rather than a stall;
    /// never corrected by skipping.
    pub drift_sanity_ceiling: Duration,
    /// Interval between driver health/drift ticks.
    pub tick_interval: Duration,
    /// Optional wall-clock runtime after which the relay asks to be
    /// restarted wholesale, resetting all in-memory state.
    pub restart_interval: Option<Duration>,
    pub observer: ObserverStrategy,
    pub consumer: ConsumerConfig,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            target_delay: Duration::from_secs(3600),
            drift_tolerance: Duration::from_secs(10),
            drift_sanity_ceiling: Duration::from_secs(6 * 3600),
            tick_interval: Duration::from_secs(1),
            restart_interval: None,
            observer: ObserverStrategy::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    /// Mount name without the leading slash.
    pub mount: String,
    pub user: String,
    pub password: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            mount: "shiftcast".into(),
            user: "source".into(),
            password: String::new(),
        }
    }
}
