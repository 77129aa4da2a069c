use reqwest::StatusCode;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("malformed segment URL `{url}`")]
    MalformedUrl { url: String },

    #[error("segment fetch failed with HTTP {status} for {url}")]
    SegmentStatus { status: StatusCode, url: String },

    #[error("segment fetch failed: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("history persistence error: {reason}")]
    History { reason: String },

    #[error("delay buffer neglected for {seconds}s")]
    Neglected { seconds: u64 },

    #[error("consumer process error: {reason}")]
    Consumer { reason: String },

    #[error("sink error: {reason}")]
    Sink { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl RelayError {
    /// Whether a retry could plausibly succeed.
    ///
    /// 4xx responses are permanent (the segment has rotated out upstream and
    /// will never come back); network-level failures and 5xx are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Network { source } => {
                source.is_connect() || source.is_timeout() || source.is_request() || source.is_body()
            }
            RelayError::SegmentStatus { status, .. } => {
                !status.is_client_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            RelayError::SegmentFetch { retryable, .. } => *retryable,
            RelayError::Io { .. } => true,
            _ => false,
        }
    }
}
