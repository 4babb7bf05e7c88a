//! Error type for control API calls.

/// Failures talking to the proxy core's control API.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control API request {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("control API {path} returned HTTP {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("proxy core did not answer on {endpoint} after {attempts} attempts")]
    ReadinessTimeout { endpoint: String, attempts: u32 },

    #[error("a latency test for group '{0}' is already running")]
    LatencyTestInFlight(String),

    #[error("unknown proxy group '{0}'")]
    GroupNotFound(String),

    #[error("malformed control API payload from {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("traffic stream failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ControlError {
    /// True when the core could not be reached at all (as opposed to
    /// answering with an error).
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Request { source, .. } => source.is_connect() || source.is_timeout(),
            Self::ReadinessTimeout { .. } | Self::WebSocket(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
