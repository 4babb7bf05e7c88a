//! Error taxonomy of the orchestrator.
//!
//! Each component owns a `thiserror` enum; [`AppError`] aggregates them for
//! the orchestrator. The CLI wraps everything in `anyhow` at the edge.

use std::path::PathBuf;

use ednovas_controller::ControlError;

/// The proxy-core executable was not found in any candidate layout.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("proxy core binary '{name}' not found; searched: {}", format_paths(.searched))]
    NotFound { name: String, searched: Vec<PathBuf> },
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("failed to spawn proxy core {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy core exited during startup ({0})")]
    ExitedEarly(String),

    #[error("failed to prepare proxy core: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    /// The backend answered and refused (bad credentials, expired token).
    #[error("{message}")]
    Rejected { url: String, message: String },

    #[error("malformed response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("failed to download proxy configuration: {0}")]
    ConfigFetch(String),

    #[error("no reachable API endpoint left after {attempts} attempts; check the network and retry")]
    EndpointExhausted { attempts: usize },

    #[error("not logged in")]
    NotLoggedIn,

    #[error("account has no active subscription plan")]
    NoPlan,
}

impl UpstreamError {
    /// Whether another mirror might succeed where this one failed.
    ///
    /// Connection problems, gateway errors and config download failures are
    /// retryable; rejected credentials are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } | Self::ConfigFetch(_) | Self::Decode { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 404,
            _ => false,
        }
    }
}

/// A system network command failed. Logged, never propagated to callers.
#[derive(Debug, thiserror::Error)]
pub enum EffectorError {
    #[error("'{command}' could not be started: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("autostart descriptor {}: {source}", .path.display())]
    Descriptor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything an orchestrator operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("proxy core is not running (nothing on 127.0.0.1:{port}); start it with `ednovas run`")]
    CoreNotRunning { port: u16 },

    #[error("TUN mode needs administrator rights; rerun `ednovas run --tun` elevated")]
    NotElevated,

    #[error("{0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<LocateError> for AppError {
    fn from(e: LocateError) -> Self {
        Self::Supervisor(SupervisorError::Locate(e))
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;
