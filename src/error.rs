//! Error types for the image edge cache

use thiserror::Error;

/// Result type alias for edge cache operations
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Body sent when the origin cannot provide the requested image
pub const REMOTE_MISSING_PAYLOAD: &str = "Remote file missing.";

/// Body sent when a local target has no cache file
pub const LOCAL_MISSING_PAYLOAD: &str = "Local file missing.";

/// Error types that can occur while serving a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EdgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Origin server returned status {status}")]
    RemoteStatus { status: u16 },

    #[error("Local file missing: {0}")]
    LocalMissing(String),

    #[error("IO error: {0}")]
    LocalIo(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Access log sink error: {0}")]
    LogSink(String),
}

impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        EdgeError::LocalIo(err.to_string())
    }
}

impl From<reqwest::Error> for EdgeError {
    fn from(err: reqwest::Error) -> Self {
        EdgeError::RemoteUnavailable(err.to_string())
    }
}

impl EdgeError {
    /// Whether the origin could not provide the resource
    pub fn is_remote_missing(&self) -> bool {
        matches!(
            self,
            EdgeError::RemoteUnavailable(_) | EdgeError::RemoteStatus { .. }
        )
    }

    /// Plaintext body delivered to the client in place of image bytes
    ///
    /// Remote and local misses use fixed messages so clients can match on
    /// them; everything else is reported as `Got error: <message>`.
    pub fn payload(&self) -> String {
        match self {
            EdgeError::RemoteUnavailable(_) | EdgeError::RemoteStatus { .. } => {
                REMOTE_MISSING_PAYLOAD.to_string()
            }
            EdgeError::LocalMissing(_) => LOCAL_MISSING_PAYLOAD.to_string(),
            EdgeError::LocalIo(msg)
            | EdgeError::Transform(msg)
            | EdgeError::Http(msg)
            | EdgeError::Config(msg)
            | EdgeError::LogSink(msg) => format!("Got error: {}", msg),
        }
    }

    /// HTTP status used when strict status codes are enabled
    ///
    /// The default response path always answers 200 with [`payload`]; this
    /// mapping is only consulted when `server.strict_status_codes` is set.
    ///
    /// [`payload`]: EdgeError::payload
    pub fn to_http_status(&self) -> u16 {
        match self {
            EdgeError::LocalMissing(_) => 404,
            EdgeError::RemoteStatus { status } if (400..500).contains(status) => 404,
            EdgeError::RemoteStatus { .. } => 502,
            EdgeError::RemoteUnavailable(_) => 502,
            EdgeError::Http(_) => 502,
            EdgeError::LocalIo(_) => 500,
            EdgeError::Transform(_) => 500,
            EdgeError::Config(_) => 500,
            EdgeError::LogSink(_) => 500,
        }
    }
}
