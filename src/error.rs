/// Error types for the credential lifecycle and the ingestion pipeline
use thiserror::Error;

/// Failures while obtaining or renewing the OAuth credential.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Token endpoint rejected the grant ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Token endpoint failed ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("Invalid token response: {error}, body: {body}")]
    InvalidResponse {
        error: serde_json::Error,
        body: String,
    },

    #[error("No authorization code available")]
    NoCode,

    #[error("Not authenticated, authorization required")]
    NotAuthenticated,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Timed out waiting for the authorization callback")]
    CallbackTimeout,

    #[error("Authorization wait cancelled by shutdown")]
    Cancelled,

    #[error("Invalid authorization endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AuthError {
    /// Whether the provider refused the credential itself, as opposed to a
    /// transient transport or server failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AuthError::Rejected { .. })
    }
}

/// Failures while fetching the device payload.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Device request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Device API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Device API returned malformed JSON ({source}): {body}")]
    Parse {
        source: serde_json::Error,
        body: String,
    },
}

/// Failures while writing a metric point.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Sink rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid sink endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failures while persisting credential state.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures while taking the per-state-file instance lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another agent already holds {0}")]
    AlreadyHeld(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
