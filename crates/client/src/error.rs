//! Error types shared by the client components.

use thiserror::Error;

/// Shorthand for results produced by this crate.
pub type ClientResult<T> = Result<T, ClientError>;

/// The errors the client components recognize.
///
/// Transport-level failures and server-returned HTTP errors are retried by
/// the owning component; [`ClientError::Aborted`] is self-caused and not an
/// error from the caller's perspective.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure: connection, TLS, or reading the body.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success HTTP status.
    #[error("server returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// The in-flight request was aborted by `resend()` or `stop()`.
    #[error("request aborted")]
    Aborted,

    /// The client-side deadline elapsed before the server answered.
    #[error("request deadline exceeded")]
    Timeout,

    /// A body could not be encoded or decoded.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A request URL could not be constructed.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The durable store failed.
    #[error("store error: {0}")]
    Store(String),

    /// An extension with this name is already registered.
    #[error("extension `{0}` is already registered")]
    DuplicateExtension(String),

    /// A second background sender run was started while one is active.
    #[error("outgoing key request sender is already running")]
    SenderAlreadyRunning,
}

impl ClientError {
    /// The HTTP status attached to this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status } => Some(*status),
            Self::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this is the typed abort sentinel.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
