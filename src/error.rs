//! Typed error hierarchy for cachefetch
//!
//! Every error carries enough context to classify the failure and to decide
//! whether the job may be retried on a fresh transport.

use thiserror::Error;

/// Main error type for the download engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed URL or malformed HTTP response. Never retried.
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Connect/handshake/socket failure. Retryable while no response
    /// byte of the current attempt has been consumed.
    #[error("Transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        retryable: bool,
    },

    /// The item's sink hook reported a local write failure. Fatal, no
    /// retry: the problem is on our side, not the remote's.
    #[error("Sink error: {message}")]
    Sink { message: String },

    /// Policy decision terminated the job (redirect budget, status code,
    /// header rejection). Fatal with a distinguishable reason.
    #[error("Policy error: {kind:?}")]
    Policy { kind: PolicyErrorKind },

    /// No progress within the configured window. The transport is
    /// invalidated, never pooled.
    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// Invalid input from the caller, detected before any I/O
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Cancelled,
}

/// Transport error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// DNS resolution failed
    DnsResolution,
    /// TCP connect failed
    Connect,
    /// TLS handshake failed
    Tls,
    /// Read/write on an established connection failed
    Io,
    /// Peer closed the connection before the response completed
    UnexpectedEof,
}

/// Policy error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyErrorKind {
    /// Redirect budget exhausted
    TooManyRedirects,
    /// Terminal non-2xx, non-redirect status
    HttpStatus(u16),
    /// The item's header hook declined the download
    Aborted,
}

/// Terminal classification stored on a failed item.
///
/// This is the reason code callers map to exit classes; it deliberately
/// carries less detail than [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Malformed URL or response
    ParseError,
    /// Connection-level failure
    TransportError,
    /// Local sink refused data
    SinkError,
    /// Redirect budget exhausted
    TooManyRedirects,
    /// Terminal HTTP status outside the success range
    HttpStatus(u16),
    /// Header hook declined the download
    Aborted,
    /// No progress within the deadline
    Timeout,
    /// Engine shut down while the job was outstanding
    Cancelled,
}

/// Coarse outcome classes used by thin callers to pick an exit code.
///
/// 200 maps to success, >=500 to a server-side I/O class, 400-499 to an
/// access class, everything else to a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    ServerError,
    AccessDenied,
    Other,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200 => Self::Success,
            500.. => Self::ServerError,
            400..=499 => Self::AccessDenied,
            _ => Self::Other,
        }
    }
}

impl EngineError {
    /// Check whether a transparent retry on a fresh transport is allowed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    /// Create a transport error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        // A failed TLS negotiation against the same endpoint will fail
        // again; connect and socket-level failures are worth one more try.
        let retryable = matches!(
            kind,
            TransportErrorKind::Connect
                | TransportErrorKind::Io
                | TransportErrorKind::UnexpectedEof
        );
        Self::Transport {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a sink error
    pub fn sink(message: impl Into<String>) -> Self {
        Self::Sink {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// The reason code recorded on the item when this error fails a job
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Parse { .. } => FailureReason::ParseError,
            Self::Transport { .. } => FailureReason::TransportError,
            Self::Sink { .. } => FailureReason::SinkError,
            Self::Policy { kind } => match kind {
                PolicyErrorKind::TooManyRedirects => FailureReason::TooManyRedirects,
                PolicyErrorKind::HttpStatus(code) => FailureReason::HttpStatus(*code),
                PolicyErrorKind::Aborted => FailureReason::Aborted,
            },
            Self::Timeout { .. } => FailureReason::Timeout,
            Self::InvalidInput { .. } => FailureReason::ParseError,
            Self::Cancelled => FailureReason::Cancelled,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportErrorKind::UnexpectedEof,
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::Connect,
            _ => TransportErrorKind::Io,
        };
        Self::transport(kind, err.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }
}
