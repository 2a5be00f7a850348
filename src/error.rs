//! The error taxonomy (kinds, not type names) from the design's error
//! handling section: one variant per distinguishable failure, carrying
//! just enough context to log or render a response.

/// Convenience alias, used throughout the crate's public signatures.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced anywhere in the hybrid processing core.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Malformed request line, malformed header, or any of the §4.6 size
    /// guards tripped. The connection is closed after a `400` is written.
    #[error("framing error: {0}")]
    Framing(String),

    /// Body exceeded the 50 MiB cap.
    #[error("request body too large ({len} bytes)")]
    RequestTooLarge {
        /// The size that tripped the guard.
        len: usize,
    },

    /// A handler panicked or returned an application error.
    #[error("handler exception: {0}")]
    HandlerException(String),

    /// The synchronous dispatch path, or a switch-out, exceeded its
    /// deadline.
    #[error("request timed out")]
    RequestTimeout,

    /// A switch-out's timer fired before its deferred operation did.
    /// The deferred operation itself keeps running; its result is
    /// dropped (see §5 Cancellation and timeouts).
    #[error("switch timed out")]
    SwitchTimeout,

    /// `active_switches` was already at `max_concurrent_switches`.
    #[error("too many concurrent switches")]
    TooManySwitches,

    /// No registered pattern matched the request path.
    #[error("no route for {0}")]
    NoRoute(String),

    /// A socket read or write failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// `AsyncContextManager::get` was called past `expires_at`.
    #[error("context expired or not found")]
    ContextExpired,

    /// The pool is shutting down and cannot accept new submissions.
    #[error("pool is shut down")]
    PoolShutDown,
}

impl Error {
    /// Maps framing/timeout/routing errors onto the status line a
    /// connection should receive. Handler-thrown errors are mapped to
    /// `500` by the caller (the container), not here, since it also needs
    /// to return the handler instance to its pool either way.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            Error::Framing(_) | Error::RequestTooLarge { .. } => http::StatusCode::BAD_REQUEST,
            Error::RequestTimeout => http::StatusCode::REQUEST_TIMEOUT,
            Error::HandlerException(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            Error::NoRoute(_) => http::StatusCode::NOT_FOUND,
            Error::TooManySwitches | Error::SwitchTimeout => http::StatusCode::SERVICE_UNAVAILABLE,
            Error::Transport(_) | Error::ContextExpired | Error::PoolShutDown => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// A short operator-facing label, used in log lines and stats, kept
/// distinct from `Display` (which is written for end users reading a
/// response body).
pub fn kind_label(err: &Error) -> &'static str {
    match err {
        Error::Framing(_) => "FramingError",
        Error::RequestTooLarge { .. } => "RequestTooLarge",
        Error::HandlerException(_) => "HandlerException",
        Error::RequestTimeout => "RequestTimeout",
        Error::SwitchTimeout => "SwitchTimeout",
        Error::TooManySwitches => "TooManySwitches",
        Error::NoRoute(_) => "NoRoute",
        Error::Transport(_) => "TransportError",
        Error::ContextExpired => "ContextExpired",
        Error::PoolShutDown => "PoolShutDown",
    }
}
