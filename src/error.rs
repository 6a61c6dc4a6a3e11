//! Error types for the DisService client.

use thiserror::Error;

/// Errors surfaced by the DisService proxy client.
#[derive(Debug, Error)]
pub enum DisServiceError {
    /// A caller-supplied argument was rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error on one of the proxy sockets.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The proxy server closed the connection.
    #[error("connection closed by the proxy server")]
    ConnectionClosed,

    /// No response line arrived within the configured response timeout.
    #[error("timed out waiting for a response from the proxy server")]
    ResponseTimeout,

    /// The proxy server answered with an error status line.
    #[error("proxy server reported an error: {0}")]
    Remote(String),

    /// A proxy operation was invoked from inside a callback handler.
    ///
    /// The callback dispatch loop cannot acknowledge the current event
    /// while it waits on a command exchange, so this would deadlock.
    #[error("proxy operations cannot be invoked from inside a callback handler")]
    CalledFromCallback,

    /// The proxy has been shut down.
    #[error("proxy has been shut down")]
    Disposed,
}

impl DisServiceError {
    /// Whether this error means the command channel is unusable and the
    /// operation should be retried once the connection is re-established.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }
}

/// Result type alias using [`DisServiceError`].
pub type Result<T> = std::result::Result<T, DisServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failures_are_retryable() {
        let io = DisServiceError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(io.is_connection_failure());
        assert!(DisServiceError::ConnectionClosed.is_connection_failure());
    }

    #[test]
    fn test_non_connection_errors_are_terminal() {
        assert!(!DisServiceError::ResponseTimeout.is_connection_failure());
        assert!(!DisServiceError::Remote("ERROR".into()).is_connection_failure());
        assert!(!DisServiceError::InvalidArgument("groupName".into()).is_connection_failure());
        assert!(!DisServiceError::CalledFromCallback.is_connection_failure());
        assert!(!DisServiceError::Disposed.is_connection_failure());
    }

    #[test]
    fn test_error_display() {
        let err = DisServiceError::Remote("ERROR unknown group".into());
        assert_eq!(
            err.to_string(),
            "proxy server reported an error: ERROR unknown group"
        );
    }
}
