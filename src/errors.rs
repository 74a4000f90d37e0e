//! Error types and transport-error categorization.
//!
//! Fatal errors (bad configuration, script load failures) use the crate
//! [`Error`] enum. Transport failures during a run are non-fatal; they are
//! classified into an [`ErrorKind`] whose label feeds the reporter's error
//! histogram.

use std::fmt;
use std::io;

use thiserror::Error;

/// Fatal errors: configuration and script loading.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("read {path}: {source}")]
    ReadScript {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cycle in load graph at {0}")]
    LoadCycle(String),

    #[error("load {path}: {message}")]
    Load { path: String, message: String },

    #[error("main function not found in {0}")]
    MissingMain(String),

    #[error("script error: {0}")]
    Script(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Categories of transport failures seen while driving the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Hostname resolution failures.
    Dns,

    /// TCP dial failures (refused, unreachable, reset during connect).
    Connect,

    /// TLS handshake failures.
    Tls,

    /// The per-request timeout elapsed.
    Timeout,

    /// Malformed or truncated HTTP responses.
    Protocol,

    /// Read/write failures on an established connection.
    Io,

    /// The stop signal fired before the request was issued.
    Canceled,
}

impl ErrorKind {
    /// Histogram label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Dns => "dns",
            ErrorKind::Connect => "connect",
            ErrorKind::Tls => "tls",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
            ErrorKind::Canceled => "canceled",
        }
    }

    /// Categorize an I/O error observed on an established connection.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => ErrorKind::Connect,
            _ => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A transport failure: the kind plus a human-readable message.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    pub fn io(context: &str, err: &io::Error) -> Self {
        TransportError {
            kind: ErrorKind::from_io(err),
            message: format!("{context}: {err}"),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_stable() {
        assert_eq!(ErrorKind::Dns.label(), "dns");
        assert_eq!(ErrorKind::Timeout.label(), "timeout");
        assert_eq!(ErrorKind::Protocol.label(), "protocol");
    }

    #[test]
    fn test_io_categorization() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(ErrorKind::from_io(&refused), ErrorKind::Connect);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(ErrorKind::from_io(&timed_out), ErrorKind::Timeout);

        let other = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(ErrorKind::from_io(&other), ErrorKind::Io);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(ErrorKind::Tls, "handshake failed");
        assert_eq!(err.to_string(), "tls: handshake failed");
    }
}
