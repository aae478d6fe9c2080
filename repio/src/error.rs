//! Error types for repio.

use std::fmt;
use std::io;

/// Errors surfaced by the engine outside of the per-I/O paths.
///
/// Per-I/O submission failures use [`crate::driver::SubmitError`] so that the
/// queue-full case stays distinguishable on the hot path.
#[derive(Debug)]
pub enum Error {
    /// IO error from a file descriptor or kernel interface.
    Io(io::Error),
    /// A configuration value failed validation before workers started.
    InvalidConfig(String),
    /// Queue pair allocation or setup failed during worker startup.
    QpairSetup(String),
    /// Queue pairs did not all connect within the startup window.
    ConnectTimeout,
    /// No driver is linked for the requested transport.
    DriverUnavailable(String),
    /// No usable target namespaces after registration.
    NoUsableNamespaces,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::QpairSetup(msg) => write!(f, "Queue pair setup failed: {}", msg),
            Error::ConnectTimeout => write!(f, "Timed out waiting for queue pairs to connect"),
            Error::DriverUnavailable(trtype) => {
                write!(f, "No driver available for transport '{}'", trtype)
            }
            Error::NoUsableNamespaces => write!(f, "No valid target namespaces found"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for repio operations.
pub type Result<T> = std::result::Result<T, Error>;
