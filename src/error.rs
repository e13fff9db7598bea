//! Errors of the connection layer.
//!
//! Setup calls return [Error](crate::Error); failures of a running connection are reported
//! through its error callback as an [ErrorCode](crate::ErrorCode).

use std::{io, path::PathBuf, result};

use thiserror::Error;

/// Creates a [`crate::Error::Io`] with a custom message prefixed to the current
/// `errno` value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        $crate::Error::Io(::std::io::Error::new(errno.kind(), msg))
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Represents errors that can occur while setting up sockets, listeners and
/// TLS material.
///
/// Failures of an individual connection are never returned through this type;
/// they are reported once through the connection's error callback as an
/// [ErrorCode].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred on a socket or the poller.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The TLS library rejected a configuration or session.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// A certificate or private key could not be loaded.
    #[error("failed to load {}: {reason}", path.display())]
    Certificate {
        /// Path of the PEM file.
        path: PathBuf,
        /// Why the file was rejected.
        reason: String,
    },
    /// The configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A listener is already bound to the port.
    #[error("already listening on port {0}")]
    AlreadyListening(u16),
    /// A TLS listener was requested without certificate material configured.
    #[error("TLS requested but no certificate is configured")]
    TlsNotConfigured,
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Error {
        Error::Config(err.to_string())
    }
}

/// Terminal error of a connection, reported exactly once through its error
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    /// The socket or the name lookups could not be created.
    #[error("failed to initialize connection")]
    InitFailed,
    /// Neither an IPv4 nor an IPv6 address was found for the host.
    #[error("no such host")]
    NoSuchHost,
    /// Every candidate address refused or failed the connection attempt.
    #[error("failed to connect")]
    ConnectFailed,
    /// The peer closed the stream or a fatal I/O or TLS error occurred.
    #[error("connection closed")]
    ConnectionClosed,
    /// No data was read for the idle timeout and nobody holds the connection.
    #[error("connection closed after idle timeout")]
    AutoClosed,
}
