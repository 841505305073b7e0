//! Error types for the scatter protocol layers.
//!
//! Two families: [`Error`] covers codec/transport/lifecycle faults inside
//! the crate, while [`ForwardError`] carries the typed kind that rides the
//! forward protocol (dial failures map to `DialResponse` codes on the wire
//! and to HTTP statuses at the hub).

use std::io;

use thiserror::Error;

/// Errors produced by the scatter protocol and transport layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,

    #[error("broadcast error: {0}")]
    Broadcast(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<ciborium::de::Error<io::Error>> for Error {
    fn from(e: ciborium::de::Error<io::Error>) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for Error {
    fn from(e: ciborium::ser::Error<io::Error>) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns true for errors that just mean "the peer went away".
///
/// Duplex logs these at debug rather than error: a closed socket or a
/// broken pipe is the normal way a proxied connection ends.
pub fn is_disconnect(err: &Error) -> bool {
    match err {
        Error::Closed => true,
        Error::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// The typed kind attached to forwarding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardErrorKind {
    /// Uncategorised failure.
    Unknown,
    /// Bug or transport failure after a successful dial.
    Internal,
    /// DNS lookup for the target failed.
    FailedToResolveHost,
    /// Target refused, timed out, or is unreachable.
    HostUnreachable,
}

/// A forwarding failure carrying a [`ForwardErrorKind`] and its cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ForwardError {
    kind: ForwardErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ForwardError {
    pub fn new(kind: ForwardErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `source` with a message prefix and a kind.
    pub fn wrap(
        kind: ForwardErrorKind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn unknown(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::wrap(ForwardErrorKind::Unknown, "forwarding failed", source)
    }

    pub fn internal(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::wrap(ForwardErrorKind::Internal, "internal failure", source)
    }

    pub fn kind(&self) -> ForwardErrorKind {
        self.kind
    }
}

/// Extracts the forward error kind from an arbitrary error by walking the
/// wrapped-cause chain. Errors without a [`ForwardError`] anywhere in the
/// chain report [`ForwardErrorKind::Unknown`].
pub fn forward_kind(err: &(dyn std::error::Error + 'static)) -> ForwardErrorKind {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(fwd) = e.downcast_ref::<ForwardError>() {
            return fwd.kind();
        }
        current = e.source();
    }
    ForwardErrorKind::Unknown
}
