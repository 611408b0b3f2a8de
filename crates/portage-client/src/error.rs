//! Client-side error taxonomy.
//!
//! Connection and protocol failures propagate to the immediate caller and are
//! never retried inside the engine; retry is the task manager's caller's
//! decision. A handshake timeout deliberately conflates "server unreachable"
//! and "wrong passphrase": both look like silence on the wire.

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Local configuration problem, e.g. an empty passphrase.
    #[error("configuration: {0}")]
    Config(String),

    /// Dial, handshake or stream failure. Wrong key and unreachable server
    /// are indistinguishable here by design.
    #[error("connection: {0}")]
    Connection(String),

    /// The server answered, but not the way the protocol promises.
    #[error("protocol: server returned {status}: {message}")]
    Protocol { status: u16, message: String },

    /// The server refused a path that escapes its root.
    #[error("path rejected by server: {0}")]
    PathSafety(String),

    /// Local file I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Post-transfer checksum mismatch; the transfer counts as failed even
    /// though every chunk succeeded.
    #[error("integrity: checksum mismatch (remote {remote}, local {local})")]
    Integrity { remote: String, local: String },

    /// The operation observed its cancellation flag.
    #[error("canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a non-success server status into the taxonomy.
    pub(crate) fn from_status(status: StatusCode, message: String) -> Self {
        if status == StatusCode::FORBIDDEN {
            Error::PathSafety(message)
        } else {
            Error::Protocol {
                status: status.as_u16(),
                message,
            }
        }
    }

    pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
        Error::Connection(err.to_string())
    }
}
