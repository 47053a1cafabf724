//! Error taxonomy for the networking core.
use std::io;

use thiserror::Error;

/// Why a SOCKS4a handshake failed.
#[derive(Debug, Clone)]
pub enum SocksFailure {
    /// The proxy's reply was not exactly 8 bytes.
    MalformedReply { len: usize },
    /// The proxy returned a non-success status byte.
    Rejected { status: u8, destination: String },
}

impl std::fmt::Display for SocksFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedReply { len } => {
                write!(f, "malformed SOCKS4a reply ({len} bytes, expected 8)")
            }
            Self::Rejected { status, destination } => write!(
                f,
                "SOCKS4a proxy rejected connect to {destination} (status 0x{status:02X})"
            ),
        }
    }
}

/// Why a peer connection was closed. This is the single cause carried by
/// every `close`/`on_disconnect` upcall.
#[derive(Debug, Clone, Error)]
pub enum CloseCause {
    /// Kind 1: local I/O error (bind/connect/read/write failure not
    /// otherwise classified below).
    #[error("i/o error: {0}")]
    Io(#[from] IoCause),

    /// Kind 2: the remote end closed its side (EOF on read).
    #[error("connection closed by remote peer")]
    RemoteClosed,

    /// Kind 3: the SOCKS4a handshake failed.
    #[error("SOCKS4a handshake failed: {0}")]
    Socks(SocksFailure),

    /// Kind 4: the peer violated the application protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Kind 5: a bug — any other exception raised from message dispatch.
    #[error("internal error: {0}")]
    Internal(String),

    /// The handle was closed locally, by explicit request.
    #[error("closed locally: {0}")]
    Requested(&'static str),
}

/// A bare I/O error, wrapped so it can be cloned into a [`CloseCause`]
/// (callbacks may want to inspect the cause after the originating
/// `io::Error` has been consumed by the reactor).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct IoCause {
    pub message: String,
    pub kind: io::ErrorKind,
}

impl From<io::Error> for IoCause {
    fn from(err: io::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl From<io::Error> for CloseCause {
    fn from(err: io::Error) -> Self {
        Self::Io(IoCause::from(err))
    }
}

/// Framing codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer has no command token at all — a genuinely empty
    /// message. Only ever returned by `MessageBuffer::read_command`;
    /// see [`Self::MissingField`] for the same underlying "nothing left
    /// to read" condition occurring inside a recognized command's own
    /// fields.
    #[error("end of input")]
    EndOfInput,
    /// A recognized command's parser expected another field and found
    /// none. Distinct from [`Self::EndOfInput`] so a truncated `ping`/
    /// `pong`/etc. is reported as a malformed message rather than an
    /// empty one.
    #[error("missing required field")]
    MissingField,
    #[error("invalid utf-8 in field")]
    InvalidUtf8,
}
