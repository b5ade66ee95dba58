//! Error types for the codec, the backend and the session layers.

use std::io;

use thiserror::Error;

use crate::protocol::MsgType;

/// Error string answered when a name does not resolve.
pub const NOT_FOUND: &str = "file not found";

/// The caller handed the codec a message that cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{msg}: required field `{field}` is unset")]
    MissingField {
        msg: MsgType,
        field: &'static str,
    },
    #[error("{0}: NOTAG is only legal during version negotiation")]
    ReservedTag(MsgType),
    #[error("{msg}: field `{field}` is {len} bytes, limit is 65535")]
    StringTooLong {
        msg: MsgType,
        field: &'static str,
        len: usize,
    },
    #[error("{msg}: {len} walk elements, limit is {max}")]
    TooManyWalkElements {
        msg: MsgType,
        len: usize,
        max: usize,
    },
    #[error("{msg}: payload of {len} bytes does not fit its count field")]
    PayloadTooLarge { msg: MsgType, len: usize },
    #[error("stat field `{field}` is {len} bytes, limit is 65535")]
    StatTooLarge { field: &'static str, len: usize },
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("directory entry of {len} bytes does not fit a read of {count}")]
    DirEntryTooLarge { len: usize, count: u32 },
}

/// The bytes do not form a valid frame.
///
/// Everything except [`DecodeError::Incomplete`] leaves the stream
/// desynchronized and is connection-fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("decoded message is invalid: {0}")]
    Invalid(#[from] EncodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// True when the frame is merely short and more bytes may complete it.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Incomplete { .. })
    }
}

/// A failure reported by a filesystem backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// An ordinary failure answered with an error response.
    #[error("{0}")]
    Domain(String),
    /// The backend cannot continue serving this connection.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl FsError {
    pub fn new(ename: impl Into<String>) -> Self {
        FsError::Domain(ename.into())
    }

    pub fn not_found() -> Self {
        Self::new(NOT_FOUND)
    }

    pub fn permission_denied() -> Self {
        Self::new("permission denied")
    }

    pub fn not_supported() -> Self {
        Self::new("operation not supported")
    }
}

/// Crate-level error for sessions and connections.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The peer answered with `Rerror`.
    #[error("{0}")]
    Remote(String),
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: MsgType, got: MsgType },
    #[error("{0}: file not found")]
    NotFound(String),
    #[error("connection closed")]
    Disconnected,
    #[error("request was flushed")]
    Flushed,
    #[error("{0}")]
    Protocol(String),
    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
