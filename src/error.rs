use std::fmt;
use std::io;

use thiserror::Error;

use crate::ice::IceError;

/// Errors for the whole conference.
///
/// Every variant carries a human readable message. The numeric code, see
/// [`FsError::code()`], is stable and is also what travels in [`crate::Event::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FsError {
    /// An object could not be constructed.
    #[error("construction: {0}")]
    Construction(String),

    /// Internal inconsistency.
    #[error("internal: {0}")]
    Internal(String),

    /// The arguments of an operation were not valid. Fix and retry.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Socket level failure.
    #[error("network: {0}")]
    Network(String),

    /// The operation is not implemented for this kind of session.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Codec negotiation failed.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The codec is not known.
    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    /// There are no codecs.
    #[error("no codecs: {0}")]
    NoCodecs(String),

    /// All codecs were removed by negotiation.
    #[error("no codecs left: {0}")]
    NoCodecsLeft(String),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The object was destroyed.
    #[error("disposed: {0}")]
    Disposed(String),

    /// Something that can only exist once already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

/// Tag of an [`FsError`] without the message.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Construction,
    Internal,
    InvalidArguments,
    Network,
    NotImplemented,
    NegotiationFailed,
    UnknownCodec,
    NoCodecs,
    NoCodecsLeft,
    ConnectionFailed,
    Disposed,
    AlreadyExists,
}

impl ErrorKind {
    /// The error number.
    pub fn code(&self) -> u32 {
        use ErrorKind::*;
        match self {
            Construction => 1,
            Internal => 2,
            InvalidArguments => 100,
            Network => 101,
            NotImplemented => 102,
            NegotiationFailed => 103,
            UnknownCodec => 104,
            NoCodecs => 105,
            NoCodecsLeft => 106,
            ConnectionFailed => 107,
            Disposed => 108,
            AlreadyExists => 109,
        }
    }

    /// Inverse of [`ErrorKind::code()`].
    pub fn from_code(code: u32) -> Option<ErrorKind> {
        use ErrorKind::*;
        let k = match code {
            1 => Construction,
            2 => Internal,
            100 => InvalidArguments,
            101 => Network,
            102 => NotImplemented,
            103 => NegotiationFailed,
            104 => UnknownCodec,
            105 => NoCodecs,
            106 => NoCodecsLeft,
            107 => ConnectionFailed,
            108 => Disposed,
            109 => AlreadyExists,
            _ => return None,
        };
        Some(k)
    }

    /// Make an error of this kind.
    pub fn with_message(self, message: impl Into<String>) -> FsError {
        let m = message.into();
        use ErrorKind::*;
        match self {
            Construction => FsError::Construction(m),
            Internal => FsError::Internal(m),
            InvalidArguments => FsError::InvalidArguments(m),
            Network => FsError::Network(m),
            NotImplemented => FsError::NotImplemented(m),
            NegotiationFailed => FsError::NegotiationFailed(m),
            UnknownCodec => FsError::UnknownCodec(m),
            NoCodecs => FsError::NoCodecs(m),
            NoCodecsLeft => FsError::NoCodecsLeft(m),
            ConnectionFailed => FsError::ConnectionFailed(m),
            Disposed => FsError::Disposed(m),
            AlreadyExists => FsError::AlreadyExists(m),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorKind::*;
        let s = match self {
            Construction => "CONSTRUCTION",
            Internal => "INTERNAL",
            InvalidArguments => "INVALID_ARGUMENTS",
            Network => "NETWORK",
            NotImplemented => "NOT_IMPLEMENTED",
            NegotiationFailed => "NEGOTIATION_FAILED",
            UnknownCodec => "UNKNOWN_CODEC",
            NoCodecs => "NO_CODECS",
            NoCodecsLeft => "NO_CODECS_LEFT",
            ConnectionFailed => "CONNECTION_FAILED",
            Disposed => "DISPOSED",
            AlreadyExists => "ALREADY_EXISTS",
        };
        write!(f, "{}", s)
    }
}

impl FsError {
    /// The tag of this error.
    pub fn kind(&self) -> ErrorKind {
        use FsError::*;
        match self {
            Construction(_) => ErrorKind::Construction,
            Internal(_) => ErrorKind::Internal,
            InvalidArguments(_) => ErrorKind::InvalidArguments,
            Network(_) => ErrorKind::Network,
            NotImplemented(_) => ErrorKind::NotImplemented,
            NegotiationFailed(_) => ErrorKind::NegotiationFailed,
            UnknownCodec(_) => ErrorKind::UnknownCodec,
            NoCodecs(_) => ErrorKind::NoCodecs,
            NoCodecsLeft(_) => ErrorKind::NoCodecsLeft,
            ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Disposed(_) => ErrorKind::Disposed,
            AlreadyExists(_) => ErrorKind::AlreadyExists,
        }
    }

    /// The error number.
    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    /// The message without the tag.
    pub fn message(&self) -> &str {
        use FsError::*;
        match self {
            Construction(m) | Internal(m) | InvalidArguments(m) | Network(m)
            | NotImplemented(m) | NegotiationFailed(m) | UnknownCodec(m) | NoCodecs(m)
            | NoCodecsLeft(m) | ConnectionFailed(m) | Disposed(m) | AlreadyExists(m) => m,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> FsError {
        FsError::InvalidArguments(message.into())
    }

    pub(crate) fn disposed(what: &str) -> FsError {
        FsError::Disposed(format!("Called function after {} has been disposed", what))
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::Network(e.to_string())
    }
}

impl From<IceError> for FsError {
    fn from(e: IceError) -> Self {
        match e {
            IceError::Io(e) => FsError::Network(e.to_string()),
            IceError::Shutdown => FsError::Internal(e.to_string()),
            e => FsError::InvalidArguments(e.to_string()),
        }
    }
}
