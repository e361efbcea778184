//! # Error Definitions
//!
//! Failures of the wire protocol itself, and the transmissible description of
//! a failure that happened on the far side of the channel.

use neopack::Error as NeoError;

/// Operational failures while encoding or decoding frames.
#[derive(Debug, Clone)]
pub enum Error {
    /// The underlying neopack serialization failed (e.g., truncated buffer).
    Serialization(NeoError),
    /// A tag on the wire has no `Value` counterpart.
    UnsupportedTag(u8),
    /// An unknown frame type or error kind was encountered.
    UnknownVariant(String),
    /// The structure of the message was malformed (e.g., missing `id`).
    ProtocolViolation(String),
    /// The nested depth of a value exceeded the safety limit.
    RecursionLimitExceeded,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization failed: {}", e),
            Self::UnsupportedTag(tag) => write!(f, "unsupported tag on the wire: {:#04x}", tag),
            Self::UnknownVariant(name) => write!(f, "unknown variant: {}", name),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::RecursionLimitExceeded => write!(f, "value nested too deeply"),
        }
    }
}

impl std::error::Error for Error {}

impl From<NeoError> for Error {
    fn from(e: NeoError) -> Self { Self::Serialization(e) }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a remote failure.
///
/// Travels on the wire as a unit variant tag, so the set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The method is not part of the dispatch table.
    MethodNotFound,
    /// The arguments did not match what the method expects.
    BadArguments,
    /// The wasm module trapped.
    Trapped,
    /// A host operation (storage) failed while the call was suspended.
    Host,
    /// The suspend/resume protocol was misused; the instance is unusable.
    Bridge,
    /// The request could not be decoded.
    Protocol,
    /// The method panicked.
    Panicked,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::MethodNotFound => "NoMethod",
            Self::BadArguments => "BadArgs",
            Self::Trapped => "Trapped",
            Self::Host => "Host",
            Self::Bridge => "Bridge",
            Self::Protocol => "Protocol",
            Self::Panicked => "Panicked",
            Self::Internal => "Internal",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "NoMethod" => Ok(Self::MethodNotFound),
            "BadArgs" => Ok(Self::BadArguments),
            "Trapped" => Ok(Self::Trapped),
            "Host" => Ok(Self::Host),
            "Bridge" => Ok(Self::Bridge),
            "Protocol" => Ok(Self::Protocol),
            "Panicked" => Ok(Self::Panicked),
            "Internal" => Ok(Self::Internal),
            _ => Err(Error::UnknownVariant(format!("error kind: {}", tag))),
        }
    }
}

/// The "Err" side of a response: a failure of the remote method itself.
///
/// Distinct from `Error`, which is the wire failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("no such method: {}", method))
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArguments, message)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_tag(), self.message)
    }
}

impl std::error::Error for RemoteError {}
