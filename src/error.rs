//! The error taxonomy shared by the wire codec, the type registry, and the connection engine.

use thiserror::Error;

/// Everything that can go wrong while parsing, encoding, or dispatching katcp messages.
#[derive(Error, Debug)]
pub enum KatcpError {
    /// The wire bytes did not form a syntactically valid katcp message.
    #[error("syntax error: {0}")]
    SyntaxError(String),

    /// A message name did not match the enum the caller tried to convert it into.
    #[error("unknown message name: {0}")]
    UnknownMessage(String),

    /// A message carried a kind (Request/Reply/Inform) that the target type doesn't support.
    #[error("message kind not supported by this type")]
    UnexpectedMessageKind,

    /// Too few arguments were present to fill a message's fields.
    #[error("missing argument")]
    MissingArgument,

    /// An argument was present but couldn't be parsed into its expected Rust type.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// A type was requested from, or registered into, the runtime type registry incorrectly.
    #[error("type registry error: {0}")]
    TypeRegistryError(String),

    /// An argument's bytes could not be decoded into the requested type.
    #[error("value decode error: {0}")]
    ValueDecodeError(String),

    /// A request's reply carried `!name fail ...`.
    #[error("request failed: {0}")]
    FailReply(String),

    /// A reply was structurally well formed but semantically unexpected.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// The underlying connection was lost while a request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// A request did not receive a reply within its deadline.
    #[error("request timed out")]
    Timeout,

    /// An I/O error bubbled up from the transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A bug, rather than a protocol or user error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<nom::Err<nom::error::Error<Vec<u8>>>> for KatcpError {
    fn from(e: nom::Err<nom::error::Error<Vec<u8>>>) -> Self {
        KatcpError::SyntaxError(e.to_string())
    }
}

pub type KatcpResult<T> = Result<T, KatcpError>;
