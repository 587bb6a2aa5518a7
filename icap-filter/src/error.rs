//! Error types for the ICAP filter library.
//!
//! Two families live here:
//! - [`ParseError`]: a malformed request. It is local to one message: the
//!   worker drops the message and keeps the connection.
//! - [`Error`]: infrastructure and handler faults (bind, accept, socket I/O,
//!   configuration, handler failures).

use std::fmt;

use thiserror::Error;

/// Kind tag of a malformed ICAP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    /// First line is missing or carries no `ICAP/` version marker.
    NoRequestLine,
    /// Method is not one of `OPTIONS`, `REQMOD`, `RESPMOD`.
    InvalidMethod,
    /// Header line without a `:` separator.
    MissingColon,
    /// `Encapsulated` entry whose offset is not a non-negative integer.
    UnparsableOffset,
    /// `Encapsulated` entry whose key is outside the fixed vocabulary.
    UnknownEncapsulationKey,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::NoRequestLine => "no request line",
            ParseErrorKind::InvalidMethod => "invalid method",
            ParseErrorKind::MissingColon => "missing colon in header",
            ParseErrorKind::UnparsableOffset => "unparsable encapsulation offset",
            ParseErrorKind::UnknownEncapsulationKey => "unknown encapsulation key",
        };
        f.write_str(s)
    }
}

/// States of the frame parser state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseState {
    AwaitingRequestLine,
    HeaderCollect,
    EncapsulatedTableParsed,
    EncapsulatedCollect,
    EncapsulatedBodyCollect,
    Completed,
    Failed,
}

/// A malformed ICAP request.
///
/// Carries the diagnostic kind, the state the parser was in when it gave up,
/// a short detail string and the raw text of the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed ICAP request ({kind}) in {state:?}: {detail}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub state: ParseState,
    pub detail: String,
    pub raw: String,
}

impl ParseError {
    pub(crate) fn new(
        kind: ParseErrorKind,
        state: ParseState,
        detail: impl Into<String>,
        raw: &[u8],
    ) -> Self {
        Self {
            kind,
            state,
            detail: detail.into(),
            raw: String::from_utf8_lossy(raw).into_owned(),
        }
    }
}

/// Infrastructure and handler errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket I/O failure on an established connection.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// The listening socket could not be created, bound or put into listen mode.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Fatal failure of the accept loop. Terminal for the acceptor.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// Invalid server or service configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An embedded HTTP header block could not be decoded.
    #[error("HTTP parsing error: {0}")]
    HttpParse(String),

    /// An ICAP response could not be read back from its wire form.
    #[error("Invalid ICAP response: {0}")]
    InvalidResponse(String),

    /// The external request handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A message could not be parsed.
    #[error(transparent)]
    Malformed(#[from] ParseError),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    pub fn http_parse(message: impl Into<String>) -> Self {
        Self::HttpParse(message.into())
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::Handler(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Self::Handler(err.to_string())
    }
}

/// Result of ICAP operations.
pub type IcapResult<T> = Result<T, Error>;
