//! Error types for the live stream engine.
//!
//! Every variant here is contained by the controller loop: upstream failures are
//! logged and retried, never handed to subscribers.

use std::fmt;

/// Errors raised while connecting to or reading from the upstream feed.
#[derive(Debug)]
pub enum Error {
    /// The request could not be built or the network call failed before a
    /// response arrived.
    Connect(Box<dyn std::error::Error + Send + Sync>),

    /// The provider answered with something other than `200 OK`.
    UpstreamStatus { code: u16 },

    /// A frame in the current session was malformed or oversized.
    Parse(ParseError),

    /// Reading the response body failed mid-session.
    Stream(Box<dyn std::error::Error + Send + Sync>),

    /// The operation was abandoned because the root cancellation fired.
    Cancelled,

    /// A subscriber queue was full during broadcast; the payload was dropped
    /// for that subscriber only.
    SubscriberFull,
}

/// Framing errors. Fatal for the session that produced them only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    LineTooLong { limit: usize },
    InvalidUtf8,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connect(err) => write!(f, "upstream connect failed: {err}"),
            Error::UpstreamStatus { code } => write!(f, "unexpected upstream status code: {code}"),
            Error::Parse(err) => write!(f, "upstream frame rejected: {err}"),
            Error::Stream(err) => write!(f, "upstream read failed: {err}"),
            Error::Cancelled => write!(f, "upstream operation cancelled"),
            Error::SubscriberFull => write!(f, "subscriber queue full"),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::LineTooLong { limit } => {
                write!(f, "line exceeds maximum length of {limit} bytes")
            }
            ParseError::InvalidUtf8 => write!(f, "line is not valid UTF-8"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(err) | Error::Stream(err) => Some(err.as_ref()),
            Error::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Parse(err)
    }
}
