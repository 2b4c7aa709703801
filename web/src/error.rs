use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = core::result::Result<T, Error>;

/// Reasons the web layer refuses to open a client stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// No provider API key was configured, so there is nothing to relay.
    UpstreamNotConfigured,
    /// The relay is shutting down and accepts no new clients.
    StreamStopped,
}

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        match self {
            Error::UpstreamNotConfigured => write!(fmt, "upstream stream is not configured"),
            Error::StreamStopped => write!(fmt, "stream relay is shutting down"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::UpstreamNotConfigured | Error::StreamStopped => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
            }
        }
    }
}
